pub mod memory;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use thiserror::Error;
use uuid::Uuid;

/// Enumeration of errors for operations with the broker queue.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("{command} query failed with: {error}")]
    Query {
        command: String,
        error: sqlx::Error,
    },
    #[error("message {0} is not in flight, cannot finalize it")]
    NotInFlight(i64),
    #[error("broker rejected the operation: {0}")]
    Broker(String),
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// A message handed out by the broker, with the metadata the processor
/// bases its decisions on.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-internal receipt used to finalize this delivery.
    pub receipt: i64,
    /// Stable upstream message identifier, the deduplication key.
    pub message_id: String,
    /// Number of *prior* delivery attempts: 0 on the first delivery.
    pub delivery_count: i32,
    /// The raw payload.
    pub body: Vec<u8>,
}

/// Narrow capability interface over the broker. Transport (cloud queue,
/// on-prem broker) is an implementation detail behind this trait.
///
/// There is deliberately no "abandon" operation: taking no action after a
/// receive lets the message lock expire, which is the retry signal.
#[async_trait]
pub trait MessageSource {
    /// Receive at most one message. `None` means the queue is empty (a
    /// receive that timed out counts as empty, not as an error).
    async fn receive(&self) -> QueueResult<Option<Delivery>>;

    /// Permanently remove a delivered message from the queue.
    async fn acknowledge(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Move a delivered message to the dead-letter side channel.
    async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: &str,
        description: &str,
    ) -> QueueResult<()>;
}

/// A peek-lock queue implemented on top of a PostgreSQL table.
///
/// Receiving locks the row for `lock_duration` and bumps its delivery count.
/// An acknowledged or dead-lettered row is terminal; a row whose lock expires
/// without finalization becomes available again and will be redelivered.
pub struct PgQueue {
    queue: String,
    lock_seconds: f64,
    pool: PgPool,
}

impl PgQueue {
    pub fn from_pool(queue: &str, pool: PgPool, lock_seconds: f64) -> Self {
        Self {
            queue: queue.to_owned(),
            lock_seconds,
            pool,
        }
    }

    /// Enqueue a raw payload, assigning it a fresh message id.
    pub async fn enqueue(&self, body: &[u8]) -> QueueResult<String> {
        let query = r#"
INSERT INTO queue_messages (message_id, queue, body)
VALUES ($1, $2, $3)
        "#;

        let message_id = Uuid::new_v4().to_string();
        sqlx::query(query)
            .bind(&message_id)
            .bind(&self.queue)
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::Query {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(message_id)
    }

    /// Look up the dead-letter metadata of a message, for tests and tooling.
    pub async fn dead_letter_entry(
        &self,
        message_id: &str,
    ) -> QueueResult<Option<(String, String)>> {
        let query = r#"
SELECT dead_letter_reason, dead_letter_description
FROM queue_messages
WHERE message_id = $1 AND status = 'dead_lettered'
        "#;

        let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(query)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| QueueError::Query {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(row.map(|(reason, description)| {
            (reason.unwrap_or_default(), description.unwrap_or_default())
        }))
    }
}

#[async_trait]
impl MessageSource for PgQueue {
    async fn receive(&self) -> QueueResult<Option<Delivery>> {
        let query = r#"
WITH next_message AS (
    SELECT
        id
    FROM
        queue_messages
    WHERE
        queue = $1
        AND (
            status = 'available'
            OR (status = 'in_flight' AND locked_until <= NOW())
        )
    ORDER BY
        id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    queue_messages
SET
    status = 'in_flight'::queue_message_status,
    locked_until = NOW() + make_interval(secs => $2),
    delivery_count = queue_messages.delivery_count + 1
FROM
    next_message
WHERE
    queue_messages.id = next_message.id
RETURNING
    queue_messages.id,
    queue_messages.message_id,
    queue_messages.delivery_count,
    queue_messages.body
        "#;

        let row: Option<(i64, String, i32, Vec<u8>)> = sqlx::query_as(query)
            .bind(&self.queue)
            .bind(self.lock_seconds)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| QueueError::Query {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(row.map(|(receipt, message_id, delivery_count, body)| Delivery {
            receipt,
            message_id,
            // The column counts the in-flight attempt too; callers see prior attempts.
            delivery_count: delivery_count - 1,
            body,
        }))
    }

    async fn acknowledge(&self, delivery: &Delivery) -> QueueResult<()> {
        let query = r#"
UPDATE queue_messages
SET
    status = 'completed'::queue_message_status,
    completed_at = NOW(),
    locked_until = NULL
WHERE
    id = $1
    AND status = 'in_flight'::queue_message_status
        "#;

        let result = sqlx::query(query)
            .bind(delivery.receipt)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::Query {
                command: "UPDATE".to_owned(),
                error,
            })?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotInFlight(delivery.receipt));
        }

        Ok(())
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: &str,
        description: &str,
    ) -> QueueResult<()> {
        let query = r#"
UPDATE queue_messages
SET
    status = 'dead_lettered'::queue_message_status,
    dead_lettered_at = NOW(),
    dead_letter_reason = $2,
    dead_letter_description = $3,
    locked_until = NULL
WHERE
    id = $1
    AND status = 'in_flight'::queue_message_status
        "#;

        let result = sqlx::query(query)
            .bind(delivery.receipt)
            .bind(reason)
            .bind(description)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::Query {
                command: "UPDATE".to_owned(),
                error,
            })?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotInFlight(delivery.receipt));
        }

        Ok(())
    }
}
