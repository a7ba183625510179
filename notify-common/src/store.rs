use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPool;
use thiserror::Error;

use crate::codec::ErrorNotification;

/// Enumeration of errors for operations with the notification store.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{command} query failed with: {error}")]
    Query {
        command: String,
        error: sqlx::Error,
    },
    /// The message id was already recorded by a previous processing attempt.
    /// Not a fault: this is how at-least-once redelivery surfaces at insert time.
    #[error("a notification for this message id already exists")]
    Duplicate,
}

/// Lifecycle status of a stored notification.
/// Pending: recorded, waiting to be pushed to the supplier.
/// Sent: accepted by the supplier, confirmation id assigned.
/// Failed: the supplier rejected it and no retry will help.
/// ManuallyHandled: an operator resolved it outside the pipeline; never set here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(type_name = "notification_status")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
    ManuallyHandled,
}

/// A notification as persisted. `error_description` holds the full, untruncated
/// text; truncation happens only at the exposure boundary.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NotificationRecord {
    pub id: i64,
    pub notification_id: Option<String>,
    pub message_id: String,
    pub zip_file_name: String,
    pub po_box: Option<String>,
    pub container: Option<String>,
    pub service: String,
    pub document_control_number: Option<String>,
    pub error_code: String,
    pub error_description: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: NotificationStatus,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable record of inbound error notifications with a status lifecycle.
///
/// `insert` is the only creation path and always starts a record as Pending.
/// The status transitions use compare-and-set semantics: a transition that
/// matches no row is a no-op reported as `false`, never an error.
#[async_trait]
pub trait NotificationStore {
    /// Insert a new Pending record for `event`, keyed by the broker message id.
    /// Returns the assigned internal id, or [`StoreError::Duplicate`] when a
    /// record for `message_id` already exists.
    async fn insert(&self, event: &ErrorNotification, message_id: &str) -> StoreResult<i64>;

    /// All records still Pending with no confirmation id, oldest first.
    async fn find_pending(&self) -> StoreResult<Vec<NotificationRecord>>;

    /// Transition Pending -> Sent, recording the supplier confirmation id and
    /// the processing timestamp together.
    async fn mark_sent(&self, id: i64, confirmation_id: &str) -> StoreResult<bool>;

    /// Transition Pending -> Failed, recording the processing timestamp.
    async fn mark_failed(&self, id: i64) -> StoreResult<bool>;

    async fn find(&self, id: i64) -> StoreResult<Option<NotificationRecord>>;

    async fn find_by_file(
        &self,
        zip_file_name: &str,
        service: &str,
    ) -> StoreResult<Vec<NotificationRecord>>;
}

/// The production store, backed by the `notifications` table in PostgreSQL.
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db_error)
            if db_error.kind() == sqlx::error::ErrorKind::UniqueViolation
    )
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn insert(&self, event: &ErrorNotification, message_id: &str) -> StoreResult<i64> {
        let query = r#"
INSERT INTO notifications
    (message_id, zip_file_name, po_box, container, service, document_control_number, error_code, error_description)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8)
RETURNING
    id
        "#;

        let (id,): (i64,) = sqlx::query_as(query)
            .bind(message_id)
            .bind(&event.zip_file_name)
            .bind(&event.po_box)
            .bind(&event.container)
            .bind(&event.service)
            .bind(&event.document_control_number)
            .bind(event.error_code.to_string())
            .bind(&event.error_description)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| {
                if is_unique_violation(&error) {
                    StoreError::Duplicate
                } else {
                    StoreError::Query {
                        command: "INSERT".to_owned(),
                        error,
                    }
                }
            })?;

        Ok(id)
    }

    async fn find_pending(&self) -> StoreResult<Vec<NotificationRecord>> {
        let query = r#"
SELECT * FROM notifications
WHERE status = 'pending' AND notification_id IS NULL
ORDER BY id
        "#;

        sqlx::query_as(query)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "SELECT".to_owned(),
                error,
            })
    }

    async fn mark_sent(&self, id: i64, confirmation_id: &str) -> StoreResult<bool> {
        let query = r#"
UPDATE notifications
SET
    status = 'sent'::notification_status,
    notification_id = $2,
    processed_at = NOW()
WHERE
    id = $1
    AND status = 'pending'::notification_status
        "#;

        let result = sqlx::query(query)
            .bind(id)
            .bind(confirmation_id)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, id: i64) -> StoreResult<bool> {
        let query = r#"
UPDATE notifications
SET
    status = 'failed'::notification_status,
    processed_at = NOW()
WHERE
    id = $1
    AND status = 'pending'::notification_status
        "#;

        let result = sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected() > 0)
    }

    async fn find(&self, id: i64) -> StoreResult<Option<NotificationRecord>> {
        sqlx::query_as("SELECT * FROM notifications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "SELECT".to_owned(),
                error,
            })
    }

    async fn find_by_file(
        &self,
        zip_file_name: &str,
        service: &str,
    ) -> StoreResult<Vec<NotificationRecord>> {
        sqlx::query_as(
            "SELECT * FROM notifications WHERE zip_file_name = $1 AND service = $2 ORDER BY id",
        )
        .bind(zip_file_name)
        .bind(service)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "SELECT".to_owned(),
            error,
        })
    }
}
