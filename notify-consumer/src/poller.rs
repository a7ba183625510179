use std::time;

use notify_common::health::HealthHandle;
use notify_common::queue::MessageSource;
use notify_common::store::NotificationStore;
use tracing::{debug, error, info};

use crate::lock::PgTaskLock;
use crate::processor::{MessageProcessor, PollOutcome};

/// Drain the queue through `processor` until it reports empty.
///
/// A receive failure ends the cycle early; the messages left behind are
/// picked up by the next scheduled run. Returns how many messages were
/// processed this cycle.
pub async fn drain<S, N>(processor: &MessageProcessor<S, N>) -> usize
where
    S: MessageSource,
    N: NotificationStore,
{
    let mut processed = 0;

    loop {
        match processor.process_next().await {
            Ok(PollOutcome::QueueEmpty) => break,
            Ok(PollOutcome::Processed(_)) => processed += 1,
            Err(e) => {
                error!("receive failed, stopping this poll cycle: {}", e);
                break;
            }
        }
    }

    processed
}

/// Scheduled task that drains the notification queue, serialized across the
/// fleet by a distributed lock so only one instance is draining at a time.
pub struct PollTask<S, N> {
    processor: MessageProcessor<S, N>,
    lock: PgTaskLock,
    poll_interval: time::Duration,
    liveness: HealthHandle,
}

impl<S, N> PollTask<S, N>
where
    S: MessageSource,
    N: NotificationStore,
{
    pub fn new(
        processor: MessageProcessor<S, N>,
        lock: PgTaskLock,
        poll_interval: time::Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            processor,
            lock,
            poll_interval,
            liveness,
        }
    }

    /// Run forever on the configured schedule.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy();

            let guard = match self.lock.try_acquire().await {
                Ok(Some(guard)) => guard,
                Ok(None) => {
                    debug!("another instance is draining the queue, skipping this tick");
                    continue;
                }
                Err(e) => {
                    error!("could not take the poll lock: {}", e);
                    continue;
                }
            };

            let processed = drain(&self.processor).await;
            if processed > 0 {
                info!(processed, "poll cycle finished");
            }

            if let Err(e) = guard.release().await {
                // The lock dies with the connection, so the next cycle is
                // not blocked; still worth a trace.
                error!("failed to release the poll lock: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::MessageProcessor;
    use crate::test_support::MemoryStore;
    use notify_common::queue::memory::InMemoryQueue;

    fn valid_body(dcn: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "zip_file_name": "1283_24-02-2024-10-31-32.zip",
            "document_control_number": dcn,
            "error_code": "ERR_ZIP_PROCESSING_FAILED",
            "error_description": "Corrupt archive",
            "service": "probate_frontend"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn drains_until_the_queue_is_empty() {
        let queue = InMemoryQueue::new();
        queue.push("msg-1", &valid_body("61001"));
        queue.push("msg-2", b"not json");
        queue.push("msg-3", &valid_body("61003"));
        let processor = MessageProcessor::new(queue, MemoryStore::new(), 10);

        let processed = drain(&processor).await;

        // All three were processed, the malformed one included.
        assert_eq!(processed, 3);
        assert_eq!(drain(&processor).await, 0);
    }

    #[tokio::test]
    async fn a_receive_failure_stops_the_cycle_without_panicking() {
        let queue = InMemoryQueue::new();
        queue.fail_next_receive();
        queue.push("msg-1", &valid_body("61001"));
        let processor = MessageProcessor::new(queue, MemoryStore::new(), 10);

        // First cycle hits the injected failure and stops early.
        assert_eq!(drain(&processor).await, 0);

        // The next cycle starts fresh and picks the message up.
        assert_eq!(drain(&processor).await, 1);
    }
}
