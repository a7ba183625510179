use notify_common::codec::{self, CodecError};
use notify_common::queue::{Delivery, MessageSource, QueueError};
use notify_common::store::{NotificationStore, StoreError};
use tracing::{error, info, warn};

pub const DEAD_LETTER_REASON_PROCESSING_ERROR: &str = "processing error";
pub const DEAD_LETTER_DESCRIPTION_PROCESSING_ERROR: &str =
    "unrecoverable message processing failure";
pub const DEAD_LETTER_REASON_TOO_MANY_DELIVERIES: &str = "too many deliveries";

/// What happened while parsing and persisting one message.
#[derive(Debug)]
enum HandleOutcome {
    /// Record durably created.
    Success { id: i64 },
    /// The payload itself is invalid; redelivery cannot fix it.
    Unrecoverable(CodecError),
    /// A record for this message id already exists.
    Duplicate,
    /// Transient infrastructure fault; redelivery may succeed.
    Recoverable(StoreError),
}

/// The terminal broker action for one received message.
///
/// `LeaveInFlight` is a deliberate non-action: the message lock is left to
/// expire so the broker redelivers later. It is named so that callers and
/// tests can assert on "no broker call was made".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeAction {
    Acknowledge,
    DeadLetter { reason: String, description: String },
    LeaveInFlight,
}

/// Result of one `process_next` invocation.
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing was available; no side effects took place.
    QueueEmpty,
    /// One message was processed to the contained terminal action.
    Processed(FinalizeAction),
}

/// Turns one possibly-redelivered queue message into exactly one terminal
/// broker action. Failures during parse and persist never escape a single
/// message; only a failure of the receive call itself propagates, stopping
/// the current poll cycle.
pub struct MessageProcessor<S, N> {
    source: S,
    store: N,
    max_delivery_count: i32,
}

impl<S, N> MessageProcessor<S, N>
where
    S: MessageSource,
    N: NotificationStore,
{
    pub fn new(source: S, store: N, max_delivery_count: i32) -> Self {
        Self {
            source,
            store,
            max_delivery_count,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Receive and process at most one message.
    pub async fn process_next(&self) -> Result<PollOutcome, QueueError> {
        let Some(delivery) = self.source.receive().await? else {
            return Ok(PollOutcome::QueueEmpty);
        };

        let outcome = self.handle(&delivery).await;
        let action = decide(&outcome, &delivery, self.max_delivery_count);

        match &outcome {
            HandleOutcome::Success { id } => {
                info!(
                    message_id = %delivery.message_id,
                    notification_id = id,
                    "notification recorded"
                );
                metrics::counter!("notification_messages_recorded_total").increment(1);
            }
            HandleOutcome::Unrecoverable(e) => {
                warn!(
                    message_id = %delivery.message_id,
                    "dead-lettering malformed message: {}", e
                );
                metrics::counter!("notification_messages_rejected_total").increment(1);
            }
            HandleOutcome::Duplicate if delivery.delivery_count == 0 => {
                // A duplicate key on the very first delivery means the broker
                // and the store disagree about history. Surface it for an
                // operator; the redelivery will be absorbed by the
                // duplicate-on-redelivery branch below.
                error!(
                    message_id = %delivery.message_id,
                    "duplicate notification on first delivery, broker and store are out of sync"
                );
                metrics::counter!("notification_messages_duplicate_anomalies_total").increment(1);
            }
            HandleOutcome::Duplicate => {
                info!(
                    message_id = %delivery.message_id,
                    delivery_count = delivery.delivery_count,
                    "redelivery of an already recorded message, completing it"
                );
                metrics::counter!("notification_messages_duplicate_total").increment(1);
            }
            HandleOutcome::Recoverable(e) => {
                warn!(
                    message_id = %delivery.message_id,
                    delivery_count = delivery.delivery_count,
                    "processing failed, may recover on redelivery: {}", e
                );
                metrics::counter!("notification_messages_deferred_total").increment(1);
            }
        }

        self.finalize(&delivery, &action).await;

        Ok(PollOutcome::Processed(action))
    }

    /// Parse and persist one message body.
    async fn handle(&self, delivery: &Delivery) -> HandleOutcome {
        let event = match codec::decode(&delivery.body) {
            Ok(event) => event,
            Err(e) => return HandleOutcome::Unrecoverable(e),
        };

        match self.store.insert(&event, &delivery.message_id).await {
            Ok(id) => HandleOutcome::Success { id },
            Err(StoreError::Duplicate) => HandleOutcome::Duplicate,
            Err(e) => HandleOutcome::Recoverable(e),
        }
    }

    /// Execute the terminal broker action. A failure here is logged and
    /// swallowed: one message's broker trouble must never stop the queue
    /// from being drained by subsequent polls.
    async fn finalize(&self, delivery: &Delivery, action: &FinalizeAction) {
        let result = match action {
            FinalizeAction::Acknowledge => self.source.acknowledge(delivery).await,
            FinalizeAction::DeadLetter {
                reason,
                description,
            } => {
                metrics::counter!("notification_messages_dead_lettered_total").increment(1);
                self.source.dead_letter(delivery, reason, description).await
            }
            FinalizeAction::LeaveInFlight => return,
        };

        if let Err(e) = result {
            error!(
                message_id = %delivery.message_id,
                "failed to finalize message, its lock will expire on its own: {}", e
            );
        }
    }
}

/// The decision table: processing outcome plus broker-reported delivery
/// count map to exactly one terminal action.
fn decide(outcome: &HandleOutcome, delivery: &Delivery, max_delivery_count: i32) -> FinalizeAction {
    match outcome {
        HandleOutcome::Success { .. } => FinalizeAction::Acknowledge,
        HandleOutcome::Unrecoverable(_) => FinalizeAction::DeadLetter {
            reason: DEAD_LETTER_REASON_PROCESSING_ERROR.to_owned(),
            description: DEAD_LETTER_DESCRIPTION_PROCESSING_ERROR.to_owned(),
        },
        HandleOutcome::Duplicate => {
            if delivery.delivery_count == 0 {
                // Anomalous: surfaced by the caller, no broker action taken.
                FinalizeAction::LeaveInFlight
            } else {
                // Harmless redelivery of work already durably completed.
                FinalizeAction::Acknowledge
            }
        }
        HandleOutcome::Recoverable(_) => {
            let attempts = delivery.delivery_count + 1;
            if attempts < max_delivery_count {
                FinalizeAction::LeaveInFlight
            } else {
                FinalizeAction::DeadLetter {
                    reason: DEAD_LETTER_REASON_TOO_MANY_DELIVERIES.to_owned(),
                    description: format!("Message delivered {} times", attempts),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryStore;
    use notify_common::queue::memory::{BrokerAction, InMemoryQueue};
    use notify_common::store::NotificationStatus;

    const MAX_DELIVERY_COUNT: i32 = 10;

    fn valid_body() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "zip_file_name": "1283_24-02-2024-10-31-32.zip",
            "po_box": "PO 12625",
            "container": "probate",
            "document_control_number": "6100909112925211",
            "error_code": "ERR_AV_FAILED",
            "error_description": "Antivirus scan failed",
            "service": "probate_frontend"
        }))
        .unwrap()
    }

    fn processor(
        queue: InMemoryQueue,
        store: MemoryStore,
    ) -> MessageProcessor<InMemoryQueue, MemoryStore> {
        MessageProcessor::new(queue, store, MAX_DELIVERY_COUNT)
    }

    #[tokio::test]
    async fn an_empty_queue_has_no_side_effects() {
        let processor = processor(InMemoryQueue::new(), MemoryStore::new());

        let outcome = processor.process_next().await.unwrap();

        assert_eq!(outcome, PollOutcome::QueueEmpty);
        assert!(processor.source().actions().is_empty());
    }

    #[tokio::test]
    async fn a_valid_message_is_recorded_and_acknowledged() {
        let queue = InMemoryQueue::new();
        queue.push("msg-1", &valid_body());
        let processor = processor(queue, MemoryStore::new());

        let outcome = processor.process_next().await.unwrap();

        assert_eq!(outcome, PollOutcome::Processed(FinalizeAction::Acknowledge));
        assert_eq!(
            processor.source().actions(),
            vec![BrokerAction::Acknowledged {
                message_id: "msg-1".to_owned()
            }]
        );

        let records = processor.store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, NotificationStatus::Pending);
        assert_eq!(records[0].message_id, "msg-1");
        assert_eq!(records[0].notification_id, None);
        assert_eq!(records[0].processed_at, None);
    }

    #[tokio::test]
    async fn malformed_payloads_are_dead_lettered_without_a_store_row() {
        let malformed: Vec<Vec<u8>> = vec![
            b"not json".to_vec(),
            serde_json::to_vec(&serde_json::json!({
                "error_code": "ERR_AV_FAILED",
                "error_description": "x",
                "service": "probate_frontend"
            }))
            .unwrap(),
            serde_json::to_vec(&serde_json::json!({
                "zip_file_name": "a.zip",
                "error_code": "ERR_NOT_A_CODE",
                "error_description": "x",
                "service": "probate_frontend"
            }))
            .unwrap(),
        ];

        for body in malformed {
            let queue = InMemoryQueue::new();
            queue.push("msg-1", &body);
            let processor = processor(queue, MemoryStore::new());

            let outcome = processor.process_next().await.unwrap();

            assert_eq!(
                outcome,
                PollOutcome::Processed(FinalizeAction::DeadLetter {
                    reason: DEAD_LETTER_REASON_PROCESSING_ERROR.to_owned(),
                    description: DEAD_LETTER_DESCRIPTION_PROCESSING_ERROR.to_owned(),
                })
            );
            assert_eq!(
                processor.source().actions(),
                vec![BrokerAction::DeadLettered {
                    message_id: "msg-1".to_owned(),
                    reason: DEAD_LETTER_REASON_PROCESSING_ERROR.to_owned(),
                    description: DEAD_LETTER_DESCRIPTION_PROCESSING_ERROR.to_owned(),
                }]
            );
            assert!(processor.store.records().is_empty());
        }
    }

    #[tokio::test]
    async fn malformed_payloads_skip_the_delivery_count_threshold() {
        // Dead-letter immediately even on a first delivery.
        let queue = InMemoryQueue::new();
        queue.push("msg-1", b"not json");
        let processor = processor(queue, MemoryStore::new());

        let outcome = processor.process_next().await.unwrap();

        assert!(matches!(
            outcome,
            PollOutcome::Processed(FinalizeAction::DeadLetter { .. })
        ));
    }

    #[tokio::test]
    async fn a_redelivered_duplicate_is_acknowledged_without_a_new_row() {
        let store = MemoryStore::new();
        let queue = InMemoryQueue::new();
        queue.push("msg-1", &valid_body());
        // The same message comes back as a redelivery.
        queue.push_redelivered("msg-1", &valid_body(), 1);
        let processor = processor(queue, store);

        processor.process_next().await.unwrap();
        let outcome = processor.process_next().await.unwrap();

        assert_eq!(outcome, PollOutcome::Processed(FinalizeAction::Acknowledge));
        assert_eq!(processor.store.records().len(), 1);
        assert_eq!(
            processor.source().actions(),
            vec![
                BrokerAction::Acknowledged {
                    message_id: "msg-1".to_owned()
                },
                BrokerAction::Acknowledged {
                    message_id: "msg-1".to_owned()
                },
            ]
        );
    }

    #[tokio::test]
    async fn a_duplicate_on_first_delivery_takes_no_broker_action() {
        let store = MemoryStore::new();
        let queue = InMemoryQueue::new();
        queue.push("msg-1", &valid_body());
        // Anomaly: the store already knows this id, yet the broker claims
        // this is the first delivery.
        queue.push("msg-1", &valid_body());
        let processor = processor(queue, store);

        processor.process_next().await.unwrap();
        let outcome = processor.process_next().await.unwrap();

        assert_eq!(
            outcome,
            PollOutcome::Processed(FinalizeAction::LeaveInFlight)
        );
        assert_eq!(processor.store.records().len(), 1);
        // Only the first message was finalized.
        assert_eq!(
            processor.source().actions(),
            vec![BrokerAction::Acknowledged {
                message_id: "msg-1".to_owned()
            }]
        );
    }

    #[tokio::test]
    async fn a_transient_failure_below_the_threshold_retries_silently() {
        let store = MemoryStore::new();
        store.fail_inserts();
        let queue = InMemoryQueue::new();
        queue.push_redelivered("msg-1", &valid_body(), MAX_DELIVERY_COUNT - 2);
        let processor = processor(queue, store);

        let outcome = processor.process_next().await.unwrap();

        assert_eq!(
            outcome,
            PollOutcome::Processed(FinalizeAction::LeaveInFlight)
        );
        assert!(processor.source().actions().is_empty());
        assert!(processor.store.records().is_empty());
    }

    #[tokio::test]
    async fn a_transient_failure_at_the_threshold_dead_letters_with_the_count() {
        let store = MemoryStore::new();
        store.fail_inserts();
        let queue = InMemoryQueue::new();
        queue.push_redelivered("msg-1", &valid_body(), MAX_DELIVERY_COUNT - 1);
        let processor = processor(queue, store);

        let outcome = processor.process_next().await.unwrap();

        let expected_description = format!("Message delivered {} times", MAX_DELIVERY_COUNT);
        assert_eq!(
            outcome,
            PollOutcome::Processed(FinalizeAction::DeadLetter {
                reason: DEAD_LETTER_REASON_TOO_MANY_DELIVERIES.to_owned(),
                description: expected_description.clone(),
            })
        );
        assert_eq!(
            processor.source().actions(),
            vec![BrokerAction::DeadLettered {
                message_id: "msg-1".to_owned(),
                reason: DEAD_LETTER_REASON_TOO_MANY_DELIVERIES.to_owned(),
                description: expected_description,
            }]
        );
    }

    #[tokio::test]
    async fn a_finalize_failure_is_swallowed() {
        let queue = InMemoryQueue::new();
        queue.push("msg-1", &valid_body());
        queue.fail_finalize();
        let processor = processor(queue, MemoryStore::new());

        // The acknowledge fails, but process_next still reports the action
        // it decided on and does not propagate the broker error.
        let outcome = processor.process_next().await.unwrap();

        assert_eq!(outcome, PollOutcome::Processed(FinalizeAction::Acknowledge));
        assert_eq!(processor.store.records().len(), 1);
    }

    #[tokio::test]
    async fn a_receive_failure_propagates() {
        let queue = InMemoryQueue::new();
        queue.fail_next_receive();
        let processor = processor(queue, MemoryStore::new());

        assert!(processor.process_next().await.is_err());
    }
}
