//! In-memory [`MessageSource`] for tests. Records every broker action taken,
//! so a test can assert that no action was taken at all (the silent-retry
//! path) rather than inferring it from the absence of other effects.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Delivery, MessageSource, QueueError, QueueResult};

/// A broker action observed by the in-memory queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerAction {
    Acknowledged { message_id: String },
    DeadLettered {
        message_id: String,
        reason: String,
        description: String,
    },
}

#[derive(Default)]
struct Inner {
    messages: VecDeque<Delivery>,
    actions: Vec<BrokerAction>,
    next_receipt: i64,
    fail_receive: bool,
    fail_finalize: bool,
}

#[derive(Default)]
pub struct InMemoryQueue {
    inner: Mutex<Inner>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message for its first delivery.
    pub fn push(&self, message_id: &str, body: &[u8]) {
        self.push_redelivered(message_id, body, 0);
    }

    /// Queue a message reporting `delivery_count` prior delivery attempts.
    pub fn push_redelivered(&self, message_id: &str, body: &[u8], delivery_count: i32) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        inner.next_receipt += 1;
        let receipt = inner.next_receipt;
        inner.messages.push_back(Delivery {
            receipt,
            message_id: message_id.to_owned(),
            delivery_count,
            body: body.to_vec(),
        });
    }

    /// Make the next `receive` call fail.
    pub fn fail_next_receive(&self) {
        self.inner.lock().expect("queue mutex poisoned").fail_receive = true;
    }

    /// Make every acknowledge/dead-letter call fail.
    pub fn fail_finalize(&self) {
        self.inner.lock().expect("queue mutex poisoned").fail_finalize = true;
    }

    /// Every broker action taken so far, in order.
    pub fn actions(&self) -> Vec<BrokerAction> {
        self.inner
            .lock()
            .expect("queue mutex poisoned")
            .actions
            .clone()
    }
}

#[async_trait]
impl MessageSource for InMemoryQueue {
    async fn receive(&self) -> QueueResult<Option<Delivery>> {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        if inner.fail_receive {
            inner.fail_receive = false;
            return Err(QueueError::Broker("receive failed".to_owned()));
        }
        Ok(inner.messages.pop_front())
    }

    async fn acknowledge(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        if inner.fail_finalize {
            return Err(QueueError::Broker("acknowledge failed".to_owned()));
        }
        inner.actions.push(BrokerAction::Acknowledged {
            message_id: delivery.message_id.clone(),
        });
        Ok(())
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: &str,
        description: &str,
    ) -> QueueResult<()> {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        if inner.fail_finalize {
            return Err(QueueError::Broker("dead-letter failed".to_owned()));
        }
        inner.actions.push(BrokerAction::DeadLettered {
            message_id: delivery.message_id.clone(),
            reason: reason.to_owned(),
            description: description.to_owned(),
        });
        Ok(())
    }
}
