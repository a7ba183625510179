//! Test doubles shared by the processor, poller and sender tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use notify_common::codec::ErrorNotification;
use notify_common::store::{
    NotificationRecord, NotificationStatus, NotificationStore, StoreError, StoreResult,
};

#[derive(Default)]
struct Inner {
    records: Vec<NotificationRecord>,
    next_id: i64,
    fail_inserts: bool,
    fail_transitions: bool,
}

/// An in-memory [`NotificationStore`] with injectable failures. Clones
/// share the same state, mirroring how pool-backed stores are handed around.
#[derive(Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every insert fail with a transient (non-duplicate) error.
    pub fn fail_inserts(&self) {
        self.inner.lock().expect("store mutex poisoned").fail_inserts = true;
    }

    /// Make every mark_sent/mark_failed call fail.
    pub fn fail_transitions(&self) {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .fail_transitions = true;
    }

    pub fn records(&self) -> Vec<NotificationRecord> {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .records
            .clone()
    }

    /// Seed a Pending record directly, bypassing insert.
    pub fn seed_pending(&self, event: &ErrorNotification, message_id: &str) -> i64 {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.next_id += 1;
        let id = inner.next_id;
        inner.records.push(new_record(id, event, message_id));
        id
    }
}

fn new_record(id: i64, event: &ErrorNotification, message_id: &str) -> NotificationRecord {
    NotificationRecord {
        id,
        notification_id: None,
        message_id: message_id.to_owned(),
        zip_file_name: event.zip_file_name.clone(),
        po_box: event.po_box.clone(),
        container: event.container.clone(),
        service: event.service.clone(),
        document_control_number: event.document_control_number.clone(),
        error_code: event.error_code.to_string(),
        error_description: event.error_description.clone(),
        created_at: Utc::now(),
        processed_at: None,
        status: NotificationStatus::Pending,
    }
}

fn transient_error() -> StoreError {
    StoreError::Query {
        command: "INSERT".to_owned(),
        error: sqlx::Error::PoolTimedOut,
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn insert(&self, event: &ErrorNotification, message_id: &str) -> StoreResult<i64> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if inner.fail_inserts {
            return Err(transient_error());
        }
        if inner.records.iter().any(|r| r.message_id == message_id) {
            return Err(StoreError::Duplicate);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.records.push(new_record(id, event, message_id));
        Ok(id)
    }

    async fn find_pending(&self) -> StoreResult<Vec<NotificationRecord>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner
            .records
            .iter()
            .filter(|r| r.status == NotificationStatus::Pending && r.notification_id.is_none())
            .cloned()
            .collect())
    }

    async fn mark_sent(&self, id: i64, confirmation_id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if inner.fail_transitions {
            return Err(transient_error());
        }
        match inner
            .records
            .iter_mut()
            .find(|r| r.id == id && r.status == NotificationStatus::Pending)
        {
            Some(record) => {
                record.status = NotificationStatus::Sent;
                record.notification_id = Some(confirmation_id.to_owned());
                record.processed_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_failed(&self, id: i64) -> StoreResult<bool> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if inner.fail_transitions {
            return Err(transient_error());
        }
        match inner
            .records
            .iter_mut()
            .find(|r| r.id == id && r.status == NotificationStatus::Pending)
        {
            Some(record) => {
                record.status = NotificationStatus::Failed;
                record.processed_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find(&self, id: i64) -> StoreResult<Option<NotificationRecord>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.records.iter().find(|r| r.id == id).cloned())
    }

    async fn find_by_file(
        &self,
        zip_file_name: &str,
        service: &str,
    ) -> StoreResult<Vec<NotificationRecord>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner
            .records
            .iter()
            .filter(|r| r.zip_file_name == zip_file_name && r.service == service)
            .cloned()
            .collect())
    }
}
