use notify_common::{queue, store};
use thiserror::Error;

/// Enumeration of failures when talking to the downstream supplier API.
#[derive(Error, Debug)]
pub enum SupplierError {
    #[error("the supplier could not be reached but may recover: {0}")]
    Retryable(String),
    #[error("the supplier rejected the notification: {0}")]
    Rejected(String),
}

/// Enumeration of errors that can take the consumer process down.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("a queue error occurred: {0}")]
    Queue(#[from] queue::QueueError),
    #[error("a store error occurred: {0}")]
    Store(#[from] store::StoreError),
    #[error("failed to connect to the database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to serve http: {0}")]
    Io(#[from] std::io::Error),
}
