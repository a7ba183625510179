//! Drains the error-notification queue into the durable store, and pushes
//! stored notifications to the downstream supplier.

pub mod config;
pub mod error;
pub mod lock;
pub mod poller;
pub mod processor;
pub mod sender;

#[cfg(test)]
mod test_support;
