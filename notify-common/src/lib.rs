//! Shared building blocks for the notify-relay services: the wire codec for
//! inbound error notifications, the durable notification store, the broker
//! queue adapter, and health/metrics plumbing.

pub mod codec;
pub mod health;
pub mod metrics;
pub mod queue;
pub mod store;
