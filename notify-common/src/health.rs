use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::Duration;
use tracing::warn;

/// Liveness reporting for the long-running loops of a service.
///
/// Each loop registers itself and must report healthy more often than its
/// deadline. The process is healthy only while every registered component
/// has a fresh healthy report; a component that goes quiet past its deadline
/// counts as stalled and fails the probe.

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set on registration, before the first report.
    Starting,
    /// Reported healthy; valid until the contained deadline.
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy.
    Unhealthy,
    /// The HealthyUntil deadline passed without a new report.
    Stalled,
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

/// Handed to a component so it can report its own status.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    /// Report healthy. Must be called more frequently than the deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut components) => {
                _ = components.insert(self.component.clone(), status);
            }
            // Poisoned lock: the probe will fail and the process restart.
            Err(_) => warn!("poisoned health registry lock"),
        }
    }
}

#[derive(Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component; the returned handle reports its status.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Overall process status, computed from all registered components.
    /// Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = match self.components.read() {
            Ok(components) => components,
            Err(_) => {
                warn!("poisoned health registry lock");
                return HealthStatus::default();
            }
        };

        // Unhealthy until at least one component has registered.
        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::new(),
        };
        let now = time::OffsetDateTime::now_utc();

        for (name, component) in components.iter() {
            match component {
                ComponentStatus::HealthyUntil(until) if until.gt(&now) => {
                    _ = status.components.insert(name.clone(), component.clone());
                }
                ComponentStatus::HealthyUntil(_) => {
                    status.healthy = false;
                    _ = status
                        .components
                        .insert(name.clone(), ComponentStatus::Stalled);
                }
                other => {
                    status.healthy = false;
                    _ = status.components.insert(name.clone(), other.clone());
                }
            }
        }

        status
    }
}
