use std::time;

use async_trait::async_trait;
use http::StatusCode;
use notify_common::codec::truncate_description;
use notify_common::health::HealthHandle;
use notify_common::store::{NotificationRecord, NotificationStore, StoreError};
use reqwest::header;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use url::Url;

use crate::error::SupplierError;

/// Pushes a stored notification to the downstream supplier. Returns the
/// confirmation id the supplier assigned.
#[async_trait]
pub trait SupplierClient {
    async fn send(&self, notification: &NotificationRecord) -> Result<String, SupplierError>;
}

/// The notification payload as the supplier API expects it. Descriptions are
/// truncated here, at the exposure boundary; the stored value stays intact.
#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct SupplierNotification {
    pub zip_file_name: String,
    pub po_box: Option<String>,
    pub container: Option<String>,
    pub service: String,
    pub document_control_number: Option<String>,
    pub error_code: String,
    pub error_description: String,
}

impl From<&NotificationRecord> for SupplierNotification {
    fn from(record: &NotificationRecord) -> Self {
        Self {
            zip_file_name: record.zip_file_name.clone(),
            po_box: record.po_box.clone(),
            container: record.container.clone(),
            service: record.service.clone(),
            document_control_number: record.document_control_number.clone(),
            error_code: record.error_code.clone(),
            error_description: truncate_description(&record.error_description),
        }
    }
}

#[derive(Deserialize)]
struct SupplierResponse {
    notification_id: String,
}

/// HTTP implementation of [`SupplierClient`].
pub struct HttpSupplierClient {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpSupplierClient {
    pub fn new(base_url: &str, request_timeout: time::Duration) -> Result<Self, url::ParseError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("notify-relay supplier sender")
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client for supplier sender");

        let endpoint = Url::parse(base_url)?.join("notifications")?;

        Ok(Self { client, endpoint })
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[async_trait]
impl SupplierClient for HttpSupplierClient {
    async fn send(&self, notification: &NotificationRecord) -> Result<String, SupplierError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&SupplierNotification::from(notification))
            .send()
            .await
            .map_err(|e| SupplierError::Retryable(e.to_string()))?;

        match response.error_for_status() {
            Ok(response) => response
                .json::<SupplierResponse>()
                .await
                .map(|r| r.notification_id)
                .map_err(|e| SupplierError::Retryable(e.to_string())),
            Err(err) => {
                let status = err
                    .status()
                    .expect("status code is set as error is generated from a response");
                if is_retryable_status(status) {
                    Err(SupplierError::Retryable(err.to_string()))
                } else {
                    Err(SupplierError::Rejected(err.to_string()))
                }
            }
        }
    }
}

/// Tally of one sending pass over the pending notifications.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SendSummary {
    pub sent: usize,
    pub failed: usize,
    pub deferred: usize,
}

/// Scheduled pass pushing every Pending notification to the supplier and
/// recording the outcome in the store.
pub struct SupplierSender<C, N> {
    client: C,
    store: N,
    send_interval: time::Duration,
}

impl<C, N> SupplierSender<C, N>
where
    C: SupplierClient,
    N: NotificationStore,
{
    pub fn new(client: C, store: N, send_interval: time::Duration) -> Self {
        Self {
            client,
            store,
            send_interval,
        }
    }

    /// Run forever on the configured schedule.
    pub async fn run(&self, liveness: HealthHandle) {
        let mut interval = tokio::time::interval(self.send_interval);

        loop {
            interval.tick().await;
            liveness.report_healthy();

            match self.send_pending().await {
                Ok(summary) if summary != SendSummary::default() => {
                    info!(
                        sent = summary.sent,
                        failed = summary.failed,
                        deferred = summary.deferred,
                        "sending pass finished"
                    );
                }
                Ok(_) => {}
                Err(e) => error!("sending pass could not read pending notifications: {}", e),
            }
        }
    }

    /// Push all Pending notifications once. Supplier acceptance transitions
    /// the record to Sent, a rejection to Failed; a retryable fault leaves it
    /// Pending for the next pass.
    pub async fn send_pending(&self) -> Result<SendSummary, StoreError> {
        let pending = self.store.find_pending().await?;
        let mut summary = SendSummary::default();

        for record in pending {
            match self.client.send(&record).await {
                Ok(confirmation_id) => {
                    match self.store.mark_sent(record.id, &confirmation_id).await {
                        Ok(true) => {
                            info!(
                                id = record.id,
                                confirmation_id = %confirmation_id,
                                "notification accepted by supplier"
                            );
                            metrics::counter!("notifications_sent_total").increment(1);
                            summary.sent += 1;
                        }
                        Ok(false) => {
                            // Someone else transitioned it first; nothing to do.
                            warn!(id = record.id, "notification no longer pending, skipping");
                        }
                        Err(e) => {
                            // The supplier accepted but we could not record it.
                            // The next pass resends; delivery is at-least-once.
                            error!(id = record.id, "failed to record acceptance: {}", e);
                        }
                    }
                }
                Err(SupplierError::Rejected(reason)) => {
                    error!(id = record.id, "supplier rejected notification: {}", reason);
                    metrics::counter!("notifications_send_failed_total").increment(1);
                    if let Err(e) = self.store.mark_failed(record.id).await {
                        error!(id = record.id, "failed to record rejection: {}", e);
                    }
                    summary.failed += 1;
                }
                Err(SupplierError::Retryable(reason)) => {
                    warn!(
                        id = record.id,
                        "supplier unavailable, will retry next pass: {}", reason
                    );
                    metrics::counter!("notifications_send_deferred_total").increment(1);
                    summary.deferred += 1;
                }
            }
        }

        Ok(summary)
    }
}
