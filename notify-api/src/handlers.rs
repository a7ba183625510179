use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{routing, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use notify_common::codec::truncate_description;
use notify_common::store::{NotificationRecord, NotificationStatus, NotificationStore,
    PgNotificationStore};

/// A stored notification as exposed over HTTP. The error description is
/// truncated at this boundary; the stored value is untouched.
#[derive(Serialize, Debug)]
pub struct NotificationResponse {
    pub id: i64,
    pub notification_id: Option<String>,
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

impl From<NotificationRecord> for NotificationResponse {
    fn from(record: NotificationRecord) -> Self {
        Self {
            id: record.id,
            notification_id: record.notification_id,
            zip_file_name: record.zip_file_name,
            po_box: record.po_box,
            container: record.container,
            service: record.service,
            document_control_number: record.document_control_number,
            error_code: record.error_code,
            error_description: truncate_description(&record.error_description),
            created_at: record.created_at,
            processed_at: record.processed_at,
            status: record.status,
        }
    }
}

#[derive(Deserialize)]
pub struct ListParams {
    pub zip_file_name: String,
    pub service: String,
}

#[derive(Serialize)]
pub struct ListResponse {
    pub count: usize,
    pub notifications: Vec<NotificationResponse>,
}

pub fn add_routes(router: Router<PgNotificationStore>, store: PgNotificationStore) -> Router {
    router
        .route("/", routing::get(index))
        .route("/notifications", routing::get(list_notifications))
        .route("/notifications/:id", routing::get(get_notification))
        .with_state(store)
}

async fn index() -> &'static str {
    "notify-relay api"
}

async fn list_notifications(
    State(store): State<PgNotificationStore>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>, StatusCode> {
    let records = store
        .find_by_file(&params.zip_file_name, &params.service)
        .await
        .map_err(|e| {
            error!("failed to list notifications: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let notifications: Vec<NotificationResponse> =
        records.into_iter().map(NotificationResponse::from).collect();

    Ok(Json(ListResponse {
        count: notifications.len(),
        notifications,
    }))
}

async fn get_notification(
    State(store): State<PgNotificationStore>,
    Path(id): Path<i64>,
) -> Result<Json<NotificationResponse>, StatusCode> {
    let record = store.find(id).await.map_err(|e| {
        error!("failed to look up notification {}: {}", id, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    match record {
        Some(record) => Ok(Json(NotificationResponse::from(record))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_common::codec::MAX_ERROR_DESCRIPTION_LENGTH;

    fn a_record(error_description: &str) -> NotificationRecord {
        NotificationRecord {
            id: 1,
            notification_id: None,
            message_id: "msg-1".to_owned(),
            zip_file_name: "1283_24-02-2024-10-31-32.zip".to_owned(),
            po_box: Some("PO 12625".to_owned()),
            container: Some("probate".to_owned()),
            service: "probate_frontend".to_owned(),
            document_control_number: Some("6100909112925211".to_owned()),
            error_code: "ERR_AV_FAILED".to_owned(),
            error_description: error_description.to_owned(),
            created_at: Utc::now(),
            processed_at: None,
            status: NotificationStatus::Pending,
        }
    }

    #[test]
    fn long_descriptions_are_truncated_in_responses() {
        let record = a_record(&"e".repeat(MAX_ERROR_DESCRIPTION_LENGTH + 300));

        let response = NotificationResponse::from(record);

        assert_eq!(
            response.error_description.chars().count(),
            MAX_ERROR_DESCRIPTION_LENGTH
        );
    }

    #[test]
    fn short_descriptions_pass_through_unchanged() {
        let response = NotificationResponse::from(a_record("Antivirus scan failed"));
        assert_eq!(response.error_description, "Antivirus scan failed");
    }

    #[test]
    fn statuses_serialize_in_their_external_form() {
        let response = NotificationResponse::from(a_record("x"));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "PENDING");
    }
}
