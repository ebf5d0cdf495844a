//! `ReportingApi` over the backend's JSON HTTP interface.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use repdash_core::api::{ApiError, ConnectionTestOutcome, ReportingApi, SavedConnection};
use repdash_core::connections::ConnectionPayload;
use repdash_core::dashboard::{Widget, WidgetPlacement, WidgetSuggestion, WidgetSuggestionRequest};
use repdash_core::history::{BulkDeleteOutcome, HistoryRecord};
use repdash_core::query_builder::{
    GeneratedSql, QueryResult, SaveQueryRequest, SavedQuery, SqlExecutionRequest,
    SqlGenerationRequest,
};
use repdash_core::reports::{
    Batch, DiscoveryRequest, KeyOption, ReportTemplate, RunReceipt, RunRequest,
};
use repdash_core::schema::SchemaCatalog;

#[derive(Debug, Error)]
pub enum HttpSetupError {
    #[error("invalid API base URL `{url}`: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct HttpReportingApi {
    client: Client,
    base_url: Url,
}

impl HttpReportingApi {
    pub fn new(base_url: &str) -> Result<Self, HttpSetupError> {
        let parsed = Url::parse(base_url.trim()).map_err(|error| HttpSetupError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason: error.to_string(),
        })?;
        if parsed.cannot_be_a_base() {
            return Err(HttpSetupError::InvalidBaseUrl {
                url: base_url.to_string(),
                reason: "URL cannot carry a path".to_string(),
            });
        }
        let client = Client::builder()
            .user_agent(concat!("repdash/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: parsed,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Appends percent-encoded path segments to the base URL.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::new(format!("{} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = Self::send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|error| ApiError::new(format!("unexpected response from backend: {error}")))
    }

    async fn send_empty(&self, request: RequestBuilder) -> Result<(), ApiError> {
        Self::send(request).await.map(|_| ())
    }

    async fn send(request: RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = request.send().await.map_err(|error| {
            tracing::debug!(%error, "backend request failed to complete");
            ApiError::new(format!("backend unreachable: {error}"))
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = error_message(status, &body);
        tracing::debug!(status = status.as_u16(), message, "backend returned an error");
        Err(ApiError::with_status(status.as_u16(), message))
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, ApiError> {
        let url = self.endpoint(segments)?;
        self.send_json(self.client.get(url)).await
    }

    async fn post<B: Serialize + ?Sized + Sync, T: DeserializeOwned>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> Result<T, ApiError> {
        let url = self.endpoint(segments)?;
        self.send_json(self.client.post(url).json(body)).await
    }

    async fn delete(&self, segments: &[&str]) -> Result<(), ApiError> {
        let url = self.endpoint(segments)?;
        self.send_empty(self.client.delete(url)).await
    }
}

/// Human-readable failure text: `detail`, `message` or `error` from a JSON
/// body, else the status line.
#[must_use]
pub fn error_message(status: StatusCode, body: &str) -> String {
    let from_body = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            ["detail", "message", "error"]
                .iter()
                .find_map(|key| value.get(*key).and_then(describe))
        })
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty() && trimmed.len() <= 200 && !trimmed.starts_with('<'))
                .then(|| trimmed.to_string())
        });

    from_body.unwrap_or_else(|| match status.canonical_reason() {
        Some(reason) => format!("{} {reason}", status.as_u16()),
        None => status.as_u16().to_string(),
    })
}

fn describe(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        // Validation errors arrive as a list of {msg, loc} objects.
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(describe).or_else(|| describe(item)))
                .collect();
            (!parts.is_empty()).then(|| parts.join("; "))
        }
        Value::Object(_) => value.get("message").and_then(describe),
        _ => None,
    }
}

#[async_trait]
impl ReportingApi for HttpReportingApi {
    async fn test_connection(
        &self,
        payload: &ConnectionPayload,
    ) -> Result<ConnectionTestOutcome, ApiError> {
        self.post(&["connections", "test"], payload).await
    }

    async fn save_connection(
        &self,
        payload: &ConnectionPayload,
        remote_id: Option<&str>,
    ) -> Result<SavedConnection, ApiError> {
        match remote_id {
            Some(remote_id) => {
                let url = self.endpoint(&["connections", remote_id])?;
                self.send_json(self.client.put(url).json(payload)).await
            }
            None => self.post(&["connections"], payload).await,
        }
    }

    async fn delete_connection(&self, remote_id: &str) -> Result<(), ApiError> {
        self.delete(&["connections", remote_id]).await
    }

    async fn healthcheck(&self, remote_id: &str) -> Result<ConnectionTestOutcome, ApiError> {
        self.post(&["connections", remote_id, "healthcheck"], &json!({}))
            .await
    }

    async fn fetch_schema(&self, remote_id: &str) -> Result<SchemaCatalog, ApiError> {
        self.get(&["connections", remote_id, "schema"]).await
    }

    async fn list_templates(&self) -> Result<Vec<ReportTemplate>, ApiError> {
        self.get(&["templates"]).await
    }

    async fn delete_template(&self, template_id: &str) -> Result<(), ApiError> {
        self.delete(&["templates", template_id]).await
    }

    async fn fetch_key_options(&self, template_id: &str) -> Result<Vec<KeyOption>, ApiError> {
        self.get(&["templates", template_id, "keys"]).await
    }

    async fn discover_batches(&self, request: &DiscoveryRequest) -> Result<Vec<Batch>, ApiError> {
        self.post(&["reports", "discover"], request).await
    }

    async fn run_report(&self, request: &RunRequest) -> Result<RunReceipt, ApiError> {
        self.post(&["reports", "run"], request).await
    }

    async fn job_status(&self, job_id: &str) -> Result<RunReceipt, ApiError> {
        self.get(&["reports", "jobs", job_id]).await
    }

    async fn list_history(&self) -> Result<Vec<HistoryRecord>, ApiError> {
        self.get(&["history"]).await
    }

    async fn delete_history(&self, ids: &[String]) -> Result<BulkDeleteOutcome, ApiError> {
        self.post(&["history", "bulk-delete"], &json!({ "ids": ids }))
            .await
    }

    async fn generate_sql(
        &self,
        request: &SqlGenerationRequest,
    ) -> Result<GeneratedSql, ApiError> {
        self.post(&["query", "generate"], request).await
    }

    async fn execute_sql(&self, request: &SqlExecutionRequest) -> Result<QueryResult, ApiError> {
        self.post(&["query", "execute"], request).await
    }

    async fn save_query(&self, request: &SaveQueryRequest) -> Result<SavedQuery, ApiError> {
        self.post(&["query", "save"], request).await
    }

    async fn suggest_widgets(
        &self,
        request: &WidgetSuggestionRequest,
    ) -> Result<Vec<WidgetSuggestion>, ApiError> {
        self.post(&["widgets", "suggest"], request).await
    }

    async fn layout_widgets(&self, widgets: &[Widget]) -> Result<Vec<WidgetPlacement>, ApiError> {
        self.post(&["widgets", "layout"], &json!({ "widgets": widgets }))
            .await
    }

    async fn probe(&self) -> Result<(), ApiError> {
        let url = self.endpoint(&["health"])?;
        self.send_empty(self.client.get(url)).await
    }
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::{error_message, HttpReportingApi, HttpSetupError};

    #[test]
    fn endpoint_joins_and_encodes_segments() {
        let api = HttpReportingApi::new("http://127.0.0.1:8000/api/").expect("valid base");
        let url = api
            .endpoint(&["connections", "local 1", "schema"])
            .expect("endpoint");
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:8000/api/connections/local%201/schema"
        );

        let bare = HttpReportingApi::new("https://reports.example.com").expect("valid base");
        assert_eq!(
            bare.endpoint(&["history"]).expect("endpoint").as_str(),
            "https://reports.example.com/history"
        );
    }

    #[test]
    fn rejects_unusable_base_urls() {
        assert!(matches!(
            HttpReportingApi::new("not a url"),
            Err(HttpSetupError::InvalidBaseUrl { .. })
        ));
        assert!(matches!(
            HttpReportingApi::new("mailto:ops@example.com"),
            Err(HttpSetupError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn error_message_prefers_detail_then_message_then_error() {
        assert_eq!(
            error_message(StatusCode::BAD_REQUEST, r#"{"detail":"Template is in use"}"#),
            "Template is in use"
        );
        assert_eq!(
            error_message(StatusCode::CONFLICT, r#"{"message":"Name taken","error":"x"}"#),
            "Name taken"
        );
        assert_eq!(
            error_message(StatusCode::INTERNAL_SERVER_ERROR, r#"{"error":"boom"}"#),
            "boom"
        );
    }

    #[test]
    fn error_message_flattens_validation_lists() {
        let body = r#"{"detail":[{"loc":["body","port"],"msg":"port out of range"},{"msg":"host required"}]}"#;
        assert_eq!(
            error_message(StatusCode::UNPROCESSABLE_ENTITY, body),
            "port out of range; host required"
        );
    }

    #[test]
    fn error_message_falls_back_to_status_line() {
        assert_eq!(error_message(StatusCode::BAD_GATEWAY, ""), "502 Bad Gateway");
        assert_eq!(
            error_message(StatusCode::SERVICE_UNAVAILABLE, "<html>down</html>"),
            "503 Service Unavailable"
        );
        assert_eq!(error_message(StatusCode::FORBIDDEN, "nope"), "nope");
    }
}
