use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::gateway::{extract_detail, SubmitRequest};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("flow not found")]
    NotFound,
    #[error("backend unavailable: {message}")]
    BackendUnavailable { message: String },
    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),
}

impl From<reqwest::Error> for HistoryError {
    fn from(err: reqwest::Error) -> Self {
        HistoryError::BackendUnavailable {
            message: err.to_string(),
        }
    }
}

/// One row of the flow history list. Timestamps are kept as the backend's
/// strings; they are display-only and never used for ordering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowRecord {
    pub id: String,
    pub instruction: String,
    #[serde(default)]
    pub initial_url: Option<String>,
    pub status: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub action_count: u64,
}

/// Full detail of one persisted flow, including the recorded action trail
/// and token/cost accounting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowDetail {
    pub id: String,
    pub instruction: String,
    #[serde(default)]
    pub initial_url: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    pub status: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub actions: Vec<Value>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
    #[serde(default)]
    pub total_cost: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FlowsPage {
    #[serde(default)]
    pub flows: Vec<FlowRecord>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub offset: u64,
}

/// Adapter over the backend's flow-history endpoints. The backend only
/// pages by limit/offset, so text and status filters run client-side over
/// the fetched page.
#[derive(Clone)]
pub struct HistoryClient {
    base_url: Url,
    http: reqwest::Client,
}

impl HistoryClient {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    /// Newest-first page of past runs, filtered client-side.
    pub async fn list(
        &self,
        limit: u64,
        offset: u64,
        text_filter: Option<&str>,
        status_filter: Option<&str>,
    ) -> Result<FlowsPage, HistoryError> {
        let mut url = self.base_url.join("flows")?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string())
            .append_pair("offset", &offset.to_string());
        let response = self.http.get(url).send().await?;
        let response = check_status(response).await?;
        let mut page: FlowsPage = response.json().await?;
        page.flows = filter_flows(page.flows, text_filter, status_filter);
        Ok(page)
    }

    pub async fn get(&self, id: &str) -> Result<FlowDetail, HistoryError> {
        let url = self.base_url.join(&format!("flows/{id}"))?;
        let response = self.http.get(url).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    /// Rewrites a flow's instruction in place. Fails with [`HistoryError::NotFound`]
    /// if the flow was deleted concurrently; nothing else is mutated.
    pub async fn edit(&self, id: &str, new_instruction: &str) -> Result<FlowDetail, HistoryError> {
        let url = self.base_url.join(&format!("flows/{id}"))?;
        let body = serde_json::json!({ "instruction": new_instruction });
        let response = self.http.put(url).json(&body).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    /// Irreversible. The presentation layer confirms before calling.
    pub async fn delete(&self, id: &str) -> Result<(), HistoryError> {
        let url = self.base_url.join(&format!("flows/{id}"))?;
        let response = self.http.delete(url).send().await?;
        check_status(response).await?;
        Ok(())
    }

    /// Irreversible. The presentation layer confirms before calling.
    pub async fn clear_all(&self) -> Result<(), HistoryError> {
        let url = self.base_url.join("flows")?;
        let response = self.http.delete(url).send().await?;
        check_status(response).await?;
        Ok(())
    }
}

/// Packages a past run for re-submission. Pure: no backend call happens
/// here — the request goes through the session supervisor's submit path so
/// the reducer is reset first, and the fresh flow id means the rerun
/// creates a new record rather than updating the old one.
pub fn rerun_request(record: &FlowDetail) -> SubmitRequest {
    SubmitRequest {
        instruction: record.instruction.clone(),
        initial_url: record.initial_url.clone(),
        provider: record.provider.clone(),
        flow_id: Some(Uuid::new_v4().to_string()),
    }
}

fn filter_flows(
    flows: Vec<FlowRecord>,
    text_filter: Option<&str>,
    status_filter: Option<&str>,
) -> Vec<FlowRecord> {
    let text = text_filter.map(str::to_lowercase);
    let status = status_filter.map(str::to_lowercase);
    flows
        .into_iter()
        .filter(|flow| {
            if let Some(text) = &text {
                if !flow.instruction.to_lowercase().contains(text.as_str()) {
                    return false;
                }
            }
            if let Some(status) = &status {
                if flow.status.to_lowercase() != *status {
                    return false;
                }
            }
            true
        })
        .collect()
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, HistoryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(HistoryError::NotFound);
    }
    let body = response.text().await.unwrap_or_default();
    Err(HistoryError::BackendUnavailable {
        message: extract_detail(status, &body),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot backend that answers every request with the 404 body the
    /// real flow endpoints send for a missing id.
    async fn spawn_not_found_backend() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = [0u8; 4096];
                let _ = socket.read(&mut request).await;
                let body = r#"{"detail":"Flow not found"}"#;
                let reply = format!(
                    "HTTP/1.1 404 Not Found\r\n\
                     content-type: application/json\r\n\
                     content-length: {}\r\n\
                     connection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(reply.as_bytes()).await;
            }
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    #[tokio::test]
    async fn edit_on_a_missing_flow_is_not_found() {
        let history = HistoryClient::new(spawn_not_found_backend().await);
        let err = history
            .edit("no-such-flow", "check the other inbox")
            .await
            .expect_err("flow does not exist");
        assert!(matches!(err, HistoryError::NotFound));
    }

    #[tokio::test]
    async fn get_on_a_missing_flow_is_not_found() {
        let history = HistoryClient::new(spawn_not_found_backend().await);
        let err = history
            .get("no-such-flow")
            .await
            .expect_err("flow does not exist");
        assert!(matches!(err, HistoryError::NotFound));
    }

    fn record(id: &str, instruction: &str, status: &str) -> FlowRecord {
        FlowRecord {
            id: id.to_string(),
            instruction: instruction.to_string(),
            initial_url: None,
            status: status.to_string(),
            created_at: Some("2026-03-01T10:00:00".to_string()),
            completed_at: None,
            action_count: 4,
        }
    }

    #[test]
    fn filters_compose_and_ignore_case() {
        let flows = vec![
            record("a", "Search the weather", "completed"),
            record("b", "download the invoice", "failed"),
            record("c", "search flights", "failed"),
        ];

        let hits = filter_flows(flows.clone(), Some("SEARCH"), None);
        assert_eq!(hits.len(), 2);

        let hits = filter_flows(flows.clone(), Some("search"), Some("failed"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "c");

        let hits = filter_flows(flows, None, None);
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn rerun_packages_parameters_with_a_fresh_id() {
        let detail = FlowDetail {
            id: "old-flow".to_string(),
            instruction: "go to a.test and click search".to_string(),
            initial_url: Some("https://a.test".to_string()),
            provider: Some("gemini".to_string()),
            status: "completed".to_string(),
            result: Some("done".to_string()),
            error: None,
            actions: vec![],
            created_at: None,
            completed_at: None,
            total_tokens: Some(1200),
            total_cost: Some(0.004),
        };

        let request = rerun_request(&detail);
        assert_eq!(request.instruction, detail.instruction);
        assert_eq!(request.initial_url, detail.initial_url);
        assert_eq!(request.provider, detail.provider);
        let flow_id = request.flow_id.expect("fresh id");
        assert_ne!(flow_id, "old-flow");

        let again = rerun_request(&detail);
        assert_ne!(again.flow_id.unwrap(), flow_id);
    }

    #[test]
    fn flow_page_decodes_backend_shape() {
        let raw = r#"{
            "flows": [{
                "id": "f-1",
                "instruction": "check inbox",
                "initial_url": null,
                "status": "completed",
                "created_at": "2026-03-01T09:58:11",
                "completed_at": "2026-03-01T09:59:40",
                "action_count": 7
            }],
            "total": 23,
            "limit": 20,
            "offset": 0
        }"#;
        let page: FlowsPage = serde_json::from_str(raw).unwrap();
        assert_eq!(page.total, 23);
        assert_eq!(page.flows[0].action_count, 7);
        assert!(page.flows[0].initial_url.is_none());
    }
}
