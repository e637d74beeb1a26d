use std::time::Duration;

use async_trait::async_trait;
use pai_types::{PaiError, Result, SessionConfig};
use serde::de::DeserializeOwned;

use crate::{
    CreateRunRequest, ListNodeOutputsRequest, ListRunsRequest, NodeDetail, NodeOutput,
    PaginatedResult, PipelineRunApi, RunInfo,
};

const API_PREFIX: &str = "/api/core/v1.0";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// HttpRunApi
// ---------------------------------------------------------------------------

/// JSON-over-HTTP implementation of [`PipelineRunApi`].
#[derive(Debug, Clone)]
pub struct HttpRunApi {
    client: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
    workspace_id: Option<String>,
    timeout: Duration,
}

impl HttpRunApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: None,
            workspace_id: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Workspace applied to list and create calls that don't name one.
    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let mut api = Self::new(config.endpoint()?);
        if let Some(ref token) = config.access_token {
            api = api.with_access_token(token);
        }
        if let Some(ref workspace) = config.workspace_id {
            api = api.with_workspace(workspace);
        }
        if let Some(secs) = config.timeout_secs {
            api = api.with_timeout(Duration::from_secs(secs));
        }
        Ok(api)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Endpoint URL under the API prefix. Each segment is percent-encoded,
    /// so ids containing `/`, `?` or `#` stay within their segment.
    fn url(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&format!("{}{}", self.base_url, API_PREFIX))
            .map_err(|e| PaiError::Config(format!("Invalid endpoint '{}': {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| PaiError::Config(format!("Endpoint '{}' cannot take a path", self.base_url)))?
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, action: &str, builder: reqwest::RequestBuilder) -> Result<serde_json::Value> {
        let mut builder = builder
            .timeout(self.timeout)
            .header("accept", "application/json");
        if let Some(ref token) = self.access_token {
            builder = builder.bearer_auth(token);
        }

        tracing::debug!(action, "PAIFlow request");
        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                PaiError::RequestTimeout {
                    action: action.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            } else {
                PaiError::ApiError {
                    action: action.to_string(),
                    status: 0,
                    message: e.to_string(),
                    retryable: true,
                }
            }
        })?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| PaiError::ApiError {
            action: action.to_string(),
            status: status.as_u16(),
            message: e.to_string(),
            retryable: true,
        })?;

        if !status.is_success() {
            tracing::warn!(action, status = status.as_u16(), "PAIFlow request failed");
            return Err(map_error(action, status, &body));
        }

        if body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| PaiError::ApiError {
            action: action.to_string(),
            status: status.as_u16(),
            message: format!("Failed to parse response JSON: {e}"),
            retryable: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Query construction
// ---------------------------------------------------------------------------

fn list_runs_query(
    request: &ListRunsRequest,
    default_workspace: Option<&str>,
) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("PageSize", request.page_size.to_string()),
        ("PageNumber", request.page_number.to_string()),
    ];
    let optional = [
        ("Name", request.name.clone()),
        ("RunId", request.run_id.clone()),
        ("PipelineId", request.pipeline_id.clone()),
        ("Status", request.status.map(|s| s.to_string())),
        ("SortBy", request.sort_by.clone()),
        ("Order", request.order.clone()),
        (
            "WorkspaceId",
            request
                .workspace_id
                .clone()
                .or_else(|| default_workspace.map(String::from)),
        ),
    ];
    query.extend(
        optional
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v))),
    );
    query
}

fn node_outputs_query(request: &ListNodeOutputsRequest) -> Vec<(&'static str, String)> {
    let mut query = vec![("Depth", request.depth.to_string())];
    if let Some(ref name) = request.name {
        query.push(("Name", name.clone()));
    }
    if let Some(ref output_type) = request.output_type {
        query.push(("Type", output_type.clone()));
    }
    query
}

// ---------------------------------------------------------------------------
// Response translation
// ---------------------------------------------------------------------------

fn parse_paginated<T: DeserializeOwned>(
    body: &serde_json::Value,
    key: &str,
) -> Result<PaginatedResult<T>> {
    let items: Vec<T> = match body.get(key) {
        Some(serde_json::Value::Null) | None => Vec::new(),
        Some(v) => serde_json::from_value(v.clone())?,
    };
    let total_count = body
        .get("TotalCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(items.len() as u64);
    Ok(PaginatedResult { items, total_count })
}

fn parse_node(body: serde_json::Value) -> Result<Option<NodeDetail>> {
    match body {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(ref map) if map.is_empty() || !map.contains_key("Metadata") => {
            Ok(None)
        }
        other => Ok(Some(serde_json::from_value(other)?)),
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn map_error(action: &str, status: reqwest::StatusCode, body: &str) -> PaiError {
    let status_u16 = status.as_u16();
    match status_u16 {
        401 | 403 => PaiError::AuthError {
            action: action.to_string(),
        },
        404 => PaiError::NotFound {
            resource: format!("{action}: {}", extract_error_message(body)),
        },
        429 | 500 | 502 | 503 | 504 => PaiError::ApiError {
            action: action.to_string(),
            status: status_u16,
            message: extract_error_message(body),
            retryable: true,
        },
        _ => PaiError::ApiError {
            action: action.to_string(),
            status: status_u16,
            message: extract_error_message(body),
            retryable: false,
        },
    }
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("Message")
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_string())
}

// ---------------------------------------------------------------------------
// PipelineRunApi implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl PipelineRunApi for HttpRunApi {
    async fn create_run(&self, request: &CreateRunRequest) -> Result<String> {
        let mut request = request.clone();
        if request.workspace_id.is_none() {
            request.workspace_id = self.workspace_id.clone();
        }
        let body = self
            .send("CreateRun", self.client.post(self.url(&["runs"])?).json(&request))
            .await?;
        body.get("RunId")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| PaiError::ApiError {
                action: "CreateRun".into(),
                status: 200,
                message: "Response is missing RunId".into(),
                retryable: false,
            })
    }

    async fn get_run(&self, run_id: &str) -> Result<RunInfo> {
        let body = self
            .send("GetRun", self.client.get(self.url(&["runs", run_id])?))
            .await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn list_runs(&self, request: &ListRunsRequest) -> Result<PaginatedResult<RunInfo>> {
        let query = list_runs_query(request, self.workspace_id.as_deref());
        let body = self
            .send("ListRuns", self.client.get(self.url(&["runs"])?).query(&query))
            .await?;
        parse_paginated(&body, "Runs")
    }

    async fn get_node(
        &self,
        run_id: &str,
        node_id: &str,
        depth: u32,
    ) -> Result<Option<NodeDetail>> {
        let url = self.url(&["runs", run_id, "nodes", node_id])?;
        let result = self
            .send(
                "GetNode",
                self.client.get(url).query(&[("Depth", depth.to_string())]),
            )
            .await;
        match result {
            Ok(body) => parse_node(body),
            Err(PaiError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_node_outputs(
        &self,
        request: &ListNodeOutputsRequest,
    ) -> Result<PaginatedResult<NodeOutput>> {
        let url = self.url(&["runs", request.run_id.as_str(), "nodes", request.node_id.as_str(), "outputs"])?;
        let body = self
            .send(
                "ListNodeOutputs",
                self.client.get(url).query(&node_outputs_query(request)),
            )
            .await?;
        parse_paginated(&body, "Outputs")
    }

    async fn list_node_logs(
        &self,
        run_id: &str,
        node_id: &str,
        offset: u64,
        page_size: u32,
    ) -> Result<PaginatedResult<String>> {
        let url = self.url(&["runs", run_id, "nodes", node_id, "logs"])?;
        let body = self
            .send(
                "ListNodeLogs",
                self.client.get(url).query(&[
                    ("Offset", offset.to_string()),
                    ("PageSize", page_size.to_string()),
                ]),
            )
            .await?;
        parse_paginated(&body, "Logs")
    }

    async fn start(&self, run_id: &str) -> Result<()> {
        self.send(
            "StartRun",
            self.client.put(self.url(&["runs", run_id, "start"])?),
        )
        .await?;
        tracing::info!(run_id, "Run started");
        Ok(())
    }

    async fn terminate(&self, run_id: &str) -> Result<()> {
        self.send(
            "TerminateRun",
            self.client.put(self.url(&["runs", run_id, "terminate"])?),
        )
        .await?;
        tracing::info!(run_id, "Run terminated");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pai_types::RunStatus;

    #[test]
    fn from_config_uses_region_endpoint() {
        let config = SessionConfig {
            region_id: Some("cn-hangzhou".into()),
            workspace_id: Some("77".into()),
            timeout_secs: Some(5),
            ..Default::default()
        };
        let api = HttpRunApi::from_config(&config).unwrap();
        assert_eq!(api.base_url(), "https://paiflow.cn-hangzhou.aliyuncs.com");
        assert_eq!(api.workspace_id.as_deref(), Some("77"));
        assert_eq!(api.timeout, Duration::from_secs(5));
    }

    #[test]
    fn from_config_without_endpoint_fails() {
        assert!(matches!(
            HttpRunApi::from_config(&SessionConfig::default()),
            Err(PaiError::Config(_))
        ));
    }

    #[test]
    fn url_joins_prefix() {
        let api = HttpRunApi::new("http://localhost:9000/");
        assert_eq!(
            api.url(&["runs", "r1", "terminate"]).unwrap().as_str(),
            "http://localhost:9000/api/core/v1.0/runs/r1/terminate"
        );
    }

    #[test]
    fn url_encodes_ids_within_their_segment() {
        let api = HttpRunApi::new("http://localhost:9000");
        let url = api.url(&["runs", "flow/1?x=#y", "nodes", "node 2"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:9000/api/core/v1.0/runs/flow%2F1%3Fx=%23y/nodes/node%202"
        );
        assert_eq!(url.path_segments().unwrap().count(), 7);
        assert!(url.query().is_none());
    }

    #[test]
    fn url_rejects_malformed_endpoint() {
        let api = HttpRunApi::new("not a url");
        assert!(matches!(api.url(&["runs"]), Err(PaiError::Config(_))));
    }

    #[test]
    fn list_runs_query_includes_only_set_filters() {
        let req = ListRunsRequest {
            status: Some(RunStatus::Running),
            name: Some("train".into()),
            ..Default::default()
        };
        let query = list_runs_query(&req, Some("ws-1"));
        assert!(query.contains(&("PageSize", "20".to_string())));
        assert!(query.contains(&("PageNumber", "1".to_string())));
        assert!(query.contains(&("Status", "Running".to_string())));
        assert!(query.contains(&("Name", "train".to_string())));
        assert!(query.contains(&("WorkspaceId", "ws-1".to_string())));
        assert!(!query.iter().any(|(k, _)| *k == "PipelineId"));
    }

    #[test]
    fn list_runs_query_prefers_explicit_workspace() {
        let req = ListRunsRequest {
            workspace_id: Some("explicit".into()),
            ..Default::default()
        };
        let query = list_runs_query(&req, Some("default"));
        assert!(query.contains(&("WorkspaceId", "explicit".to_string())));
        assert!(!query.contains(&("WorkspaceId", "default".to_string())));
    }

    #[test]
    fn node_outputs_query_fields() {
        let mut req = ListNodeOutputsRequest::new("r", "n");
        req.output_type = Some("Model".into());
        let query = node_outputs_query(&req);
        assert_eq!(
            query,
            vec![("Depth", "1".to_string()), ("Type", "Model".to_string())]
        );
    }

    #[test]
    fn parse_paginated_logs() {
        let body = serde_json::json!({"Logs": ["line 1", "line 2"], "TotalCount": 10});
        let page: PaginatedResult<String> = parse_paginated(&body, "Logs").unwrap();
        assert_eq!(page.items, vec!["line 1", "line 2"]);
        assert_eq!(page.total_count, 10);
    }

    #[test]
    fn parse_paginated_missing_key_is_empty() {
        let page: PaginatedResult<String> =
            parse_paginated(&serde_json::json!({"Logs": null}), "Logs").unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.total_count, 0);
    }

    #[test]
    fn parse_node_empty_body_is_none() {
        assert!(parse_node(serde_json::Value::Null).unwrap().is_none());
        assert!(parse_node(serde_json::json!({})).unwrap().is_none());
        let node = parse_node(serde_json::json!({
            "Metadata": {"Name": "root", "NodeId": "n0"},
            "StatusInfo": {"Status": "Running"}
        }))
        .unwrap()
        .unwrap();
        assert_eq!(node.metadata.name, "root");
    }

    #[test]
    fn map_error_auth() {
        let err = map_error("GetRun", reqwest::StatusCode::FORBIDDEN, "");
        assert!(matches!(err, PaiError::AuthError { .. }));
    }

    #[test]
    fn map_error_server_errors_are_retryable() {
        let err = map_error(
            "ListRuns",
            reqwest::StatusCode::SERVICE_UNAVAILABLE,
            r#"{"Message": "busy"}"#,
        );
        match err {
            PaiError::ApiError {
                status,
                message,
                retryable,
                ..
            } => {
                assert_eq!(status, 503);
                assert_eq!(message, "busy");
                assert!(retryable);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn map_error_client_errors_are_permanent() {
        let err = map_error("CreateRun", reqwest::StatusCode::BAD_REQUEST, "bad manifest");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("bad manifest"));
    }

    #[test]
    fn map_error_not_found() {
        let err = map_error(
            "GetRun",
            reqwest::StatusCode::NOT_FOUND,
            r#"{"message": "run flow-x does not exist"}"#,
        );
        assert_eq!(err.to_string(), "GetRun: run flow-x does not exist not found");
    }
}
