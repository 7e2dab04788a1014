//! Gateway - トランスポート非依存のリクエストルーター
//!
//! `POST /submit`, `/cancel`, `/result` 相当のリクエストを JSON で受け取り、
//! 各サービスに振り分けて、エラーをクライアント向けのステータスに変換する。
//! 認証は扱わない。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::app::cancel::CancelService;
use crate::app::results::{GetResultsService, TaskResult};
use crate::app::submit::{SubmitRequest, SubmitService};
use crate::domain::{ErrorKind, GridError, NewTask, SessionId, TaskId, TaskStatus};
use crate::ports::{PageRequest, PageToken};

const DEFAULT_PAGE_LIMIT: usize = 100;

/// Task payload on the wire: any JSON value, stored as its serialized bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTask {
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GatewayRequest {
    Submit {
        owner: String,
        #[serde(default)]
        session_id: Option<SessionId>,
        #[serde(default)]
        priority: u32,
        #[serde(default)]
        payload: Value,
    },
    SubmitBatch {
        owner: String,
        session_id: SessionId,
        tasks: Vec<WireTask>,
    },
    Cancel {
        task_id: TaskId,
        #[serde(default)]
        owner: Option<String>,
    },
    GetResult {
        task_id: TaskId,
    },
    GetSessionResults {
        session_id: SessionId,
        #[serde(default)]
        status: Option<TaskStatus>,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        after: Option<PageToken>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    NotFound,
    RetryLater,
    PayloadTooLarge,
    Forbidden,
    InvalidRequest,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub status: ResponseStatus,
    pub body: Value,
}

impl GatewayResponse {
    pub fn ok(body: Value) -> Self {
        Self {
            status: ResponseStatus::Ok,
            body,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

impl From<GridError> for GatewayResponse {
    fn from(err: GridError) -> Self {
        let status = match &err {
            GridError::NotFound(_) | GridError::BlobNotFound(_) => ResponseStatus::NotFound,
            GridError::PayloadTooLarge { .. } => ResponseStatus::PayloadTooLarge,
            GridError::Forbidden { .. } => ResponseStatus::Forbidden,
            GridError::InvalidRequest(_) | GridError::Serialization(_) => {
                ResponseStatus::InvalidRequest
            }
            _ => match err.kind() {
                ErrorKind::Transient | ErrorKind::Conflict => ResponseStatus::RetryLater,
                ErrorKind::Permanent => ResponseStatus::Internal,
            },
        };
        Self {
            status,
            body: json!({ "error": err.to_string() }),
        }
    }
}

pub struct Gateway {
    submit: Arc<SubmitService>,
    cancel: Arc<CancelService>,
    results: Arc<GetResultsService>,
}

impl Gateway {
    pub fn new(
        submit: Arc<SubmitService>,
        cancel: Arc<CancelService>,
        results: Arc<GetResultsService>,
    ) -> Self {
        Self {
            submit,
            cancel,
            results,
        }
    }

    /// Decode, route, encode. Malformed input is an `invalid_request` response.
    pub async fn handle_json(&self, raw: &str) -> String {
        let response = match serde_json::from_str::<GatewayRequest>(raw) {
            Ok(request) => self.handle(request).await,
            Err(e) => GatewayResponse {
                status: ResponseStatus::InvalidRequest,
                body: json!({ "error": format!("malformed request: {e}") }),
            },
        };
        serde_json::to_string(&response).unwrap_or_else(|e| {
            format!(r#"{{"status":"internal","body":{{"error":"{e}"}}}}"#)
        })
    }

    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        match self.route(request).await {
            Ok(body) => GatewayResponse::ok(body),
            Err(e) => {
                let response = GatewayResponse::from(e);
                if response.status == ResponseStatus::Internal {
                    tracing::error!(body = %response.body, "gateway request failed");
                } else {
                    tracing::debug!(status = ?response.status, "gateway request rejected");
                }
                response
            }
        }
    }

    async fn route(&self, request: GatewayRequest) -> Result<Value, GridError> {
        match request {
            GatewayRequest::Submit {
                owner,
                session_id,
                priority,
                payload,
            } => {
                let task = WireTask { priority, payload };
                let receipt = self
                    .submit
                    .submit(to_submit_request(owner, session_id, task)?)
                    .await?;
                Ok(serde_json::to_value(receipt)?)
            }
            GatewayRequest::SubmitBatch {
                owner,
                session_id,
                tasks,
            } => {
                let requests = tasks
                    .into_iter()
                    .map(|task| to_submit_request(owner.clone(), Some(session_id.clone()), task))
                    .collect::<Result<Vec<_>, _>>()?;
                let batch = self.submit.submit_batch(session_id, requests).await?;
                Ok(serde_json::to_value(batch)?)
            }
            GatewayRequest::Cancel { task_id, owner } => {
                let outcome = self.cancel.cancel(task_id, owner.as_deref()).await?;
                Ok(serde_json::to_value(outcome)?)
            }
            GatewayRequest::GetResult { task_id } => {
                let result = self.results.get_result(task_id).await?;
                Ok(result_body(&result))
            }
            GatewayRequest::GetSessionResults {
                session_id,
                status,
                limit,
                after,
            } => {
                let page = PageRequest {
                    limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).max(1),
                    after,
                };
                let results = self
                    .results
                    .get_session_results(&session_id, status, page)
                    .await?;
                Ok(serde_json::to_value(results)?)
            }
        }
    }
}

fn to_submit_request(
    owner: String,
    session_id: Option<SessionId>,
    task: WireTask,
) -> Result<SubmitRequest, GridError> {
    Ok(SubmitRequest {
        task: NewTask {
            priority: task.priority,
            owner,
            session_id,
        },
        payload: serde_json::to_vec(&task.payload)?,
    })
}

/// Results go back as JSON when they parse, as text otherwise.
fn result_body(result: &TaskResult) -> Value {
    let decoded = result.result.as_ref().map(|bytes| {
        serde_json::from_slice::<Value>(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
    });
    json!({
        "task_id": result.task_id,
        "task_status": result.task_status,
        "result": decoded,
        "error": result.error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::builder::GridBuilder;
    use crate::app::config::GridConfig;
    use rstest::rstest;
    use ulid::Ulid;

    fn gateway() -> Gateway {
        GridBuilder::new(GridConfig::default())
            .build()
            .unwrap()
            .gateway()
    }

    #[test]
    fn requests_are_tagged_by_action() {
        let request: GatewayRequest = serde_json::from_str(
            r#"{"action":"submit","owner":"alice","priority":2,"payload":{"n":1}}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            GatewayRequest::Submit {
                owner: "alice".to_string(),
                session_id: None,
                priority: 2,
                payload: json!({"n": 1}),
            }
        );
    }

    #[rstest]
    #[case(GridError::NotFound(TaskId::from_ulid(Ulid::new())), ResponseStatus::NotFound)]
    #[case(GridError::transient("queue", "down"), ResponseStatus::RetryLater)]
    #[case(GridError::PayloadTooLarge { size: 2, limit: 1 }, ResponseStatus::PayloadTooLarge)]
    #[case(GridError::InvalidRequest("x".into()), ResponseStatus::InvalidRequest)]
    #[case(GridError::Config("x".into()), ResponseStatus::Internal)]
    fn errors_map_to_statuses(#[case] err: GridError, #[case] expected: ResponseStatus) {
        assert_eq!(GatewayResponse::from(err).status, expected);
    }

    #[tokio::test]
    async fn submit_then_get_result_is_pending() {
        let gateway = gateway();
        let submitted = gateway
            .handle(GatewayRequest::Submit {
                owner: "alice".to_string(),
                session_id: None,
                priority: 0,
                payload: json!({"x": 1}),
            })
            .await;
        assert!(submitted.is_ok());
        let task_id: TaskId = serde_json::from_value(submitted.body["task_id"].clone()).unwrap();

        let result = gateway.handle(GatewayRequest::GetResult { task_id }).await;
        assert!(result.is_ok());
        assert_eq!(result.body["task_status"], json!("PENDING"));
        assert_eq!(result.body["result"], Value::Null);
    }

    #[tokio::test]
    async fn malformed_json_is_invalid_request() {
        let raw = gateway().handle_json(r#"{"action":"explode"}"#).await;
        let response: GatewayResponse = serde_json::from_str(&raw).unwrap();
        assert_eq!(response.status, ResponseStatus::InvalidRequest);
    }

    #[tokio::test]
    async fn cancel_by_another_owner_is_forbidden() {
        let gateway = gateway();
        let raw = gateway
            .handle_json(r#"{"action":"submit","owner":"alice","payload":"hi"}"#)
            .await;
        let submitted: GatewayResponse = serde_json::from_str(&raw).unwrap();
        let task_id: TaskId = serde_json::from_value(submitted.body["task_id"].clone()).unwrap();

        let response = gateway
            .handle(GatewayRequest::Cancel {
                task_id,
                owner: Some("mallory".to_string()),
            })
            .await;
        assert_eq!(response.status, ResponseStatus::Forbidden);
    }

    #[tokio::test]
    async fn batch_progress_is_reported() {
        let gateway = gateway();
        let response = gateway
            .handle(GatewayRequest::SubmitBatch {
                owner: "alice".to_string(),
                session_id: SessionId::new("s-1"),
                tasks: vec![
                    WireTask {
                        priority: 0,
                        payload: json!(1),
                    },
                    WireTask {
                        priority: 0,
                        payload: json!(2),
                    },
                ],
            })
            .await;
        assert!(response.is_ok());

        let progress = gateway
            .handle(GatewayRequest::GetSessionResults {
                session_id: SessionId::new("s-1"),
                status: None,
                limit: None,
                after: None,
            })
            .await;
        assert_eq!(progress.body["progress"]["pending"], json!(2));
    }
}
