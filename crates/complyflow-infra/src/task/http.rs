//! HTTP task backend.
//!
//! Each Task resource is a POST to `{base_url}/tasks/{resource}` with the
//! rendered payload as the JSON body. Async invocations carry
//! `X-Invocation-Type: Event` and only wait for the backend to accept.
//!
//! Response mapping:
//! - 2xx: body is the task result (`null` for an empty body).
//! - 5xx or connection failure: `States.BackendUnavailable`.
//! - client-side timeout: `States.Timeout`.
//! - 4xx with `{errorType, errorMessage}`: the handler's own error class.
//! - any other 4xx: `States.TaskFailed`.

use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;

use complyflow_core::task::{TaskError, TaskInvoker};
use complyflow_types::config::BackendConfig;
use complyflow_types::workflow::InvocationMode;

const INVOCATION_TYPE_HEADER: &str = "X-Invocation-Type";

/// Error body returned by a task handler.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandlerError {
    error_type: String,
    #[serde(default)]
    error_message: String,
}

/// reqwest-backed [`TaskInvoker`].
pub struct HttpTaskInvoker {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTaskInvoker {
    pub fn new(config: &BackendConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, resource: &str) -> String {
        format!("{}/tasks/{}", self.base_url, resource)
    }

    async fn call(
        &self,
        resource: &str,
        payload: Value,
        mode: InvocationMode,
    ) -> Result<Value, TaskError> {
        let invocation_type = match mode {
            InvocationMode::Sync => "RequestResponse",
            InvocationMode::Async => "Event",
        };

        let response = self
            .client
            .post(self.url(resource))
            .header(INVOCATION_TYPE_HEADER, invocation_type)
            .json(&payload)
            .send()
            .await
            .map_err(|e| classify_transport_error(resource, &e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport_error(resource, &e))?;

        if status.is_success() {
            if mode == InvocationMode::Async || body.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&body).map_err(|e| {
                TaskError::task_failed(format!("{resource} returned invalid JSON: {e}"))
            });
        }

        if status.is_server_error() {
            tracing::warn!(resource, status = status.as_u16(), "task backend error");
            return Err(TaskError::backend_unavailable(format!(
                "{resource} returned HTTP {status}"
            )));
        }

        match serde_json::from_str::<HandlerError>(&body) {
            Ok(handler) if !handler.error_type.is_empty() => {
                Err(TaskError::new(handler.error_type, handler.error_message))
            }
            _ => Err(TaskError::task_failed(format!(
                "{resource} returned HTTP {status}: {}",
                body.chars().take(200).collect::<String>()
            ))),
        }
    }
}

fn classify_transport_error(resource: &str, err: &reqwest::Error) -> TaskError {
    if err.is_timeout() {
        TaskError::timeout(format!("{resource} did not respond in time"))
    } else {
        tracing::warn!(resource, error = %err, "task backend unreachable");
        TaskError::backend_unavailable(format!("{resource}: {err}"))
    }
}

impl TaskInvoker for HttpTaskInvoker {
    fn invoke<'a>(
        &'a self,
        resource: &'a str,
        payload: Value,
        mode: InvocationMode,
    ) -> BoxFuture<'a, Result<Value, TaskError>> {
        Box::pin(self.call(resource, payload, mode))
    }
}
