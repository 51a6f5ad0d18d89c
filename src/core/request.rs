//! Request execution: body preparation, the bounded call, and outcome
//! classification against the step's failure policy.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::{Map, Value};

use crate::error::StepError;
use crate::model::{FailurePolicy, RequestStep, StepStatus};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

use super::panic_guard::panic_message;
use super::stop_signal::StopSignal;

/// Classified result of one request step.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    pub status: StepStatus,
    /// `{status, headers, body, durationMs}` when a response arrived.
    pub output: Option<Value>,
    pub error: Option<StepError>,
}

impl RequestOutcome {
    fn failed(error: StepError) -> Self {
        Self {
            status: StepStatus::Error,
            output: None,
            error: Some(error),
        }
    }
}

pub struct RequestExecutor {
    transport: Arc<dyn HttpTransport>,
    timeout: Duration,
}

impl RequestExecutor {
    pub fn new(transport: Arc<dyn HttpTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Send an already substituted request.
    ///
    /// The call is dropped when the timeout fires or `stop` is triggered; the
    /// request token derived from `stop` is released on every path.
    pub async fn execute(
        &self,
        request: &RequestStep,
        unquoted: &HashMap<String, String>,
        stop: &StopSignal,
    ) -> RequestOutcome {
        let http_request = match prepare_request(request, unquoted) {
            Ok(r) => r,
            Err(e) => return RequestOutcome::failed(e),
        };

        tracing::debug!(method = %http_request.method, url = %http_request.url, "sending request");
        let started = Instant::now();
        let token = stop.request_token();
        let call = AssertUnwindSafe(self.transport.send(http_request)).catch_unwind();

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(StepError::Aborted),
            r = tokio::time::timeout(self.timeout, call) => match r {
                Err(_) => Err(StepError::Timeout(self.timeout.as_millis() as u64)),
                Ok(Err(panic)) => Err(StepError::Internal(format!("transport {}", panic_message(panic)))),
                Ok(Ok(Err(e))) => Err(StepError::Transport(e.to_string())),
                Ok(Ok(Ok(response))) => Ok(response),
            },
        };
        drop(token);

        match result {
            Ok(response) => classify(response, started.elapsed(), request.on_failure),
            Err(e) => {
                tracing::warn!(url = %request.url, error = %e, "request failed");
                RequestOutcome::failed(e)
            }
        }
    }
}

/// Build the wire request. Only POST/PUT/PATCH carry a body.
pub fn prepare_request(
    request: &RequestStep,
    unquoted: &HashMap<String, String>,
) -> Result<HttpRequest, StepError> {
    let mut headers: Vec<(String, String)> = request
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let body = match &request.body {
        Some(body) if request.method.sends_body() && !body.is_null() => {
            Some(prepare_body(body, unquoted, &mut headers)?)
        }
        _ => None,
    };

    Ok(HttpRequest {
        method: request.method,
        url: request.url.clone(),
        headers,
        body,
    })
}

fn prepare_body(
    body: &Value,
    unquoted: &HashMap<String, String>,
    headers: &mut Vec<(String, String)>,
) -> Result<String, StepError> {
    let structured = !body.is_string();
    let mut text = match body {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other)
            .map_err(|e| StepError::BodyPreparation(e.to_string()))?,
    };

    // Longest first so a placeholder never clobbers a longer one it prefixes.
    let mut placeholders: Vec<(&String, &String)> = unquoted.iter().collect();
    placeholders.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));
    for (placeholder, raw) in placeholders {
        text = text.replace(&format!("\"{}\"", placeholder), raw);
        text = text.replace(placeholder.as_str(), raw);
    }

    let content_type = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        .map(|(_, v)| v.to_ascii_lowercase());
    let is_json = match content_type {
        Some(ct) => ct.contains("json"),
        None if structured => {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
            true
        }
        None => false,
    };

    if is_json {
        serde_json::from_str::<Value>(&text).map_err(|e| {
            StepError::BodyPreparation(format!("body is not valid JSON after substitution: {}", e))
        })?;
    }

    Ok(text)
}

fn classify(response: HttpResponse, elapsed: Duration, policy: FailurePolicy) -> RequestOutcome {
    let status = response.status;
    let ok = response.is_success();
    let output = response_output(response, elapsed);

    if ok {
        return RequestOutcome {
            status: StepStatus::Success,
            output: Some(output),
            error: None,
        };
    }

    match policy {
        FailurePolicy::Stop => RequestOutcome {
            status: StepStatus::Error,
            output: Some(output),
            error: Some(StepError::HttpStatus { status }),
        },
        FailurePolicy::Continue => {
            tracing::warn!(status, "non-2xx response accepted by continue policy");
            RequestOutcome {
                status: StepStatus::Success,
                output: Some(output),
                error: None,
            }
        }
    }
}

fn response_output(response: HttpResponse, elapsed: Duration) -> Value {
    let body = parse_body(&response);
    let headers: Map<String, Value> = response
        .headers
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();

    let mut output = Map::new();
    output.insert("status".into(), Value::from(response.status));
    output.insert("headers".into(), Value::Object(headers));
    output.insert("body".into(), body);
    output.insert("durationMs".into(), Value::from(elapsed.as_millis() as u64));
    Value::Object(output)
}

/// Empty and 204 bodies are `null`; JSON is parsed; anything else stays text.
fn parse_body(response: &HttpResponse) -> Value {
    if response.status == 204 || response.body.trim().is_empty() {
        return Value::Null;
    }
    match serde_json::from_str(&response.body) {
        Ok(value) => value,
        Err(e) => {
            let declared_json = response
                .header("content-type")
                .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"));
            if declared_json {
                tracing::warn!(error = %e, "response declared JSON but did not parse");
            }
            Value::String(response.body.clone())
        }
    }
}
