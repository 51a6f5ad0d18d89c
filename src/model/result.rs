//! Step results and the per-run result log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Success,
    Error,
    Skipped,
    Stopped,
}

/// A single extraction rule that produced no value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionFailure {
    pub var_name: String,
    pub path: String,
    pub reason: String,
}

/// Synthetic entries the engine writes alongside real step results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "marker", rename_all = "snake_case")]
pub enum Marker {
    /// A condition step took a branch. `steps` is 0 when the branch was empty.
    Branch { branch: String, steps: usize },
    /// A loop frame was rewound for the next item.
    Iteration { index: usize, total: usize },
    /// A loop frame ran out of items and was popped.
    LoopEnd { iterations: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub step_name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extraction_failures: Vec<ExtractionFailure>,
    #[serde(flatten)]
    pub marker: Option<Marker>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn pending(step_id: impl Into<String>, step_name: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            step_name: step_name.into(),
            status: StepStatus::Pending,
            output: None,
            error: None,
            extraction_failures: Vec::new(),
            marker: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn marker(step_id: impl Into<String>, status: StepStatus, marker: Marker) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            step_name: String::new(),
            status,
            output: None,
            error: None,
            extraction_failures: Vec::new(),
            marker: Some(marker),
            started_at: now,
            finished_at: Some(now),
        }
    }

    pub fn is_marker(&self) -> bool {
        self.marker.is_some()
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }

    pub(crate) fn finish(&mut self, status: StepStatus, output: Option<Value>, error: Option<String>) {
        self.status = status;
        self.output = output;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }
}

/// Results of one execution, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultLog(Vec<StepResult>);

impl ResultLog {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append a result and return its position.
    pub fn push(&mut self, result: StepResult) -> usize {
        self.0.push(result);
        self.0.len() - 1
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut StepResult> {
        self.0.get_mut(index)
    }

    pub fn get(&self, index: usize) -> Option<&StepResult> {
        self.0.get(index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepResult> {
        self.0.iter()
    }

    pub fn last(&self) -> Option<&StepResult> {
        self.0.last()
    }

    /// Real step results, markers left out.
    pub fn step_results(&self) -> impl Iterator<Item = &StepResult> {
        self.0.iter().filter(|r| !r.is_marker())
    }

    pub fn step_ids(&self) -> Vec<&str> {
        self.step_results().map(|r| r.step_id.as_str()).collect()
    }

    pub fn as_slice(&self) -> &[StepResult] {
        &self.0
    }
}
