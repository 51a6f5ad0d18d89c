//! Step variants and their payloads.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One node of the step tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Request(RequestStep),
    Condition(ConditionStep),
    Loop(LoopStep),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStep {
    #[serde(default)]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// `varName -> pathExpression`
    #[serde(default)]
    pub extract: BTreeMap<String, String>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionStep {
    pub condition: Predicate,
    #[serde(default)]
    pub then_steps: Vec<Step>,
    #[serde(default)]
    pub else_steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStep {
    /// Path to the collection in the current context.
    pub source: String,
    pub loop_variable: String,
    #[serde(default)]
    pub body_steps: Vec<Step>,
}

/// Predicate descriptor handed to the condition evaluator as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub variable: String,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Stop,
    Continue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }

    /// Methods that carry a request body.
    pub fn sends_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Request(_) => "request",
            StepKind::Condition(_) => "condition",
            StepKind::Loop(_) => "loop",
        }
    }
}

impl Step {
    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    /// Name for logs and messages, falling back to the id.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn as_request(&self) -> Option<&RequestStep> {
        match &self.kind {
            StepKind::Request(request) => Some(request),
            _ => None,
        }
    }

    /// Failure policy; condition and loop steps always stop.
    pub fn failure_policy(&self) -> FailurePolicy {
        match &self.kind {
            StepKind::Request(request) => request.on_failure,
            _ => FailurePolicy::Stop,
        }
    }

    /// Direct child steps, in declaration order.
    pub fn children(&self) -> Vec<&Step> {
        match &self.kind {
            StepKind::Request(_) => Vec::new(),
            StepKind::Condition(cond) => cond.then_steps.iter().chain(&cond.else_steps).collect(),
            StepKind::Loop(lp) => lp.body_steps.iter().collect(),
        }
    }
}
