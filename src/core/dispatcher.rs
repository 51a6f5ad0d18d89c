//! Step dispatcher: executes exactly one due step end-to-end.
//!
//! The [`StepDispatcher`] substitutes variables, runs the type-specific
//! handler, applies extraction and the failure policy, and records a single
//! [`StepResult`]. It never fails outward: every step-local error, including a
//! panicking strategy, becomes an `error` result. Frame changes are reported
//! back as a [`StepEffect`] for the [`ExecutionStack`](super::stack::ExecutionStack)
//! to apply.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::StepError;
use crate::model::{
    ConditionStep, Context, ExtractionFailure, FailurePolicy, LoopStep, Marker, RequestStep,
    ResultLog, Step, StepKind, StepResult, StepStatus,
};
use crate::strategy::{ConditionEvaluator, PathEvaluator, Substitutor};

use super::event_bus::{ExecutionListener, ExecutionPath, Severity};
use super::extraction::apply_extractions;
use super::panic_guard::guarded;
use super::request::RequestExecutor;
use super::stack::{ChildFrame, FrameKind, LoopState, StepEffect};
use super::stop_signal::StopSignal;

/// Everything one handler produced, before it is written to the result log.
struct StepRun {
    status: StepStatus,
    output: Option<Value>,
    error: Option<StepError>,
    failures: Vec<ExtractionFailure>,
    effect: StepEffect,
    marker: Option<Marker>,
}

impl StepRun {
    fn success(output: Value, effect: StepEffect) -> Self {
        Self {
            status: StepStatus::Success,
            output: Some(output),
            error: None,
            failures: Vec::new(),
            effect,
            marker: None,
        }
    }

    fn failed(error: StepError) -> Self {
        Self {
            status: StepStatus::Error,
            output: None,
            error: Some(error),
            failures: Vec::new(),
            effect: StepEffect::StayedOnFrame,
            marker: None,
        }
    }
}

pub struct StepDispatcher {
    substitutor: Arc<dyn Substitutor>,
    conditions: Arc<dyn ConditionEvaluator>,
    paths: Arc<dyn PathEvaluator>,
    requests: RequestExecutor,
    listener: Arc<dyn ExecutionListener>,
}

impl StepDispatcher {
    pub fn new(
        substitutor: Arc<dyn Substitutor>,
        conditions: Arc<dyn ConditionEvaluator>,
        paths: Arc<dyn PathEvaluator>,
        requests: RequestExecutor,
        listener: Arc<dyn ExecutionListener>,
    ) -> Self {
        Self {
            substitutor,
            conditions,
            paths,
            requests,
            listener,
        }
    }

    /// Run `step` against its frame's live `context`.
    ///
    /// Appends exactly one step result (plus a branch marker for conditions)
    /// to `results`. A fatal failure halts the flow through `stop`.
    pub async fn dispatch(
        &self,
        step: &Step,
        context: &mut Context,
        path: &ExecutionPath,
        results: &mut ResultLog,
        stop: &StopSignal,
    ) -> StepEffect {
        let slot = self.listener.on_start(step, path);
        let index = results.push(StepResult::pending(&step.id, step.label()));
        tracing::debug!(step = %step.id, kind = step.kind_name(), path = %path, "dispatch step");

        let StepRun {
            status,
            output,
            error,
            failures,
            effect,
            marker,
        } = self.execute(step, context, stop).await;

        if let Some(result) = results.get_mut(index) {
            result.finish(status, output, error.as_ref().map(ToString::to_string));
            result.extraction_failures = failures;
        }

        if let Some(e) = &error {
            self.listener.on_error(slot, step, e, context, path);
        }
        if let Some(result) = results.get(index) {
            self.listener.on_complete(slot, step, result, context, path);
        }

        if let Some(marker) = marker {
            let marker_status = match &marker {
                Marker::Branch { steps: 0, .. } => StepStatus::Skipped,
                _ => StepStatus::Success,
            };
            let entry = StepResult::marker(&step.id, marker_status, marker);
            self.listener.on_marker(&entry, path);
            results.push(entry);
        }

        if let Some(e) = &error {
            self.apply_failure_policy(step, e, stop);
        }

        effect
    }

    fn apply_failure_policy(&self, step: &Step, error: &StepError, stop: &StopSignal) {
        // Anything the request executor could not classify always halts.
        let policy = if error.is_request_failure() {
            step.failure_policy()
        } else {
            FailurePolicy::Stop
        };
        match policy {
            FailurePolicy::Stop => {
                let message = if stop.is_user_stop() {
                    format!("Flow stopped by user during step '{}'", step.label())
                } else {
                    format!("Flow halted at step '{}': {}", step.label(), error)
                };
                tracing::error!(step = %step.id, error = %error, "halting flow");
                stop.halt();
                self.listener.on_message(&message, Severity::Error);
            }
            FailurePolicy::Continue => {
                tracing::warn!(step = %step.id, error = %error, "step failed, continuing");
                self.listener.on_message(
                    &format!("Step '{}' failed, continuing: {}", step.label(), error),
                    Severity::Warning,
                );
            }
        }
    }

    async fn execute(&self, step: &Step, context: &mut Context, stop: &StopSignal) -> StepRun {
        let snapshot = context.clone();
        let substitution = match guarded(|| self.substitutor.substitute(step, &snapshot)) {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return StepRun::failed(StepError::Substitution(e.to_string())),
            Err(panic) => return StepRun::failed(StepError::Internal(format!("substitution {}", panic))),
        };

        match (&step.kind, &substitution.step.kind) {
            (StepKind::Request(_), StepKind::Request(request)) => {
                self.run_request(request, &substitution.unquoted, context, stop)
                    .await
            }
            (StepKind::Condition(original), StepKind::Condition(condition)) => {
                self.run_condition(step, original, condition, context)
            }
            (StepKind::Loop(original), StepKind::Loop(lp)) => {
                self.run_loop(step, original, lp, context)
            }
            (_, other) => StepRun::failed(StepError::Internal(format!(
                "substitution turned {} step '{}' into a {} step",
                step.kind_name(),
                step.id,
                other.name()
            ))),
        }
    }

    async fn run_request(
        &self,
        request: &RequestStep,
        unquoted: &HashMap<String, String>,
        context: &mut Context,
        stop: &StopSignal,
    ) -> StepRun {
        let outcome = self.requests.execute(request, unquoted, stop).await;

        let mut failures = Vec::new();
        if outcome.status == StepStatus::Success && !request.extract.is_empty() {
            if let Some(output) = &outcome.output {
                let report = apply_extractions(&request.extract, output, context, self.paths.as_ref());
                if report.changed {
                    self.listener.on_context_changed(context);
                }
                failures = report.failures;
            }
        }

        StepRun {
            status: outcome.status,
            output: outcome.output,
            error: outcome.error,
            failures,
            effect: StepEffect::StayedOnFrame,
            marker: None,
        }
    }

    /// Branch steps come from the original step so each child is substituted
    /// against its own frame when it runs.
    fn run_condition(
        &self,
        step: &Step,
        original: &ConditionStep,
        condition: &ConditionStep,
        context: &Context,
    ) -> StepRun {
        let taken = match guarded(|| self.conditions.evaluate(&condition.condition, context)) {
            Ok(Ok(taken)) => taken,
            Ok(Err(e)) => return StepRun::failed(StepError::ConditionEvaluation(e.to_string())),
            Err(panic) => return StepRun::failed(StepError::ConditionEvaluation(panic)),
        };

        let (kind, steps) = if taken {
            (FrameKind::Then, original.then_steps.clone())
        } else {
            (FrameKind::Else, original.else_steps.clone())
        };
        let branch = kind.to_string();
        tracing::debug!(step = %step.id, %branch, steps = steps.len(), "branch selected");

        let marker = Marker::Branch {
            branch: branch.clone(),
            steps: steps.len(),
        };
        let child = ChildFrame::branch(kind, &step.id, steps, context.clone());
        let mut run = StepRun::success(
            json!({"result": taken, "branch": branch}),
            StepEffect::PushChild(child),
        );
        run.marker = Some(marker);
        run
    }

    fn run_loop(&self, step: &Step, original: &LoopStep, lp: &LoopStep, context: &Context) -> StepRun {
        let data = context.to_value();
        let source = match guarded(|| self.paths.evaluate(&data, &lp.source)) {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => return StepRun::failed(StepError::LoopSource(e.to_string())),
            Err(panic) => return StepRun::failed(StepError::LoopSource(panic)),
        };

        let items = match source {
            None | Some(Value::Null) => {
                let message = format!(
                    "Loop '{}': source '{}' is undefined, treating it as empty",
                    step.label(),
                    lp.source
                );
                tracing::warn!(step = %step.id, source = %lp.source, "loop source undefined");
                self.listener.on_message(&message, Severity::Warning);
                Vec::new()
            }
            Some(Value::Array(items)) => items,
            Some(other) => {
                return StepRun::failed(StepError::LoopSource(format!(
                    "'{}' resolved to {} instead of an array",
                    lp.source,
                    json_type_name(&other)
                )))
            }
        };

        let output = json!({"items": items.len(), "loopVariable": lp.loop_variable});
        if items.is_empty() {
            return StepRun::success(output, StepEffect::StayedOnFrame);
        }

        let state = LoopState::new(items, lp.loop_variable.clone(), context.clone());
        let child = ChildFrame::looping(&step.id, original.body_steps.clone(), state);
        StepRun::success(output, StepEffect::PushChild(child))
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
