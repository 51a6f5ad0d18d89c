//! Notifications emitted while a flow executes.
//!
//! The engine calls an [`ExecutionListener`] synchronously at well-defined
//! points. [`ChannelListener`] adapts those calls into [`EngineEvent`]s on a
//! tokio channel for hosts that prefer to consume them asynchronously.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::StepError;
use crate::model::{Context, ResultLog, Step, StepResult};

use super::stack::FrameKind;

/// Opaque handle tying a start notification to its completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct ResultSlot(pub u64);

impl ResultSlot {
    pub const NONE: ResultSlot = ResultSlot(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathSegment {
    pub kind: FrameKind,
    pub parent_step_id: Option<String>,
    pub iteration: Option<usize>,
}

/// Where in the step tree a step is running, outermost frame first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionPath(pub Vec<PathSegment>);

impl ExecutionPath {
    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}", seg.kind)?;
            if let Some(parent) = &seg.parent_step_id {
                write!(f, ":{}", parent)?;
            }
            if let Some(index) = seg.iteration {
                write!(f, "[{}]", index)?;
            }
        }
        Ok(())
    }
}

/// Sink for engine notifications. Every method defaults to a no-op.
///
/// Listeners run inside the engine's critical section: they may call
/// [`FlowEngine::stop`](crate::core::FlowEngine::stop) but must not await
/// other engine methods.
pub trait ExecutionListener: Send + Sync {
    fn on_start(&self, _step: &Step, _path: &ExecutionPath) -> ResultSlot {
        ResultSlot::NONE
    }

    fn on_complete(
        &self,
        _slot: ResultSlot,
        _step: &Step,
        _result: &StepResult,
        _context: &Context,
        _path: &ExecutionPath,
    ) {
    }

    fn on_error(
        &self,
        _slot: ResultSlot,
        _step: &Step,
        _error: &StepError,
        _context: &Context,
        _path: &ExecutionPath,
    ) {
    }

    fn on_marker(&self, _result: &StepResult, _path: &ExecutionPath) {}

    fn on_flow_complete(&self, _context: &Context, _results: &ResultLog) {}

    fn on_flow_stopped(&self, _context: &Context, _results: &ResultLog) {}

    fn on_message(&self, _text: &str, _severity: Severity) {}

    fn on_context_changed(&self, _context: &Context) {}

    /// Presentation layers should re-read engine state.
    fn on_refresh(&self) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl ExecutionListener for NoopListener {}

/// Event form of every listener call.
#[derive(Clone, Debug, Serialize)]
pub enum EngineEvent {
    StepStarted {
        slot: ResultSlot,
        step_id: String,
        path: String,
        timestamp: DateTime<Utc>,
    },
    StepCompleted {
        slot: ResultSlot,
        result: StepResult,
        context: Value,
        path: String,
    },
    StepFailed {
        slot: ResultSlot,
        step_id: String,
        error: String,
        path: String,
        timestamp: DateTime<Utc>,
    },
    Marker {
        result: StepResult,
        path: String,
    },
    FlowCompleted {
        context: Value,
        results: ResultLog,
        timestamp: DateTime<Utc>,
    },
    FlowStopped {
        context: Value,
        results: ResultLog,
        timestamp: DateTime<Utc>,
    },
    Message {
        text: String,
        severity: Severity,
    },
    ContextChanged {
        context: Value,
    },
    Refresh,
}

pub type EventSender = mpsc::UnboundedSender<EngineEvent>;

pub type EventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

pub fn create_event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Forwards notifications to an [`EventSender`]; allocates slot ids itself.
pub struct ChannelListener {
    tx: EventSender,
    next_slot: AtomicU64,
}

impl ChannelListener {
    pub fn new(tx: EventSender) -> Self {
        Self {
            tx,
            next_slot: AtomicU64::new(1),
        }
    }

    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = create_event_channel();
        (Self::new(tx), rx)
    }

    fn emit(&self, event: EngineEvent) {
        // A dropped receiver only means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}

impl ExecutionListener for ChannelListener {
    fn on_start(&self, step: &Step, path: &ExecutionPath) -> ResultSlot {
        let slot = ResultSlot(self.next_slot.fetch_add(1, Ordering::Relaxed));
        self.emit(EngineEvent::StepStarted {
            slot,
            step_id: step.id.clone(),
            path: path.to_string(),
            timestamp: Utc::now(),
        });
        slot
    }

    fn on_complete(
        &self,
        slot: ResultSlot,
        _step: &Step,
        result: &StepResult,
        context: &Context,
        path: &ExecutionPath,
    ) {
        self.emit(EngineEvent::StepCompleted {
            slot,
            result: result.clone(),
            context: context.to_value(),
            path: path.to_string(),
        });
    }

    fn on_error(
        &self,
        slot: ResultSlot,
        step: &Step,
        error: &StepError,
        _context: &Context,
        path: &ExecutionPath,
    ) {
        self.emit(EngineEvent::StepFailed {
            slot,
            step_id: step.id.clone(),
            error: error.to_string(),
            path: path.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn on_marker(&self, result: &StepResult, path: &ExecutionPath) {
        self.emit(EngineEvent::Marker {
            result: result.clone(),
            path: path.to_string(),
        });
    }

    fn on_flow_complete(&self, context: &Context, results: &ResultLog) {
        self.emit(EngineEvent::FlowCompleted {
            context: context.to_value(),
            results: results.clone(),
            timestamp: Utc::now(),
        });
    }

    fn on_flow_stopped(&self, context: &Context, results: &ResultLog) {
        self.emit(EngineEvent::FlowStopped {
            context: context.to_value(),
            results: results.clone(),
            timestamp: Utc::now(),
        });
    }

    fn on_message(&self, text: &str, severity: Severity) {
        self.emit(EngineEvent::Message {
            text: text.to_string(),
            severity,
        });
    }

    fn on_context_changed(&self, context: &Context) {
        self.emit(EngineEvent::ContextChanged {
            context: context.to_value(),
        });
    }

    fn on_refresh(&self) {
        self.emit(EngineEvent::Refresh);
    }
}
