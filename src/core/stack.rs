//! Explicit execution stack over the step tree.
//!
//! Instead of recursing into branches and loop bodies, the engine keeps one
//! [`ScopeFrame`] per active step sequence. The top frame owns the next due
//! step. Dispatching a step returns a [`StepEffect`] telling the stack whether
//! the step stayed on its frame or asked for a child frame; [`ExecutionStack::apply`]
//! advances the parent's cursor and pushes the child in that order, so no
//! identity comparison between frames is ever needed.
//!
//! Loop frames never rewind through the generic pop path: [`LoopState`] is a
//! small state machine and [`ExecutionStack::finish_top`] asks it for the next
//! item before deciding to pop.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::model::{Context, Step};

use super::event_bus::{ExecutionPath, PathSegment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Main,
    Then,
    Else,
    Loop,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FrameKind::Main => "main",
            FrameKind::Then => "then",
            FrameKind::Else => "else",
            FrameKind::Loop => "loop",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    AwaitingItem(usize),
    RunningBody(usize),
    Done,
}

/// Iteration state of a loop frame.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopState {
    items: Vec<Value>,
    var_name: String,
    /// Context captured when the loop step ran; every iteration starts from it.
    base_context: Context,
    phase: LoopPhase,
}

impl LoopState {
    pub fn new(items: Vec<Value>, var_name: impl Into<String>, base_context: Context) -> Self {
        Self {
            items,
            var_name: var_name.into(),
            base_context,
            phase: LoopPhase::AwaitingItem(0),
        }
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn total(&self) -> usize {
        self.items.len()
    }

    pub fn var_name(&self) -> &str {
        &self.var_name
    }

    /// Index of the item whose body is running, if any.
    pub fn current_index(&self) -> Option<usize> {
        match self.phase {
            LoopPhase::RunningBody(i) => Some(i),
            _ => None,
        }
    }

    /// Move on to the next item and build its iteration context, or finish.
    pub fn begin_next(&mut self) -> Option<Context> {
        let next = match self.phase {
            LoopPhase::AwaitingItem(i) => i,
            LoopPhase::RunningBody(i) => i + 1,
            LoopPhase::Done => return None,
        };
        match self.items.get(next) {
            Some(item) => {
                self.phase = LoopPhase::RunningBody(next);
                Some(self.base_context.with_binding(&self.var_name, item.clone()))
            }
            None => {
                self.phase = LoopPhase::Done;
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScopeFrame {
    pub steps: Vec<Step>,
    /// Always within `0..=steps.len()`.
    pub cursor: usize,
    pub context: Context,
    pub kind: FrameKind,
    pub parent_step_id: Option<String>,
    pub loop_state: Option<LoopState>,
}

impl ScopeFrame {
    pub fn due_step(&self) -> Option<&Step> {
        self.steps.get(self.cursor)
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.steps.len()
    }

    fn segment(&self) -> PathSegment {
        PathSegment {
            kind: self.kind,
            parent_step_id: self.parent_step_id.clone(),
            iteration: self.loop_state.as_ref().and_then(LoopState::current_index),
        }
    }
}

/// A frame a dispatched step wants pushed.
#[derive(Debug, Clone)]
pub struct ChildFrame {
    pub steps: Vec<Step>,
    pub context: Context,
    pub kind: FrameKind,
    pub parent_step_id: String,
    pub loop_state: Option<LoopState>,
}

impl ChildFrame {
    pub fn branch(kind: FrameKind, parent_step_id: &str, steps: Vec<Step>, context: Context) -> Self {
        Self {
            steps,
            context,
            kind,
            parent_step_id: parent_step_id.to_string(),
            loop_state: None,
        }
    }

    pub fn looping(parent_step_id: &str, steps: Vec<Step>, state: LoopState) -> Self {
        Self {
            steps,
            context: Context::new(),
            kind: FrameKind::Loop,
            parent_step_id: parent_step_id.to_string(),
            loop_state: Some(state),
        }
    }
}

/// What executing one step did to its frame.
#[derive(Debug, Clone)]
pub enum StepEffect {
    StayedOnFrame,
    PushChild(ChildFrame),
}

/// How [`ExecutionStack::apply`] reconciled a [`StepEffect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Cursor advanced on the frame that held the step.
    Advanced,
    /// Cursor advanced and a child frame now sits on top.
    Pushed,
    /// Cursor advanced; the child had nothing to run and was not pushed.
    SkippedEmpty,
    /// The frame that held the step is gone; nothing to advance.
    FrameGone,
}

/// Result of [`ExecutionStack::finish_top`].
#[derive(Debug)]
pub enum PopOutcome {
    /// The loop frame stayed and was rewound for item `index`.
    NextIteration {
        loop_step_id: String,
        index: usize,
        total: usize,
    },
    /// A loop frame ran out of items and was removed.
    LoopEnded {
        loop_step_id: String,
        iterations: usize,
    },
    /// A non-loop frame was removed.
    Popped(ScopeFrame),
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionStack {
    frames: Vec<ScopeFrame>,
}

impl ExecutionStack {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn top(&self) -> Option<&ScopeFrame> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut ScopeFrame> {
        self.frames.last_mut()
    }

    pub fn frame(&self, depth: usize) -> Option<&ScopeFrame> {
        self.frames.get(depth)
    }

    pub fn frames(&self) -> &[ScopeFrame] {
        &self.frames
    }

    /// Push a plain frame. Returns `false` and pushes nothing when `steps` is empty.
    pub fn push(
        &mut self,
        steps: Vec<Step>,
        context: Context,
        kind: FrameKind,
        parent_step_id: Option<String>,
    ) -> bool {
        if steps.is_empty() {
            tracing::debug!(%kind, parent = ?parent_step_id, "skipping empty frame");
            return false;
        }
        tracing::debug!(%kind, parent = ?parent_step_id, steps = steps.len(), depth = self.frames.len() + 1, "push frame");
        self.frames.push(ScopeFrame {
            steps,
            cursor: 0,
            context,
            kind,
            parent_step_id,
            loop_state: None,
        });
        true
    }

    /// Push a child frame; loop children start on their first item right away.
    pub fn push_child(&mut self, child: ChildFrame) -> bool {
        let ChildFrame {
            steps,
            context,
            kind,
            parent_step_id,
            loop_state,
        } = child;

        let Some(mut state) = loop_state else {
            return self.push(steps, context, kind, Some(parent_step_id));
        };

        if steps.is_empty() {
            tracing::debug!(parent = %parent_step_id, "skipping loop with empty body");
            return false;
        }
        let Some(first) = state.begin_next() else {
            tracing::debug!(parent = %parent_step_id, "skipping loop with no items");
            return false;
        };
        tracing::debug!(parent = %parent_step_id, items = state.total(), depth = self.frames.len() + 1, "push loop frame");
        self.frames.push(ScopeFrame {
            steps,
            cursor: 0,
            context: first,
            kind: FrameKind::Loop,
            parent_step_id: Some(parent_step_id),
            loop_state: Some(state),
        });
        true
    }

    /// Reconcile the stack after the step at `depth` ran.
    pub fn apply(&mut self, depth: usize, effect: StepEffect) -> Applied {
        let Some(frame) = self.frames.get_mut(depth) else {
            return Applied::FrameGone;
        };
        frame.cursor = (frame.cursor + 1).min(frame.steps.len());

        match effect {
            StepEffect::StayedOnFrame => Applied::Advanced,
            StepEffect::PushChild(child) => {
                if self.push_child(child) {
                    Applied::Pushed
                } else {
                    Applied::SkippedEmpty
                }
            }
        }
    }

    /// Retire the exhausted top frame.
    ///
    /// Loop frames with items left are rewound instead of popped. Returns
    /// `None` when the stack is empty or the top frame still has due steps.
    pub fn finish_top(&mut self) -> Option<PopOutcome> {
        let top = self.frames.last_mut()?;
        if !top.is_exhausted() {
            return None;
        }

        if let Some(state) = top.loop_state.as_mut() {
            let loop_step_id = top.parent_step_id.clone().unwrap_or_default();
            if let Some(context) = state.begin_next() {
                let index = state.current_index().unwrap_or_default();
                let total = state.total();
                top.cursor = 0;
                top.context = context;
                tracing::debug!(loop_step = %loop_step_id, index, total, "next loop iteration");
                return Some(PopOutcome::NextIteration {
                    loop_step_id,
                    index,
                    total,
                });
            }
            let iterations = state.total();
            self.frames.pop();
            tracing::debug!(loop_step = %loop_step_id, iterations, "loop finished");
            return Some(PopOutcome::LoopEnded {
                loop_step_id,
                iterations,
            });
        }

        let frame = self.frames.pop()?;
        tracing::debug!(kind = %frame.kind, depth = self.frames.len(), "pop frame");
        Some(PopOutcome::Popped(frame))
    }

    /// Whether the frame at `depth` still has a step to run.
    pub fn has_due_step_at(&self, depth: usize) -> bool {
        self.frames.get(depth).is_some_and(|f| !f.is_exhausted())
    }

    pub fn path(&self) -> ExecutionPath {
        ExecutionPath(self.frames.iter().map(ScopeFrame::segment).collect())
    }
}
