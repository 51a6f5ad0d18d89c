//! Run and step controllers.
//!
//! [`FlowEngine`] owns the engine state and drives the [`ExecutionStack`]
//! through a single [`StepDispatcher`]. `run` drains the stack with an
//! inter-step delay; `step` advances exactly one step per call. At most one of
//! them is active at a time and a second caller is turned away, not queued.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{Context, Flow, Marker, ResultLog, StepResult, StepStatus};
use crate::strategy::{ConditionEvaluator, PassthroughSubstitutor, PathEvaluator, Substitutor};
use crate::transport::{HttpPoolConfig, HttpTransport, ReqwestTransport};

use super::config::EngineConfig;
use super::dispatcher::StepDispatcher;
use super::event_bus::{ExecutionListener, NoopListener, Severity};
use super::request::RequestExecutor;
use super::stack::{Applied, ExecutionStack, FrameKind, PopOutcome};
use super::stop_signal::StopSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Activity {
    Idle = 0,
    Running = 1,
    Stepping = 2,
}

impl Activity {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Activity::Running,
            2 => Activity::Stepping,
            _ => Activity::Idle,
        }
    }

    fn noun(self) -> &'static str {
        match self {
            Activity::Idle => "nothing",
            Activity::Running => "run",
            Activity::Stepping => "step",
        }
    }
}

/// How a `run` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Stopped,
}

/// How a `step` call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Another run or step was active; nothing happened.
    Rejected,
    /// One step ran and more remain.
    Executed { step_id: String },
    /// The stack drained; "flow completed" was emitted.
    Completed { last_step_id: Option<String> },
    /// The flow halted or was stopped; "flow stopped" was emitted.
    Stopped { last_step_id: Option<String> },
}

/// Point-in-time copy of the engine state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub run_id: Uuid,
    pub is_running: bool,
    pub is_stepping: bool,
    pub stop_requested: bool,
    /// Context the next due step would see.
    pub context: Context,
    pub root_context: Context,
    pub results: ResultLog,
    pub stack_depth: usize,
    pub path: String,
    pub steps_dispatched: usize,
}

struct EngineState {
    stack: ExecutionStack,
    root_context: Context,
    results: ResultLog,
    stop: StopSignal,
    /// Stepping mode has a live stack to resume from.
    initialized: bool,
    steps_dispatched: usize,
    run_id: Uuid,
}

impl EngineState {
    fn new(root_context: Context, stop: StopSignal, run_id: Uuid) -> Self {
        Self {
            stack: ExecutionStack::new(),
            root_context,
            results: ResultLog::new(),
            stop,
            initialized: false,
            steps_dispatched: 0,
            run_id,
        }
    }

    fn current_context(&self) -> &Context {
        self.stack
            .top()
            .map(|frame| &frame.context)
            .unwrap_or(&self.root_context)
    }
}

/// Clears the activity flag however the controller exits.
struct ActivityGuard<'a> {
    activity: &'a AtomicU8,
    refresh: Option<&'a dyn ExecutionListener>,
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        self.activity.store(Activity::Idle as u8, Ordering::Release);
        if let Some(listener) = self.refresh {
            listener.on_refresh();
        }
    }
}

pub struct FlowEngine {
    config: EngineConfig,
    dispatcher: StepDispatcher,
    listener: Arc<dyn ExecutionListener>,
    activity: AtomicU8,
    /// Shared with the active execution so `stop` never waits on the state lock.
    stop_signal: parking_lot::Mutex<StopSignal>,
    /// Mirrors `EngineState::initialized` outside the state lock.
    session_open: AtomicBool,
    state: tokio::sync::Mutex<EngineState>,
}

impl FlowEngine {
    pub fn builder(
        conditions: Arc<dyn ConditionEvaluator>,
        paths: Arc<dyn PathEvaluator>,
    ) -> FlowEngineBuilder {
        FlowEngineBuilder {
            conditions,
            paths,
            substitutor: None,
            transport: None,
            listener: None,
            config: EngineConfig::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn activity(&self) -> Activity {
        Activity::from_u8(self.activity.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.activity() == Activity::Running
    }

    pub fn is_stepping(&self) -> bool {
        self.activity() == Activity::Stepping
    }

    /// Request a stop. An in-flight request is aborted immediately; the
    /// active controller notices at its next checkpoint.
    pub fn stop(&self) {
        let signal = self.stop_signal.lock().clone();
        tracing::info!(activity = ?self.activity(), "stop requested");
        signal.trigger();
    }

    /// Execute `flow` to completion from a fresh state.
    pub async fn run(&self, flow: &Flow) -> Result<RunOutcome, EngineError> {
        let activity = self.activate(Activity::Running, false).map_err(|e| {
            tracing::warn!(error = %e, "run rejected");
            e
        })?;
        // Installed before the state lock so a stop issued while waiting is kept.
        let stop = self.install_stop_signal();

        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("flow_run", %run_id, flow = %flow.id);
        async move {
            let mut state = self.state.lock().await;
            self.start(&mut state, flow, run_id, stop);
            tracing::info!(steps = flow.step_count(), "flow run started");

            let outcome = self.drain(&mut state).await;
            drop(activity);
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    /// Advance `flow` by one step, starting it on the first call.
    ///
    /// Never fails: a call made while another execution is active reports a
    /// warning and returns [`StepOutcome::Rejected`].
    pub async fn step(&self, flow: &Flow) -> StepOutcome {
        let activity = match self.activate(Activity::Stepping, true) {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(error = %e, "step rejected");
                self.listener.on_message(&e.to_string(), Severity::Warning);
                return StepOutcome::Rejected;
            }
        };

        let fresh = (!self.session_open.load(Ordering::Acquire)).then(|| self.install_stop_signal());
        let mut state = self.state.lock().await;
        if !state.initialized {
            let stop = fresh.unwrap_or_else(|| self.install_stop_signal());
            self.start(&mut state, flow, Uuid::new_v4(), stop);
            tracing::info!(run_id = %state.run_id, flow = %flow.id, "stepping started");
        }

        let span = tracing::info_span!("flow_step", run_id = %state.run_id);
        let outcome = self.step_once(&mut state).instrument(span).await;
        drop(activity);
        outcome
    }

    /// Stop whatever is active, then reinitialise with `variables` as the
    /// root context.
    pub async fn reset(&self, variables: Context) {
        if self.activity() != Activity::Idle {
            self.stop();
        }
        let mut state = self.state.lock().await;
        let stop = self.install_stop_signal();
        self.reinitialize(&mut state, variables, Uuid::new_v4(), stop);
        tracing::debug!("engine reset");
    }

    /// Copy of the current state. Waits for an active `run` to finish.
    pub async fn snapshot(&self) -> EngineSnapshot {
        let state = self.state.lock().await;
        EngineSnapshot {
            run_id: state.run_id,
            is_running: self.is_running(),
            is_stepping: self.is_stepping(),
            stop_requested: state.stop.is_triggered(),
            context: state.current_context().clone(),
            root_context: state.root_context.clone(),
            results: state.results.clone(),
            stack_depth: state.stack.len(),
            path: state.stack.path().to_string(),
            steps_dispatched: state.steps_dispatched,
        }
    }

    fn activate<'a>(
        &'a self,
        activity: Activity,
        refresh: bool,
    ) -> Result<ActivityGuard<'a>, EngineError> {
        self.activity
            .compare_exchange(
                Activity::Idle as u8,
                activity as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|current| EngineError::AlreadyActive {
                active: Activity::from_u8(current).noun(),
            })?;
        Ok(ActivityGuard {
            activity: &self.activity,
            refresh: refresh.then_some(self.listener.as_ref()),
        })
    }

    /// Replace the signal `stop` fires with a fresh one.
    fn install_stop_signal(&self) -> StopSignal {
        let stop = StopSignal::new();
        *self.stop_signal.lock() = stop.clone();
        stop
    }

    fn reinitialize(&self, state: &mut EngineState, variables: Context, run_id: Uuid, stop: StopSignal) {
        *state = EngineState::new(variables, stop, run_id);
        self.session_open.store(false, Ordering::Release);
    }

    fn start(&self, state: &mut EngineState, flow: &Flow, run_id: Uuid, stop: StopSignal) {
        self.reinitialize(state, flow.variables.clone(), run_id, stop);
        let root = state.root_context.clone();
        state
            .stack
            .push(flow.steps.clone(), root, FrameKind::Main, None);
        state.initialized = true;
        self.session_open.store(true, Ordering::Release);
    }

    async fn drain(&self, state: &mut EngineState) -> RunOutcome {
        let delay = self.config.step_delay();

        loop {
            if state.stop.is_triggered() || state.stack.is_empty() {
                break;
            }
            if self.retire_exhausted(state) {
                continue;
            }
            if state.stop.is_triggered() || self.step_limit_reached(state) {
                break;
            }

            let Some((_, depth, applied)) = self.execute_due(state).await else {
                continue;
            };

            let more = applied == Applied::Pushed || state.stack.has_due_step_at(depth);
            if state.stop.is_triggered() || !more || delay.is_zero() {
                continue;
            }
            let stop = state.stop.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.cancelled() => {}
            }
        }

        self.finish(state)
    }

    async fn step_once(&self, state: &mut EngineState) -> StepOutcome {
        if !state.stop.is_triggered() {
            while self.retire_exhausted(state) {}
        }
        if state.stop.is_triggered() || state.stack.is_empty() {
            return self.finish_step(state, None);
        }
        if self.step_limit_reached(state) {
            return self.finish_step(state, None);
        }

        let Some((step_id, _, _)) = self.execute_due(state).await else {
            return self.finish_step(state, None);
        };

        if !state.stop.is_triggered() {
            while self.retire_exhausted(state) {}
        }
        if state.stop.is_triggered() || state.stack.is_empty() {
            return self.finish_step(state, Some(step_id));
        }
        StepOutcome::Executed { step_id }
    }

    fn finish_step(&self, state: &mut EngineState, last_step_id: Option<String>) -> StepOutcome {
        match self.finish(state) {
            RunOutcome::Completed => StepOutcome::Completed { last_step_id },
            RunOutcome::Stopped => StepOutcome::Stopped { last_step_id },
        }
    }

    /// Dispatch the top frame's due step and reconcile the stack.
    async fn execute_due(&self, state: &mut EngineState) -> Option<(String, usize, Applied)> {
        let depth = state.stack.len().checked_sub(1)?;
        let path = state.stack.path();
        let stop = state.stop.clone();

        let EngineState {
            stack,
            results,
            steps_dispatched,
            ..
        } = state;
        let frame = stack.top_mut()?;
        let step = frame.steps.get(frame.cursor)?;
        let step_id = step.id.clone();

        let effect = self
            .dispatcher
            .dispatch(step, &mut frame.context, &path, results, &stop)
            .await;
        *steps_dispatched += 1;

        let applied = stack.apply(depth, effect);
        tracing::debug!(step = %step_id, depth, ?applied, "stack reconciled");
        Some((step_id, depth, applied))
    }

    /// Finish the top frame if it has run out of steps. Returns whether the
    /// stack changed.
    fn retire_exhausted(&self, state: &mut EngineState) -> bool {
        let Some(outcome) = state.stack.finish_top() else {
            return false;
        };

        let marker = match outcome {
            PopOutcome::NextIteration {
                loop_step_id,
                index,
                total,
            } => Some((loop_step_id, Marker::Iteration { index, total })),
            PopOutcome::LoopEnded {
                loop_step_id,
                iterations,
            } => Some((loop_step_id, Marker::LoopEnd { iterations })),
            PopOutcome::Popped(frame) => {
                if frame.kind == FrameKind::Main {
                    state.root_context = frame.context;
                }
                None
            }
        };

        if let Some((loop_step_id, marker)) = marker {
            let entry = StepResult::marker(loop_step_id, StepStatus::Success, marker);
            self.listener.on_marker(&entry, &state.stack.path());
            state.results.push(entry);
        }
        true
    }

    fn step_limit_reached(&self, state: &mut EngineState) -> bool {
        if state.steps_dispatched < self.config.max_steps {
            return false;
        }
        let message = format!(
            "Flow halted: step limit of {} reached",
            self.config.max_steps
        );
        tracing::error!(max_steps = self.config.max_steps, "step limit reached");
        state.stop.halt();
        self.listener.on_message(&message, Severity::Error);
        true
    }

    /// Emit the terminal notification and leave the state ready for a fresh start.
    fn finish(&self, state: &mut EngineState) -> RunOutcome {
        let stopped = state.stop.is_triggered();
        let context = state.current_context().clone();
        if let Some(main) = state.stack.frame(0) {
            state.root_context = main.context.clone();
        }
        state.stack.clear();
        state.initialized = false;
        self.session_open.store(false, Ordering::Release);

        if stopped {
            tracing::info!(results = state.results.len(), user = state.stop.is_user_stop(), "flow stopped");
            self.listener.on_flow_stopped(&context, &state.results);
            RunOutcome::Stopped
        } else {
            tracing::info!(results = state.results.len(), "flow completed");
            self.listener.on_flow_complete(&context, &state.results);
            RunOutcome::Completed
        }
    }
}

pub struct FlowEngineBuilder {
    conditions: Arc<dyn ConditionEvaluator>,
    paths: Arc<dyn PathEvaluator>,
    substitutor: Option<Arc<dyn Substitutor>>,
    transport: Option<Arc<dyn HttpTransport>>,
    listener: Option<Arc<dyn ExecutionListener>>,
    config: EngineConfig,
}

impl FlowEngineBuilder {
    pub fn substitutor(mut self, substitutor: Arc<dyn Substitutor>) -> Self {
        self.substitutor = Some(substitutor);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ExecutionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine. Without an explicit transport a pooled
    /// [`ReqwestTransport`] is created.
    pub fn build(self) -> Result<FlowEngine, EngineError> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(HttpPoolConfig::default())?),
        };
        let listener = self.listener.unwrap_or_else(|| Arc::new(NoopListener));
        let substitutor = self
            .substitutor
            .unwrap_or_else(|| Arc::new(PassthroughSubstitutor));

        let dispatcher = StepDispatcher::new(
            substitutor,
            self.conditions,
            self.paths,
            RequestExecutor::new(transport, self.config.request_timeout()),
            listener.clone(),
        );

        let stop = StopSignal::new();
        Ok(FlowEngine {
            config: self.config,
            dispatcher,
            listener,
            activity: AtomicU8::new(Activity::Idle as u8),
            stop_signal: parking_lot::Mutex::new(stop.clone()),
            session_open: AtomicBool::new(false),
            state: tokio::sync::Mutex::new(EngineState::new(Context::new(), stop, Uuid::nil())),
        })
    }
}
