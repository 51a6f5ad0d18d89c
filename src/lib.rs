//! # apiflow - Execution engine for declarative API test flows
//!
//! A flow is an ordered tree of steps that issue HTTP requests, branch on
//! conditions, or iterate over collections, all reading and writing a shared
//! variable context. `apiflow` walks that tree with an explicit execution
//! stack, so the same machinery supports:
//!
//! - **Run mode**: drain the whole flow with a configurable delay between steps.
//! - **Step mode**: advance exactly one step per call and inspect state in between.
//! - **Cancellation**: `stop()` aborts an in-flight request and halts at the
//!   next checkpoint.
//! - **Failure policies**: request steps either halt the flow or record the
//!   error and continue.
//!
//! Template expansion, condition operators and path expressions are not part
//! of the engine; hosts plug them in through the traits in [`strategy`].
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use apiflow::{ChannelListener, Flow, FlowEngine};
//! # use apiflow::{Context, EvalError, Predicate};
//! # use serde_json::Value;
//! # struct MyConditions;
//! # impl apiflow::ConditionEvaluator for MyConditions {
//! #     fn evaluate(&self, _: &Predicate, _: &Context) -> Result<bool, EvalError> { Ok(true) }
//! # }
//! # struct MyPaths;
//! # impl apiflow::PathEvaluator for MyPaths {
//! #     fn evaluate(&self, _: &Value, _: &str) -> Result<Option<Value>, EvalError> { Ok(None) }
//! # }
//!
//! #[tokio::main]
//! async fn main() {
//!     let json = std::fs::read_to_string("flow.json").unwrap();
//!     let flow: Flow = serde_json::from_str(&json).unwrap();
//!     let (listener, mut events) = ChannelListener::channel();
//!
//!     let engine = FlowEngine::builder(Arc::new(MyConditions), Arc::new(MyPaths))
//!         .listener(Arc::new(listener))
//!         .build()
//!         .unwrap();
//!     let outcome = engine.run(&flow).await.unwrap();
//!     println!("{:?}", outcome);
//!     while let Ok(event) = events.try_recv() {
//!         println!("{:?}", event);
//!     }
//! }
//! ```

pub mod core;
pub mod error;
pub mod model;
pub mod strategy;
pub mod transport;

pub use crate::core::{
    ChannelListener, EngineConfig, EngineEvent, EngineSnapshot, ExecutionListener, ExecutionPath,
    FlowEngine, FlowEngineBuilder, NoopListener, ResultSlot, RunOutcome, Severity, StepOutcome,
    StopSignal,
};
pub use crate::error::{EngineError, EvalError, StepError, TransportError};
pub use crate::model::{
    Context, ExtractionFailure, FailurePolicy, Flow, HttpMethod, Marker, Predicate, ResultLog,
    Step, StepKind, StepResult, StepStatus,
};
pub use crate::strategy::{
    ConditionEvaluator, PassthroughSubstitutor, PathEvaluator, Substitution, Substitutor,
};
pub use crate::transport::{HttpPoolConfig, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
