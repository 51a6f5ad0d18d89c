//! Flow data model: steps, contexts and results.

pub mod context;
pub mod flow;
pub mod result;
pub mod step;

pub use context::Context;
pub use flow::Flow;
pub use result::{ExtractionFailure, Marker, ResultLog, StepResult, StepStatus};
pub use step::{
    ConditionStep, FailurePolicy, HttpMethod, LoopStep, Predicate, RequestStep, Step, StepKind,
};
