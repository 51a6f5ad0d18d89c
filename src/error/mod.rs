//! Error types for the flow engine.
//!
//! - [`StepError`]: Failures recorded on a single step result.
//! - [`EvalError`]: Raised by substitution, condition and path strategies.
//! - [`TransportError`]: Raised by HTTP transports.
//! - [`EngineError`]: Rejections from the run/step controllers.

pub mod engine_error;
pub mod step_error;

pub use engine_error::EngineError;
pub use step_error::{EvalError, StepError, TransportError};
