use thiserror::Error;

use super::TransportError;

/// Controller-level errors returned by [`FlowEngine`](crate::core::FlowEngine).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Engine is busy: a {active} is already in progress")]
    AlreadyActive { active: &'static str },
    #[error("Failed to build HTTP transport: {0}")]
    TransportSetup(#[from] TransportError),
}
