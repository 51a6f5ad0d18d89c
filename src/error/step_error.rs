use thiserror::Error;

/// Step-level failures. The `Display` text is what ends up in `StepResult.error`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    #[error("Body preparation error: {0}")]
    BodyPreparation(String),
    #[error("Request failed: {0}")]
    Transport(String),
    #[error("Request timed out after {0} ms")]
    Timeout(u64),
    #[error("Request aborted by user")]
    Aborted,
    #[error("HTTP {status}")]
    HttpStatus { status: u16 },
    #[error("Variable substitution failed: {0}")]
    Substitution(String),
    #[error("Condition evaluation failed: {0}")]
    ConditionEvaluation(String),
    #[error("Loop source error: {0}")]
    LoopSource(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StepError {
    /// Errors that the request failure policy may downgrade.
    pub fn is_request_failure(&self) -> bool {
        matches!(
            self,
            StepError::BodyPreparation(_)
                | StepError::Transport(_)
                | StepError::Timeout(_)
                | StepError::Aborted
                | StepError::HttpStatus { .. }
                | StepError::Substitution(_)
        )
    }
}

/// Error raised by a substitution, condition or path strategy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct EvalError(pub String);

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Error raised by an [`HttpTransport`](crate::transport::HttpTransport).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("{0}")]
    Request(String),
    #[error("failed to read response body: {0}")]
    Body(String),
}
