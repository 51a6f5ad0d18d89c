//! Pluggable collaborators the engine delegates to.
//!
//! The engine never interprets template syntax, comparison operators or path
//! expressions itself. Hosts supply implementations of these traits:
//!
//! - [`Substitutor`]: expands variable placeholders inside a step.
//! - [`ConditionEvaluator`]: decides a condition step's predicate.
//! - [`PathEvaluator`]: resolves a path expression against JSON data.
//!
//! All three must be pure: they receive shared references and may not keep
//! state between calls that changes their answers.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::EvalError;
use crate::model::{Context, Predicate, Step};

/// Output of [`Substitutor::substitute`].
#[derive(Debug, Clone, PartialEq)]
pub struct Substitution {
    pub step: Step,
    /// Placeholder token -> raw JSON text that must replace the quoted
    /// placeholder when a request body is serialized.
    pub unquoted: HashMap<String, String>,
}

impl Substitution {
    /// Substitution that leaves the step as-is.
    pub fn unchanged(step: &Step) -> Self {
        Self {
            step: step.clone(),
            unquoted: HashMap::new(),
        }
    }
}

pub trait Substitutor: Send + Sync {
    /// Expand placeholders in `step` using `context`.
    ///
    /// May return a partially substituted step. An `Err` fails the step.
    fn substitute(&self, step: &Step, context: &Context) -> Result<Substitution, EvalError>;
}

pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, predicate: &Predicate, context: &Context) -> Result<bool, EvalError>;
}

pub trait PathEvaluator: Send + Sync {
    /// `Ok(None)` means "not found"; `Err` means the expression itself is bad.
    fn evaluate(&self, data: &Value, path: &str) -> Result<Option<Value>, EvalError>;
}

/// Substitutor for flows that carry no placeholders.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughSubstitutor;

impl Substitutor for PassthroughSubstitutor {
    fn substitute(&self, step: &Step, _context: &Context) -> Result<Substitution, EvalError> {
        Ok(Substitution::unchanged(step))
    }
}
