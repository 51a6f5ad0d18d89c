use serde::{Deserialize, Serialize};

use super::context::Context;
use super::step::Step;

/// A loaded flow: static variables plus the top-level step sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Initial context for every execution of this flow.
    #[serde(default)]
    pub variables: Context,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Flow {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }

    pub fn with_variables(mut self, variables: Context) -> Self {
        self.variables = variables;
        self
    }

    /// Total number of steps in the tree, nested ones included.
    pub fn step_count(&self) -> usize {
        fn count<'a>(steps: impl IntoIterator<Item = &'a Step>) -> usize {
            steps.into_iter().map(|s| 1 + count(s.children())).sum()
        }
        count(&self.steps)
    }
}
