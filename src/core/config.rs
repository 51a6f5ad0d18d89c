use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the flow engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Pause between steps in `run`; `step` never waits.
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Hard cap on dispatched steps per execution.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

fn default_step_delay_ms() -> u64 {
    500
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_steps() -> usize {
    10_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            step_delay_ms: default_step_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_steps: default_max_steps(),
        }
    }
}

impl EngineConfig {
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn with_step_delay_ms(mut self, ms: u64) -> Self {
        self.step_delay_ms = ms;
        self
    }

    pub fn with_request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = ms;
        self
    }
}
