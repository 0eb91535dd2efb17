// Conditional Gate
// Environment-driven switch for optional, expensive step sets

use crate::execution::context::EnvironmentSnapshot;

use tracing::info;

const TRUTHY: [&str; 5] = ["1", "true", "yes", "on", "y"];

/// Outcome of checking a gate flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Open,
    /// Closed, with the notice shown to the user
    Closed(String),
}

impl GateDecision {
    pub fn is_open(&self) -> bool {
        matches!(self, GateDecision::Open)
    }
}

/// Gate backed by the run's environment snapshot
#[derive(Debug, Clone, Copy)]
pub struct ConditionalGate<'a> {
    env: &'a EnvironmentSnapshot,
}

impl<'a> ConditionalGate<'a> {
    pub fn new(env: &'a EnvironmentSnapshot) -> Self {
        Self { env }
    }

    pub fn should_run(&self, flag: &str) -> bool {
        self.env.get(flag).map(is_truthy).unwrap_or(false)
    }

    /// Check the flag and describe a closed gate. Never an error.
    pub fn evaluate(&self, flag: &str) -> GateDecision {
        if self.should_run(flag) {
            return GateDecision::Open;
        }

        let notice = match self.env.get(flag) {
            None => format!("{} is not set; skipping. Set {}=true to run this step.", flag, flag),
            Some(value) => format!(
                "{}={:?} is not enabled; skipping. Set {}=true to run this step.",
                flag, value, flag
            ),
        };
        info!(flag, "gate closed");
        GateDecision::Closed(notice)
    }
}

pub fn is_truthy(value: &str) -> bool {
    let value = value.trim().to_ascii_lowercase();
    TRUTHY.contains(&value.as_str())
}
