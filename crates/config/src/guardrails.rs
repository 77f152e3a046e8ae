use serde::{Deserialize, Serialize};

/// Hard limits applied to agent execution. The per-run limits bound one
/// autonomous loop; the daemon budgets bound the whole process lifetime and
/// the current UTC day.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Guardrails {
    pub max_iterations: u32,
    pub autonomous_token_budget: Option<u64>,
    pub autonomous_timeout_seconds: Option<u64>,
    pub daemon_token_budget: Option<u64>,
    pub daemon_daily_token_budget: Option<u64>,
}

impl Default for Guardrails {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            autonomous_token_budget: None,
            autonomous_timeout_seconds: None,
            daemon_token_budget: None,
            daemon_daily_token_budget: None,
        }
    }
}
