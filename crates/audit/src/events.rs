use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub kind: String,
    pub run_id: String,
    pub trigger_type: String,
    pub total_tokens: u64,
    pub success: bool,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}
