//! Console output for daemon mode. Kept out of the logic path so tests can
//! exercise the runtime without capturing stdout.

use std::collections::HashSet;

use vigil_config::{Guardrails, RoleDefinition};
use vigil_llm::RunResult;

use crate::autonomous::AutonomousResult;

pub(crate) fn daemon_header(
    role: &RoleDefinition,
    guardrails: &Guardrails,
    autonomous_types: &HashSet<String>,
    trigger_count: usize,
) {
    println!("Daemon mode: {}", role.metadata.name);
    println!("  model: {}/{}", role.spec.model.provider, role.spec.model.name);
    println!("  triggers ({trigger_count}):");
    for trigger in &role.spec.triggers {
        println!("    - {}", trigger.summary());
    }
    if let Some(budget) = guardrails.daemon_token_budget {
        println!("  lifetime token budget: {budget}");
    }
    if let Some(budget) = guardrails.daemon_daily_token_budget {
        println!("  daily token budget: {budget}");
    }
    if autonomous_types.len() > 1 {
        let mut types: Vec<&str> = autonomous_types.iter().map(String::as_str).collect();
        types.sort_unstable();
        println!("  autonomous triggers: {}", types.join(", "));
    }
}

pub(crate) fn result_line(result: &RunResult) {
    if result.success {
        println!(
            "[{}] {} tokens, {} tool call(s)",
            result.run_id, result.total_tokens, result.tool_calls
        );
        if !result.output.is_empty() {
            println!("{}", result.output);
        }
    } else {
        println!(
            "[{}] failed: {}",
            result.run_id,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
}

pub(crate) fn autonomous_summary(result: &AutonomousResult) {
    println!(
        "Autonomous run {}: {} after {} iteration(s), {} tokens",
        result.run_id,
        result.final_status.as_str(),
        result.iteration_count,
        result.total_tokens
    );
    if let Some(summary) = &result.finish_summary {
        println!("  {summary}");
    }
}
