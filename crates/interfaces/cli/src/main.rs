use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vigil_audit::AuditLogger;
use vigil_config::{RoleDefinition, SinkConfig};
use vigil_llm::OpenAiProvider;
use vigil_memory::EpisodeStore;
use vigil_runtime::DaemonRunner;
use vigil_sinks::{ConsoleSink, FileSink, Sink, SinkDispatcher};

#[derive(Debug, Parser)]
#[command(name = "vigil", version, about = "Event-driven daemon for LLM agent roles")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a role in daemon mode until interrupted.
    Run {
        /// Path to the role definition YAML.
        role: PathBuf,
        /// Also append logs to this file.
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Parse and validate a role definition, then print its summary.
    Check {
        /// Path to the role definition YAML.
        role: PathBuf,
    },
}

fn init_tracing(log_file: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::from_default_env();
    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

fn build_sinks(role: &RoleDefinition) -> Option<SinkDispatcher> {
    if role.spec.sinks.is_empty() {
        return None;
    }
    let sinks: Vec<Box<dyn Sink>> = role
        .spec
        .sinks
        .iter()
        .map(|config| match config {
            SinkConfig::Console => Box::new(ConsoleSink) as Box<dyn Sink>,
            SinkConfig::File { path } => Box::new(FileSink::new(path)) as Box<dyn Sink>,
        })
        .collect();
    Some(SinkDispatcher::new(sinks))
}

async fn run_daemon(role_path: PathBuf, log_file: Option<PathBuf>) -> Result<()> {
    let _log_guard = init_tracing(log_file.as_ref());
    let role = RoleDefinition::load(&role_path)?;

    let model = &role.spec.model;
    let executor = Arc::new(OpenAiProvider::from_env(
        &model.base_url,
        &model.api_key_env,
        &model.name,
    ));

    let (audit, episodes) = match &role.spec.memory {
        Some(memory) if memory.enabled => {
            let data_dir = PathBuf::from(&memory.data_dir);
            (
                Some(AuditLogger::new(data_dir.join("audit"))),
                Some(EpisodeStore::new(data_dir.join("memory"))),
            )
        }
        _ => (None, None),
    };
    let sinks = build_sinks(&role);

    let runner = DaemonRunner::new(executor, role, audit, sinks, episodes);
    runner.run().await
}

fn check_role(role_path: PathBuf) -> Result<()> {
    let role = RoleDefinition::load(&role_path)
        .with_context(|| format!("invalid role definition {}", role_path.display()))?;
    println!("{} is valid", role_path.display());
    println!("  name: {}", role.metadata.name);
    println!("  model: {}/{}", role.spec.model.provider, role.spec.model.name);
    println!("  triggers:");
    for trigger in &role.spec.triggers {
        println!("    - {}", trigger.summary());
    }
    let guardrails = &role.spec.guardrails;
    println!("  max_iterations: {}", guardrails.max_iterations);
    if let Some(budget) = guardrails.daemon_token_budget {
        println!("  daemon_token_budget: {budget}");
    }
    if let Some(budget) = guardrails.daemon_daily_token_budget {
        println!("  daemon_daily_token_budget: {budget}");
    }
    println!(
        "  autonomy: {}",
        if role.spec.autonomy.is_some() { "enabled" } else { "disabled" }
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { role, log_file } => run_daemon(role, log_file).await,
        Commands::Check { role } => check_role(role),
    }
}
