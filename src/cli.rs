//! Command-line interface for aide.
//!
//! Provides commands for running a demo turn against the scripted
//! provider, inspecting the audit trail, and printing the resolved
//! configuration.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use clap::{Parser, Subcommand};

use crate::config::{self, RuntimeConfig};
use crate::core::{ConsentLedger, JsonlAuditLog, Orchestrator, QueueControlSink, TurnOptions};
use crate::core::cancel::CancelToken;
use crate::domain::{Intent, PrivilegeTier};
use crate::gateway::{ModelGateway, ModelSpec, RouteHints, ScriptedProvider, default_catalog};
use crate::limits::SlidingWindowLimiter;
use crate::memory::ConversationMemory;
use crate::retrieval::{HashEmbedder, Retriever};
use crate::tools::{builtin_registry, Sanitizer, ToolExecutor};

/// aide - Safety-checked assistant turn orchestration core
#[derive(Parser, Debug)]
#[command(name = "aide")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process one turn against the scripted provider
    Turn {
        /// Intent text
        text: String,

        /// Session identifier
        #[arg(short, long, default_value = "default")]
        session: String,

        /// Declare command-tier privilege for this intent
        #[arg(long)]
        command: bool,

        /// Session privilege tier (informational or command)
        #[arg(long)]
        privilege: Option<PrivilegeTier>,

        /// Pre-grant consent for a tool (repeatable)
        #[arg(long)]
        grant: Vec<String>,

        /// Prefer the fast model
        #[arg(long)]
        fast: bool,

        /// Use the offline model only
        #[arg(long)]
        offline: bool,

        /// Explicit model override
        #[arg(short, long)]
        model: Option<String>,

        /// Config file path (defaults to $AIDE_HOME/config.yaml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show recent audit entries
    Audit {
        /// Filter to one session
        #[arg(short, long)]
        session: Option<String>,

        /// Maximum number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show resolved configuration
    Config {
        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Turn {
                text,
                session,
                command,
                privilege,
                grant,
                fast,
                offline,
                model,
                config,
            } => {
                run_turn(TurnArgs {
                    text,
                    session,
                    command,
                    privilege,
                    grant,
                    fast,
                    offline,
                    model,
                    config,
                })
                .await
            }
            Commands::Audit { session, limit } => show_audit(session, limit).await,
            Commands::Config { config } => show_config(config),
        }
    }
}

struct TurnArgs {
    text: String,
    session: String,
    command: bool,
    privilege: Option<PrivilegeTier>,
    grant: Vec<String>,
    fast: bool,
    offline: bool,
    model: Option<String>,
    config: Option<PathBuf>,
}

fn load_config(path: Option<PathBuf>) -> Result<RuntimeConfig> {
    if let Some(path) = path {
        return RuntimeConfig::from_file(&path);
    }
    let default_path = config::default_home().join("config.yaml");
    if default_path.exists() {
        return RuntimeConfig::from_file(&default_path);
    }
    Ok(RuntimeConfig::default())
}

fn resolve_under_home(path: &str) -> PathBuf {
    let candidate = PathBuf::from(path);
    if candidate.is_absolute() {
        candidate
    } else {
        config::default_home().join(candidate)
    }
}

async fn run_turn(args: TurnArgs) -> Result<()> {
    let config = load_config(args.config)?;

    let audit = Arc::new(
        JsonlAuditLog::open(resolve_under_home(&config.safety.audit_log_path))
            .await
            .context("Failed to open audit log")?,
    );

    let ledger = Arc::new(
        ConsentLedger::new(audit.clone(), config.safety.default_privilege)
            .with_pause_on_start(config.safety.pause_on_start),
    );

    let retriever = Arc::new(Retriever::new(
        Arc::new(HashEmbedder::default()),
        config.retrieval.clone(),
    ));

    let registry = builtin_registry(&config.tooling, retriever.clone())
        .context("Failed to build tool registry")?;
    let executor = Arc::new(ToolExecutor::new(
        Arc::new(registry),
        Arc::new(SlidingWindowLimiter::new()),
        Sanitizer::new(&config.tooling)?,
        audit.clone(),
    ));

    // The demo turn runs fully offline: every catalog entry is served by
    // the scripted provider.
    let mut gateway = ModelGateway::new(config.models.clone(), &config.limits)
        .with_provider(Arc::new(ScriptedProvider::default()));
    for spec in default_catalog(&config.models) {
        gateway.register_model(ModelSpec {
            provider: "scripted".to_string(),
            ..spec
        });
    }

    let memory = Arc::new(
        ConversationMemory::open(&resolve_under_home(&config.memory.db_path))
            .context("Failed to open conversation memory")?,
    );

    let (control, mut control_rx) = QueueControlSink::new();
    let orchestrator = Orchestrator::new(
        config,
        Arc::new(gateway),
        retriever,
        executor,
        ledger.clone(),
        audit,
    )
    .with_memory(memory)
    .with_control(Arc::new(control));

    if let Some(tier) = args.privilege {
        ledger.set_privilege(&args.session, tier).await?;
    }
    for tool in &args.grant {
        ledger
            .grant(&args.session, tool, "cli", Some(Duration::minutes(5)))
            .await?;
    }

    let mut intent = Intent::new(args.session.clone(), args.text);
    if args.command {
        intent = intent.with_privilege(PrivilegeTier::Command);
    }

    let options = TurnOptions {
        route: RouteHints {
            model: args.model,
            fast_path: args.fast,
            offline_only: args.offline,
        },
        ..Default::default()
    };

    match orchestrator
        .process_turn(intent, options, CancelToken::new())
        .await
    {
        Ok(result) => {
            println!("{}", result.text);
            println!();
            println!("metadata: {}", serde_json::to_string_pretty(&result.metadata)?);
            while let Ok(action) = control_rx.try_recv() {
                println!("forwarded action: {}", serde_json::to_string(&action)?);
            }
        }
        Err(err) => {
            println!("{}", err.user_message());
            eprintln!("error: {}", err);
        }
    }

    Ok(())
}

async fn show_audit(session: Option<String>, limit: usize) -> Result<()> {
    let config = load_config(None)?;
    let log = JsonlAuditLog::open(resolve_under_home(&config.safety.audit_log_path))
        .await
        .context("Failed to open audit log")?;

    let entries = log.replay().await.context("Failed to read audit log")?;
    let filtered: Vec<_> = entries
        .iter()
        .filter(|e| session.as_deref().map(|s| e.session_id == s).unwrap_or(true))
        .collect();

    for entry in filtered.iter().rev().take(limit).rev() {
        println!("{}", serde_json::to_string(entry)?);
    }
    Ok(())
}

fn show_config(path: Option<PathBuf>) -> Result<()> {
    let config = load_config(path)?;
    println!("home: {}", config::default_home().display());
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}
