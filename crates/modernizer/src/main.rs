//! CLI entry point.
//!
//! `modernizer run` starts one migration and streams its events to
//! stdout until the terminal event arrives. `modernizer resume` picks up
//! every persisted non-terminal workflow. `modernizer status` prints
//! committed snapshots.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modernizer::{Collaborators, LocalGatewayFactory, MigrationService, StartRequest};
use modernizer_core::{
    Config, DockerCli, EventStream, HttpReasoner, OfflineReasoner, ProjectType, Reasoner,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "modernizer", about = "Automated dependency upgrades: plan, validate in a sandbox, open a PR")]
struct Cli {
    /// Optional TOML config file; environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start one migration and stream its events until it terminates.
    Run {
        /// Local project tree to upgrade.
        #[arg(long, conflicts_with = "git_url")]
        path: Option<PathBuf>,

        /// Git repository to clone and upgrade.
        #[arg(long)]
        git_url: Option<String>,

        #[arg(long, default_value = "main")]
        git_branch: String,

        /// Project flavor: node or python.
        #[arg(long, value_enum)]
        project_type: CliProjectType,

        /// Retry budget for the analyze/revalidate loop (0..=10).
        #[arg(long)]
        max_retries: Option<u32>,

        /// Keep the validation container around for debugging.
        #[arg(long)]
        keep_container: bool,
    },

    /// Resume every persisted workflow that has not terminated.
    Resume,

    /// Print committed migration snapshots, newest first.
    Status {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliProjectType {
    Node,
    Python,
}

impl From<CliProjectType> for ProjectType {
    fn from(value: CliProjectType) -> Self {
        match value {
            CliProjectType::Node => ProjectType::Node,
            CliProjectType::Python => ProjectType::Python,
        }
    }
}

fn build_reasoner(config: &Config) -> Arc<dyn Reasoner> {
    // Without an endpoint the workers run on their deterministic
    // fallbacks; degraded quality, full capability.
    if std::env::var("REASONER_URL").is_ok() {
        Arc::new(HttpReasoner::new(config.reasoner()))
    } else {
        Arc::new(OfflineReasoner)
    }
}

async fn drain(mut stream: EventStream) {
    while let Some(event) = stream.next().await {
        let payload = if event.payload.is_null() {
            String::new()
        } else {
            format!(" {}", event.payload)
        };
        println!(
            "[{}] #{:<3} {}{}",
            event.migration_id, event.seq, event.kind, payload
        );
    }
    if stream.dropped() > 0 {
        println!("({} events dropped by slow terminal)", stream.dropped());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "modernizer=info,modernizer_core=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Run {
            path,
            git_url,
            git_branch,
            project_type,
            max_retries,
            keep_container,
        } => {
            if keep_container {
                config.container_cleanup = false;
            }
            let service = MigrationService::new(
                config.clone(),
                Collaborators {
                    reasoner: build_reasoner(&config),
                    runtime: Arc::new(DockerCli::new()),
                    gateways: Arc::new(LocalGatewayFactory),
                },
            )?;

            let id = service
                .start(StartRequest {
                    project_path: path,
                    git_repo_url: git_url,
                    git_branch: Some(git_branch),
                    git_token: std::env::var("GIT_TOKEN").ok(),
                    project_type: Some(project_type.into()),
                    max_retries,
                })
                .await?;
            info!(migration_id = %id, "migration started");

            let stream = service.subscribe(&id)?;
            drain(stream).await;

            let state = service.get(&id)?;
            println!(
                "{id}: {} (retries {}/{}, {} errors)",
                state.phase,
                state.retries_used,
                state.retries_max,
                state.errors.len()
            );
        }

        Command::Resume => {
            let service = MigrationService::new(
                config.clone(),
                Collaborators {
                    reasoner: build_reasoner(&config),
                    runtime: Arc::new(DockerCli::new()),
                    gateways: Arc::new(LocalGatewayFactory),
                },
            )?;
            let ids = service.resume_all()?;
            if ids.is_empty() {
                println!("nothing to resume");
                return Ok(());
            }
            println!("resuming {} workflow(s)", ids.len());
            let mut tasks = Vec::new();
            for id in ids {
                let stream = service.subscribe(&id)?;
                tasks.push(tokio::spawn(drain(stream)));
            }
            for task in tasks {
                let _ = task.await;
            }
        }

        Command::Status { limit } => {
            let service = MigrationService::new(
                config.clone(),
                Collaborators {
                    reasoner: Arc::new(OfflineReasoner),
                    runtime: Arc::new(DockerCli::new()),
                    gateways: Arc::new(LocalGatewayFactory),
                },
            )?;
            for state in service.list(limit, 0)? {
                println!(
                    "{}  {:<10} {}  retries {}/{}  started {}",
                    state.id,
                    state.phase.to_string(),
                    state.project_type,
                    state.retries_used,
                    state.retries_max,
                    state.started_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
    }

    Ok(())
}
