use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jeeves::config::{Config, ConfigOverrides};
use jeeves::orchestrator::{RunParams, Supervisor};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "jeeves")]
#[command(version, about = "Workflow-driven iteration orchestrator for autonomous coding agents")]
pub struct Cli {
    /// Override the data directory (default: platform data dir / jeeves).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Override the agent runner command.
    #[arg(long, global = true)]
    pub agent_cmd: Option<String>,

    /// Allow run-control and state-mutating HTTP requests from non-loopback clients.
    #[arg(long, global = true)]
    pub allow_remote_run: bool,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Provision a local worktree/issue-state skeleton for an issue.
    Provision {
        owner: String,
        repo: String,
        number: u64,
        #[arg(long, default_value = "default")]
        workflow: String,
    },
    /// Drive an already-provisioned issue through the supervised iteration loop.
    Run {
        owner: String,
        repo: String,
        number: u64,
        #[arg(long, default_value = "50")]
        max_iterations: u32,
        #[arg(long, default_value = "600")]
        inactivity_timeout_sec: u64,
        #[arg(long, default_value = "3600")]
        iteration_timeout_sec: u64,
    },
    /// Show the current run record for the last/active issue.
    Status,
    /// List provisioned issues, optionally filtered by owner and/or repo.
    Issues {
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        repo: Option<String>,
    },
    /// Start the HTTP observation server and block.
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
    /// Inspect workflow documents.
    #[command(subcommand)]
    Workflow(WorkflowCommands),
}

#[derive(Subcommand)]
pub enum WorkflowCommands {
    /// Load a workflow document and report any validation errors.
    Validate {
        /// Path to the workflow YAML file to validate.
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::resolve(ConfigOverrides {
        data_dir: cli.data_dir.clone(),
        agent_cmd: cli.agent_cmd.clone(),
        bind_addr: None,
        verbose: Some(cli.verbose),
        allow_remote_run: if cli.allow_remote_run { Some(true) } else { None },
    })
    .context("failed to resolve configuration")?;
    config.ensure_directories()?;

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let file_appender = tracing_appender::rolling::daily(&config.data_dir, "jeeves.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(filter)
        .init();

    match &cli.command {
        Commands::Provision { owner, repo, number, workflow } => {
            cmd_provision(&config, owner, repo, *number, workflow)?;
        }
        Commands::Run {
            owner,
            repo,
            number,
            max_iterations,
            inactivity_timeout_sec,
            iteration_timeout_sec,
        } => {
            cmd_run(
                &config,
                owner,
                repo,
                *number,
                *max_iterations,
                *inactivity_timeout_sec,
                *iteration_timeout_sec,
            )
            .await?;
        }
        Commands::Status => cmd_status(&config).await,
        Commands::Issues { owner, repo } => cmd_issues(&config, owner.as_deref(), repo.as_deref())?,
        Commands::Serve { bind } => cmd_serve(config, bind.clone()).await?,
        Commands::Workflow(WorkflowCommands::Validate { path }) => cmd_workflow_validate(path),
    }

    Ok(())
}

fn cmd_workflow_validate(path: &std::path::Path) {
    match jeeves::workflow_loader::load_workflow(path) {
        Ok(wf) => println!("OK: workflow '{}' is valid ({} phases)", wf.name, wf.phases.len()),
        Err(err) => {
            eprintln!("Invalid workflow at {}:", path.display());
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}

fn cmd_provision(config: &Config, owner: &str, repo: &str, number: u64, workflow: &str) -> Result<()> {
    let provisioned = jeeves::provisioning::provision(config, owner, repo, number, workflow)?;
    println!("Provisioned {owner}/{repo}#{number}");
    println!("  worktree:  {}", provisioned.worktree.display());
    println!("  state dir: {}", provisioned.state_dir.display());
    println!("  branch:    {}", provisioned.branch);
    Ok(())
}

async fn cmd_run(
    config: &Config,
    owner: &str,
    repo: &str,
    number: u64,
    max_iterations: u32,
    inactivity_timeout_sec: u64,
    iteration_timeout_sec: u64,
) -> Result<()> {
    info!(owner, repo, number, "starting supervised iteration loop");
    let supervisor = Supervisor::new(config.clone());
    supervisor.set_issue(owner, repo, number).await?;
    supervisor
        .start(RunParams {
            max_iterations,
            inactivity_timeout: Duration::from_secs(inactivity_timeout_sec),
            iteration_timeout: Duration::from_secs(iteration_timeout_sec),
            max_buffer_size: None,
        })
        .await?;

    loop {
        let record = supervisor.status().await;
        if !record.running {
            println!(
                "Run ended: {}",
                record.completion_reason.as_deref().unwrap_or("unknown")
            );
            if let Some(err) = &record.last_error {
                println!("Last error: {err}");
            }
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    Ok(())
}

async fn cmd_status(config: &Config) {
    let supervisor = Supervisor::new(config.clone());
    let record = supervisor.status().await;
    println!("running:            {}", record.running);
    println!("current_iteration:  {}", record.current_iteration);
    println!("max_iterations:     {}", record.max_iterations);
    println!("completion_reason:  {}", record.completion_reason.as_deref().unwrap_or("-"));
}

fn cmd_issues(config: &Config, owner: Option<&str>, repo: Option<&str>) -> Result<()> {
    let descriptors = jeeves::issue_state::list(&config.issues_dir(), owner, repo)?;
    if descriptors.is_empty() {
        println!("No provisioned issues found.");
        return Ok(());
    }
    println!("{:<12} {:<16} {:<8} {:<16} {}", "OWNER", "REPO", "NUMBER", "WORKFLOW", "PHASE");
    for d in descriptors {
        println!(
            "{:<12} {:<16} {:<8} {:<16} {}",
            d.owner, d.repo, d.number, d.workflow, d.phase
        );
    }
    Ok(())
}

async fn cmd_serve(config: Config, bind_override: Option<String>) -> Result<()> {
    let bind_addr = bind_override.unwrap_or_else(|| config.bind_addr.clone());
    let allow_remote_run = config.allow_remote_run;
    let supervisor = Supervisor::new(config.clone());
    let state = std::sync::Arc::new(jeeves::server::AppState { config, supervisor });
    let router = jeeves::server::build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(%bind_addr, allow_remote_run, "observation server listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .context("observation server exited")?;
    Ok(())
}
