use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use rap_runner::agent::{AgentLoop, HttpControllerClient};
use rap_runner::builder::GitProjectSource;
use rap_runner::config::{AgentConfig, ControllerConfig};
use rap_runner::controller::scheduler::Scheduler;
use rap_runner::controller::sync::SyncLoop;
use rap_runner::controller::{admin, api, shared};
use rap_runner::db::Database;
use rap_runner::executor::LocalDockerExecutor;
use rap_runner::models::JobRequest;

#[derive(Parser, Debug)]
#[command(name = "rap-runner")]
#[command(about = "Job orchestrator for OpenSAFELY research pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the controller: scheduler, sync loop and task API in one process
    Controller,
    /// Run the agent for one backend
    Agent,
    /// Inject a job request directly into the store, bypassing the
    /// job-server. Useful for local testing and manual runs.
    AddJob {
        #[arg(long)]
        backend: String,
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        repo_url: String,
        #[arg(long, default_value = "main")]
        branch: String,
        /// Full commit sha; resolved from the branch when omitted
        #[arg(long, default_value = "")]
        commit: String,
        #[arg(long, default_value = "default")]
        database_name: String,
        #[arg(long)]
        force_run_dependencies: bool,
        /// Actions to run, or `run_all`
        actions: Vec<String>,
    },
    /// Show current flags for a backend, or set `name=value` pairs
    /// (a bare `name=` clears the flag)
    Flags {
        #[arg(long)]
        backend: String,
        set: Vec<String>,
    },
    /// Pause a backend and wind down its running jobs ahead of a host reboot
    PrepareReboot {
        #[arg(long)]
        backend: String,
    },
    /// Kill a job outright; it will not be retried
    KillJob { job_id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Controller => run_controller().await?,
        Command::Agent => run_agent().await?,
        Command::AddJob {
            backend,
            workspace,
            repo_url,
            branch,
            commit,
            database_name,
            force_run_dependencies,
            actions,
        } => run_add_job(AddJobArgs {
            backend,
            workspace,
            repo_url,
            branch,
            commit,
            database_name,
            force_run_dependencies,
            actions,
        })?,
        Command::Flags { backend, set } => run_flags(&backend, &set)?,
        Command::PrepareReboot { backend } => {
            let config = ControllerConfig::from_env()?;
            let mut db = Database::open(&config.database_path)?;
            let count = admin::prepare_for_reboot(&mut db, &config, &backend)?;
            println!("Backend '{backend}' paused; {count} running job(s) reset for reboot");
        }
        Command::KillJob { job_id } => {
            let config = ControllerConfig::from_env()?;
            let mut db = Database::open(&config.database_path)?;
            admin::kill_job(&mut db, &config, &job_id)?;
            println!("Job {job_id} killed");
        }
    }
    Ok(())
}

/// Wire SIGTERM/SIGINT to a cancellation token. Every tick loop (scheduler,
/// sync, agent) watches the token and finishes its current pass before
/// exiting, so a job evaluation is never cut in half.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(signal = name, "Winding down loops");
        trigger.cancel();
    });

    token
}

async fn run_controller() -> Result<(), Box<dyn std::error::Error>> {
    let config = ControllerConfig::from_env()?;
    let db = shared(Database::open(&config.database_path)?);
    let shutdown = shutdown_token();

    tracing::info!(
        backends = ?config.backends,
        bind_addr = %config.bind_addr,
        "Starting controller"
    );

    let source = Arc::new(GitProjectSource::new(
        config.repos_dir.clone(),
        config.private_repo_token.clone(),
    ));

    // The scheduler is deliberately a plain blocking thread: one tick never
    // interleaves with another, which keeps the state machine linearizable.
    let scheduler = Scheduler::new(db.clone(), config.clone(), source);
    let scheduler_shutdown = shutdown.clone();
    let scheduler_thread = std::thread::Builder::new()
        .name("scheduler".into())
        .spawn(move || scheduler.run(scheduler_shutdown))?;

    let sync_loop = SyncLoop::new(db.clone(), config.clone());
    let sync_handle = tokio::spawn(sync_loop.run(shutdown.clone()));

    let state = api::ApiState {
        db,
        config: Arc::new(config.clone()),
    };
    api::serve(state, config.bind_addr, shutdown.clone()).await?;

    sync_handle.await.ok();
    scheduler_thread
        .join()
        .map_err(|_| "scheduler thread panicked")?;
    tracing::info!("Controller stopped");
    Ok(())
}

async fn run_agent() -> Result<(), Box<dyn std::error::Error>> {
    let config = AgentConfig::from_env()?;
    let shutdown = shutdown_token();

    tracing::info!(backend = %config.backend, "Starting agent");

    let executor = LocalDockerExecutor::new(config.clone());
    let client = HttpControllerClient::new(&config);
    let agent = AgentLoop::new(executor, client, config);
    agent.run(shutdown).await;

    tracing::info!("Agent stopped");
    Ok(())
}

struct AddJobArgs {
    backend: String,
    workspace: String,
    repo_url: String,
    branch: String,
    commit: String,
    database_name: String,
    force_run_dependencies: bool,
    actions: Vec<String>,
}

/// The offline counterpart of `POST /rap/create/`: insert a request row for
/// the scheduler's next intake pass.
fn run_add_job(args: AddJobArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.actions.is_empty() {
        return Err("at least one action must be supplied".into());
    }
    let config = ControllerConfig::from_env()?;
    if !config.backends.contains(&args.backend) {
        return Err(format!("unknown backend '{}'", args.backend).into());
    }
    let mut db = Database::open(&config.database_path)?;

    let id = Uuid::new_v4().simple().to_string();
    let original = json!({
        "identifier": &id,
        "sha": &args.commit,
        "workspace": {
            "name": &args.workspace,
            "repo": &args.repo_url,
            "branch": &args.branch,
        },
        "requested_actions": &args.actions,
        "cancelled_actions": [],
        "codelists_ok": true,
        "database_name": &args.database_name,
        "force_run_dependencies": args.force_run_dependencies,
        "backend": &args.backend,
        "created_by": "add-job",
    });
    let request = JobRequest {
        id: id.clone(),
        repo_url: args.repo_url,
        branch: args.branch,
        commit: args.commit,
        requested_actions: args.actions,
        cancelled_actions: vec![],
        workspace: args.workspace,
        codelists_ok: true,
        database_name: args.database_name,
        force_run_dependencies: args.force_run_dependencies,
        backend: args.backend,
        original,
    };
    db.upsert_job_request(&request)?;
    println!("Added job request {id}; jobs will be created on the next controller tick");
    Ok(())
}

fn run_flags(backend: &str, set: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let config = ControllerConfig::from_env()?;
    let mut db = Database::open(&config.database_path)?;

    if set.is_empty() {
        for flag in admin::show_flags(&db, backend)? {
            println!("{flag}");
        }
        return Ok(());
    }

    let mut pairs = Vec::new();
    for entry in set {
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| format!("expected name=value, got '{entry}'"))?;
        let value = if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        };
        pairs.push((name.to_string(), value));
    }
    for flag in admin::set_flags(&mut db, backend, &pairs)? {
        println!("{flag}");
    }
    Ok(())
}
