//! CLI command definitions for kued.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info, warn};

use crate::catalog::ModuleCatalog;
use crate::config::Config;
use crate::metrics::init_metrics;
use crate::process::{LocalProcessManager, ProcessTarget};
use crate::workgroup::{
    notifier_from_env, NullNotifier, Workgroup, WorkgroupEvent, WorkgroupManager,
};

/// Default directory for child process logs.
const DEFAULT_LOG_DIR: &str = "./logs";

/// Queue workers, bridges and workgroups.
#[derive(Parser)]
#[command(name = "kued")]
#[command(about = "Run and supervise job-queue workers, bridges and workgroups")]
#[command(version)]
#[command(
    long_about = "kued runs named workers (job-queue consumers) and bridges (message relays), grouped into workgroups that each run as a supervised child process.\n\nExample usage:\n  kued launch --config kued.yaml\n  kued start --config kued.yaml --workgroup billing"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Launch every workgroup of a configuration as a supervised process.
    Launch(LaunchArgs),

    /// Run one workgroup in this process.
    Start(StartArgs),

    /// Print the encoded payload a workgroup process is started with.
    Encode(EncodeArgs),

    /// Child entry point used by `launch`.
    #[command(hide = true)]
    Node(NodeArgs),
}

/// Arguments for `kued launch`.
#[derive(Parser, Debug)]
pub struct LaunchArgs {
    /// Configuration file (JSON or YAML).
    #[arg(short, long, env = "KUED_CONFIG")]
    pub config: PathBuf,

    /// Directory for workgroup process logs.
    #[arg(long, default_value = DEFAULT_LOG_DIR)]
    pub log_dir: PathBuf,
}

/// Arguments for `kued start`.
#[derive(Parser, Debug)]
pub struct StartArgs {
    /// Configuration file (JSON or YAML).
    #[arg(short, long, env = "KUED_CONFIG")]
    pub config: PathBuf,

    /// Name of the workgroup to run.
    #[arg(short, long)]
    pub workgroup: String,
}

/// Arguments for `kued encode`.
#[derive(Parser, Debug)]
pub struct EncodeArgs {
    /// Configuration file (JSON or YAML).
    #[arg(short, long, env = "KUED_CONFIG")]
    pub config: PathBuf,

    /// Name of the workgroup to encode.
    #[arg(short, long)]
    pub workgroup: String,
}

/// Arguments for `kued node`.
#[derive(Parser, Debug)]
pub struct NodeArgs {
    /// Command keyword (`run`).
    pub command: String,

    /// Base64-encoded workgroup configuration.
    pub payload: String,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Launch(args) => run_launch_command(args).await,
        Commands::Start(args) => run_start_command(args).await,
        Commands::Encode(args) => run_encode_command(args),
        Commands::Node(args) => run_node_command(args).await,
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = Config::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    Ok(())
}

// ============================================================================
// Parent side
// ============================================================================

async fn run_launch_command(args: LaunchArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    init_metrics()?;

    let processes = Arc::new(LocalProcessManager::new(&args.log_dir));
    let manager = WorkgroupManager::with_current_exe(processes)?;

    let mut events = manager.subscribe();
    let relay = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                WorkgroupEvent::WorkersSpawned(envelope) => {
                    info!(process = %envelope.process.name, "{}", envelope.data.message)
                }
                WorkgroupEvent::Error(envelope) => error!(
                    process = %envelope.process.name,
                    data = %envelope.data.data,
                    "{}",
                    envelope.data.message
                ),
                WorkgroupEvent::Message(envelope) => debug!(
                    process = %envelope.process.name,
                    kind = %envelope.data.kind,
                    "{}",
                    envelope.data.message
                ),
                WorkgroupEvent::Disconnected => break,
            }
        }
    });

    manager
        .connect()
        .await
        .context("Could not communicate with the process manager")?;

    if let Err(e) = manager.launch(&config).await {
        error!(error = %e, "Failed to launch one or more Workgroups.");
    }

    wait_for_shutdown().await?;

    for (name, _) in manager.tracked() {
        if let Err(e) = manager.kill(&ProcessTarget::Name(name.clone())).await {
            warn!(workgroup = %name, error = %e, "Failed to stop workgroup");
        }
    }
    manager.disconnect().await?;
    let _ = relay.await;
    Ok(())
}

fn run_encode_command(args: EncodeArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    let node = config.node_config_for(&args.workgroup)?;
    println!("{}", node.encode()?);
    Ok(())
}

// ============================================================================
// Child side
// ============================================================================

async fn run_start_command(args: StartArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    let node = config.node_config_for(&args.workgroup)?;
    init_metrics()?;

    let workgroup = Workgroup::new(
        node,
        Arc::new(ModuleCatalog::with_builtins()),
        Arc::new(NullNotifier),
    )?;
    let summary = workgroup.spawn_workers().await?;
    info!(
        workgroup = %args.workgroup,
        workers = summary.workers.len(),
        bridges = summary.bridges.len(),
        "Workgroup running"
    );

    wait_for_shutdown().await?;
    workgroup.shutdown().await;
    Ok(())
}

async fn run_node_command(args: NodeArgs) -> anyhow::Result<()> {
    init_metrics()?;

    let (command, workgroup) = Workgroup::from_args(
        &[args.command, args.payload],
        Arc::new(ModuleCatalog::with_builtins()),
        notifier_from_env(),
    )?;

    // Failures are already reported to the parent; stay up so the process
    // manager does not restart into the same error.
    if let Err(e) = workgroup.execute(&command).await {
        warn!(error = %e, "Workgroup did not start cleanly");
    }

    wait_for_shutdown().await?;
    workgroup.shutdown().await;
    Ok(())
}
