//! Kiosk CLI
//!
//! Command-line front end for the kiosk signal transport:
//!
//! - `serve`: MultiEval server feeding projects to evaluation workers
//! - `worker`: evaluation worker (also started via the hidden
//!   `--kiosk-worker` flag by `serve --spawn`)
//! - `secondary`: DRC secondary driving a simulated measurement host
//! - `robot`: multi-robot measurement instance
//! - `cycle`: multi-robot coordinator running one measurement cycle
//!
//! ```text
//! kiosk serve --spawn 2 proj_a proj_b proj_c
//! kiosk cycle --spawn 2 --template part_a --positions p1,p2
//! ```

mod config;
mod executor;
mod report;
mod supervisor;
mod worker;

pub use config::*;
pub use executor::{EvalExecutor, ExecutionConfig, ProjectResult, ProjectStatus};
pub use report::{
    format_cycle_output, format_human_output, generate_csv_report, generate_cycle_csv,
    generate_json_report, CycleReport, OutputFormat, Report, ReportMeta, ReportSummary,
};
pub use supervisor::{PeerHandle, PeerRole, Supervisor, SupervisorError, WORKER_FLAG};
pub use worker::{EvalOutcome, EvalWorker};

use anyhow::Context;
use clap::{Parser, Subcommand};
use kiosk_core::{ClientConfig, CommError, CommunicationClient, CommunicationServer, MultiEvalServer};
use kiosk_ipc::SignalRegistry;
use kiosk_logic::{
    wait_until, CycleError, CyclePlan, DrcSecondary, MultiRobotCoordinator, MultiRobotMeasure,
    SimulatedHost, Step, WaitCheck, WaitPolicy,
};
use regex::Regex;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Kiosk CLI arguments
#[derive(Parser, Debug)]
#[command(name = "kiosk")]
#[command(author, version, about = "Inter-process signal server and measurement orchestration")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Listen port, overrides the config file
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Number of peers that must handshake before work starts
    #[arg(long, global = true)]
    pub peers: Option<usize>,

    /// Only evaluate projects matching this regex
    #[arg(long, default_value = ".*")]
    pub filter: String,

    /// Output format: json, csv, human
    #[arg(long, default_value = "human")]
    pub format: String,

    /// Output file (stdout if not specified)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Internal: run as evaluation worker (used by `serve --spawn`)
    #[arg(long, hide = true)]
    pub kiosk_worker: bool,

    /// Internal: server address for `--kiosk-worker`
    #[arg(long, hide = true)]
    pub connect: Option<SocketAddr>,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the MultiEval server and evaluate projects
    Serve {
        /// Start this many local evaluation workers
        #[arg(long, default_value = "0")]
        spawn: usize,

        /// Dispatch to busy workers when none is idle
        #[arg(long)]
        queue_on_busy: bool,

        /// Projects to evaluate
        #[arg(required = true)]
        projects: Vec<String>,
    },
    /// Run an evaluation worker
    Worker {
        /// Server address
        #[arg(long)]
        connect: SocketAddr,
    },
    /// Run a DRC secondary against a primary
    Secondary {
        /// Primary address
        #[arg(long)]
        connect: SocketAddr,
    },
    /// Run a multi-robot measurement instance
    Robot {
        /// Coordinator address
        #[arg(long)]
        connect: SocketAddr,
    },
    /// Run one multi-robot measurement cycle
    Cycle {
        /// Start this many local robot instances
        #[arg(long, default_value = "0")]
        spawn: usize,

        /// Measurement template
        #[arg(long)]
        template: String,

        /// Positions, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        positions: Vec<String>,

        /// Measurement series name
        #[arg(long, default_value = "scan")]
        series: String,

        /// Export target
        #[arg(long, default_value = "results")]
        export: String,
    },
}

/// Run the kiosk CLI with process arguments.
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_with_cli(cli)
}

/// Run the kiosk CLI with pre-parsed arguments.
pub fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    init_logging(cli.verbose);

    let mut config = KioskConfig::load_or_default(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(peers) = cli.peers {
        config.server.expected_peers = peers;
    }

    let format: OutputFormat = cli.format.parse().unwrap_or(OutputFormat::Human);

    if cli.kiosk_worker {
        let server = cli
            .connect
            .context("--kiosk-worker requires --connect")?;
        return run_worker(&config, server);
    }

    let result = match &cli.command {
        Some(Commands::Serve {
            spawn,
            queue_on_busy,
            projects,
        }) => run_serve(&cli, &config, format, *spawn, *queue_on_busy, projects),
        Some(Commands::Worker { connect }) => run_worker(&config, *connect),
        Some(Commands::Secondary { connect }) => run_secondary(&config, *connect),
        Some(Commands::Robot { connect }) => run_robot(&config, *connect),
        Some(Commands::Cycle {
            spawn,
            template,
            positions,
            series,
            export,
        }) => {
            let plan = CyclePlan {
                template: template.clone(),
                positions: positions.clone(),
                series: series.clone(),
                export_target: export.clone(),
            };
            run_cycle(&cli, &config, format, *spawn, &plan)
        }
        None => {
            println!("No command given, see `kiosk --help`.");
            Ok(())
        }
    };

    if let Err(e) = &result {
        if let Some(CommError::HandshakeTimeout { .. }) = e.downcast_ref::<CommError>() {
            error!(error = %e, "Peers did not connect in time");
        }
    }
    result
}

fn init_logging(verbose: bool) {
    let default = if verbose { "kiosk=debug" } else { "kiosk=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    // Reports go to stdout
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn registry() -> Arc<SignalRegistry> {
    Arc::new(SignalRegistry::with_protocol())
}

/// Connect to `server`, retrying while it is not listening yet
fn connect_with_retry(
    server: SocketAddr,
    config: ClientConfig,
    policy: WaitPolicy,
) -> anyhow::Result<CommunicationClient> {
    let registry = registry();
    wait_until(policy, |delay| {
        match CommunicationClient::connect(server, config.clone(), registry.clone()) {
            Ok(client) => WaitCheck::Ready(client),
            Err(e) => {
                warn!(%server, error = %e, "Connect failed, retrying");
                std::thread::sleep(delay);
                WaitCheck::Empty
            }
        }
    })
    .with_context(|| format!("Could not connect to {}", server))
}

fn write_output(cli: &Cli, output: &str) -> anyhow::Result<()> {
    if let Some(ref path) = cli.output {
        let mut file = std::fs::File::create(path)?;
        file.write_all(output.as_bytes())?;
        println!("Report written to: {}", path.display());
    } else {
        print!("{}", output);
    }
    Ok(())
}

fn filter_projects(cli: &Cli, projects: &[String]) -> anyhow::Result<Vec<String>> {
    let pattern = Regex::new(&cli.filter).context("Invalid --filter pattern")?;
    Ok(projects
        .iter()
        .filter(|p| pattern.is_match(p))
        .cloned()
        .collect())
}

fn run_serve(
    cli: &Cli,
    config: &KioskConfig,
    format: OutputFormat,
    spawn: usize,
    queue_on_busy: bool,
    projects: &[String],
) -> anyhow::Result<()> {
    let projects = filter_projects(cli, projects)?;
    if projects.is_empty() {
        println!("No projects match the filter.");
        return Ok(());
    }

    let mut server =
        MultiEvalServer::bind(config.server_addr(), config.multi_eval_config(), registry())?;
    let addr = server.local_addr();
    info!(%addr, projects = projects.len(), "MultiEval server listening");

    let mut supervisor = Supervisor::new(cli.config.clone());
    supervisor.spawn(PeerRole::Evaluator, spawn, addr)?;

    let expected = config.server.expected_peers.max(spawn);
    let handshake = config.handshake_policy();
    server.wait_for_first_connection(expected, handshake.retries, handshake.delay)?;

    let executor = EvalExecutor::new(ExecutionConfig {
        eval_timeout: config.eval_timeout(),
        poll_interval: config.poll_interval(),
        queue_on_busy,
        show_progress: cli.output.is_some() || format == OutputFormat::Human,
    });
    let results = executor.execute(&mut server, &projects);

    let peers = server.server().handshaked_count();
    server.shutdown();
    supervisor.shutdown(config.server_config().send_timeout);

    let report = Report::new(ReportMeta::new(addr.to_string(), peers), results);
    let output = match format {
        OutputFormat::Json => generate_json_report(&report)?,
        OutputFormat::Csv => generate_csv_report(&report),
        OutputFormat::Human => format_human_output(&report),
    };
    write_output(cli, &output)?;

    if !report.summary.all_passed() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_worker(config: &KioskConfig, server: SocketAddr) -> anyhow::Result<()> {
    let client = connect_with_retry(server, config.client_config(), config.handshake_policy())?;
    info!(%server, pid = client.own_pid(), "Evaluation worker connected");

    let mut worker = EvalWorker::new(client, config.worker.command.clone(), config.poll_interval())
        .with_reconnect(config.handshake_policy());
    match worker.run() {
        Step::Error(message) => anyhow::bail!("Worker failed: {}", message),
        _ => {
            info!(evaluated = worker.evaluated(), "Worker finished");
            Ok(())
        }
    }
}

fn run_secondary(config: &KioskConfig, primary: SocketAddr) -> anyhow::Result<()> {
    let client = connect_with_retry(primary, config.client_config(), config.handshake_policy())?;
    info!(%primary, "DRC secondary connected");

    let mut secondary = DrcSecondary::new(client, SimulatedHost::new(), config.poll_interval())
        .with_reconnect(config.handshake_policy());
    let step = secondary.run();
    let stats = secondary.stats();
    info!(
        handled = stats.handled,
        failed = stats.failed,
        rejected = stats.rejected,
        "Secondary finished"
    );
    match step {
        Step::Error(message) => anyhow::bail!("Secondary failed: {}", message),
        _ => Ok(()),
    }
}

fn run_robot(config: &KioskConfig, coordinator: SocketAddr) -> anyhow::Result<()> {
    let client =
        connect_with_retry(coordinator, config.client_config(), config.handshake_policy())?;
    info!(%coordinator, "Robot instance connected");

    let mut robot = MultiRobotMeasure::new(client, SimulatedHost::new(), config.poll_interval())
        .with_reconnect(config.handshake_policy());
    match robot.run() {
        Step::Error(message) => anyhow::bail!("Robot instance failed: {}", message),
        _ => Ok(()),
    }
}

fn run_cycle(
    cli: &Cli,
    config: &KioskConfig,
    format: OutputFormat,
    spawn: usize,
    plan: &CyclePlan,
) -> anyhow::Result<()> {
    let server =
        CommunicationServer::bind(config.server_addr(), config.server_config(), registry())?;
    let addr = server.local_addr();
    info!(%addr, "Multi-robot coordinator listening");

    let mut supervisor = Supervisor::new(cli.config.clone());
    supervisor.spawn(PeerRole::Robot, spawn, addr)?;

    let expected = config.server.expected_peers.max(spawn);
    let mut coordinator = MultiRobotCoordinator::new(server, expected, config.cycle_policy());

    let outcome = coordinator
        .wait_ready(config.handshake_policy())
        .and_then(|_| coordinator.init())
        .and_then(|_| coordinator.run_cycle(plan));

    let instances = coordinator.ready_count();
    coordinator.shutdown();
    supervisor.shutdown(Duration::from_secs(5));

    let summary = match outcome {
        Ok(summary) => summary,
        Err(CycleError::Comm(e)) => return Err(e.into()),
        Err(e) => return Err(anyhow::Error::new(e).context("Measurement cycle failed")),
    };

    let report = CycleReport::new(ReportMeta::new(addr.to_string(), instances), &plan.template, &summary);
    let output = match format {
        OutputFormat::Json => generate_json_report(&report)?,
        OutputFormat::Csv => generate_cycle_csv(&report),
        OutputFormat::Human => format_cycle_output(&report),
    };
    write_output(cli, &output)
}
