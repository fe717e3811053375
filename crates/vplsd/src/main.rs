//! vplsd entry point.
//!
//! Loads the VPLS configuration and topology, programs every switch, then
//! listens for control frames until SIGINT or SIGTERM.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vplsd::cli::CliControl;
use vplsd::config::defaults;
use vplsd::frame_source::{FrameSource, PacketSocketSource};
use vplsd::handlers::TracingSink;
use vplsd::types::SwitchInfo;
use vplsd::{
    ControllerSettings, EcmpPolicy, ForwardingControl, Orchestrator, RecordingControl,
    StaticTopology, SwitchConnector, VplsConfig, VplsError,
};

/// VPLS controller for programmable switches
#[derive(Parser, Debug)]
#[command(name = "vplsd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// VPLS configuration file (host to customer id)
    config: Option<PathBuf>,

    /// Topology description file
    #[arg(short = 't', long, default_value = defaults::TOPOLOGY_FILE)]
    topology: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Frames buffered per switch between capture and dispatch
    #[arg(long, default_value_t = defaults::QUEUE_DEPTH)]
    queue_depth: usize,

    /// Mirror session id used for the CPU port
    #[arg(long, default_value_t = defaults::MIRROR_ID)]
    mirror_id: u32,

    /// How equal-cost paths become tunnels
    #[arg(long, value_enum, default_value_t = EcmpPolicy::All)]
    ecmp: EcmpPolicy,

    /// Switch runtime CLI binary
    #[arg(long, default_value = defaults::CLI_BINARY)]
    cli: String,

    /// Record control commands in memory instead of sending them
    #[arg(long)]
    dry_run: bool,
}

/// Opens the CLI adapter (or an in-memory switch) and the CPU interface
/// capture for each switch.
struct DefaultConnector {
    cli: String,
    dry_run: bool,
}

impl SwitchConnector for DefaultConnector {
    fn control(&self, switch: &SwitchInfo) -> vplsd::Result<Arc<dyn ForwardingControl>> {
        if self.dry_run {
            return Ok(Arc::new(RecordingControl::new(&switch.name)));
        }
        Ok(Arc::new(CliControl::new(
            &switch.name,
            switch.thrift_port,
            &self.cli,
        )))
    }

    fn frame_source(&self, switch: &SwitchInfo) -> vplsd::Result<Box<dyn FrameSource>> {
        let interface = switch.cpu_intf.as_deref().ok_or_else(|| {
            VplsError::capture(&switch.name, "Switch has no CPU interface configured")
        })?;
        Ok(Box::new(PacketSocketSource::open(interface)?))
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();
}

/// Cancels `token` on SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received SIGINT, shutting down");
            }
        }
        token.cancel();
    });
}

async fn run(args: Args, config_path: PathBuf) -> anyhow::Result<()> {
    let config = VplsConfig::load(&config_path)
        .with_context(|| format!("Loading VPLS configuration {}", config_path.display()))?;
    let topology = StaticTopology::load(&args.topology)
        .with_context(|| format!("Loading topology {}", args.topology.display()))?;

    let settings = ControllerSettings {
        mirror_id: args.mirror_id,
        queue_depth: args.queue_depth,
        ecmp: args.ecmp,
    };
    info!(
        config = %config_path.display(),
        hosts = config.hosts.len(),
        pseudowires = config.pseudowires().len(),
        mirror_id = settings.mirror_id,
        queue_depth = settings.queue_depth,
        ecmp = ?settings.ecmp,
        dry_run = args.dry_run,
        "Starting vplsd"
    );

    let connector = DefaultConnector {
        cli: args.cli,
        dry_run: args.dry_run,
    };
    let orchestrator = Orchestrator::new(Arc::new(topology), config, settings, &connector)
        .context("Connecting to switches")?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let reports = orchestrator
        .run(&connector, Arc::new(TracingSink), cancel)
        .await
        .context("Starting listeners")?;
    for report in &reports {
        info!(switch = %report.switch, stats = ?report.stats, "Listener summary");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    let Some(config_path) = args.config.clone() else {
        error!("No VPLS configuration file given");
        return ExitCode::FAILURE;
    };

    match run(args, config_path).await {
        Ok(()) => {
            info!("vplsd shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = ?e, "vplsd exiting with error");
            ExitCode::FAILURE
        }
    }
}
