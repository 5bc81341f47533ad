//! eSwitch agent daemon
//!
//! Maps physical networks to SR-IOV PFs, then reconciles attached devices
//! with the control plane every polling interval until SIGINT.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use eswitch_agent::{
    AgentConfig, AgentNotification, EswitchAgent, EswitchManager, LocalPluginApi,
    DEFAULT_CONFIG_PATH,
};
use eswitch_common::RecordingRunner;
use eswitch_handler::{DeviceControl, EswitchHandler, IpLinkControl};
use eswitch_segments::{PluginCallbacks, VlanPool};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Capacity of the inbound notification queue
const NOTIFICATION_QUEUE_DEPTH: usize = 256;

/// SR-IOV eSwitch agent
#[derive(Parser, Debug)]
#[command(name = "eswitch-agent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Record hardware commands instead of running them
    #[arg(long)]
    dry_run: bool,

    /// Polling interval in seconds; overrides the config file
    #[arg(long)]
    polling_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match AgentConfig::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("eswitch-agent: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(level) = &args.log_level {
        config.agent.log_level = level.clone();
    }
    if let Some(secs) = args.polling_interval {
        config.agent.polling_interval_secs = secs;
    }
    config.eswitch.dry_run |= args.dry_run;

    init_logging(&config.agent.log_level);

    info!(config = %args.config.display(), "eswitch-agent: Starting");

    match run_daemon(config).await {
        Ok(()) => {
            info!("eswitch-agent: Exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "eswitch-agent: Exiting with error");
            ExitCode::FAILURE
        }
    }
}

/// Installs the tracing subscriber; `RUST_LOG` wins over `log_level`
fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_line_number(true).compact())
        .init();
}

async fn run_daemon(config: AgentConfig) -> anyhow::Result<()> {
    config.validate().context("invalid configuration")?;
    let interface_mappings = config.interface_mappings()?;
    let vlan_ranges = config.network_vlan_ranges()?;

    let control: Arc<dyn DeviceControl> = if config.eswitch.dry_run {
        warn!("eswitch-agent: Dry run, hardware commands are only recorded");
        Arc::new(IpLinkControl::with_runner(RecordingRunner::new()))
    } else {
        Arc::new(IpLinkControl::new(config.root_helper()))
    };

    let pool = Arc::new(
        VlanPool::open(&config.segments.state_file)
            .with_context(|| format!("loading {}", config.segments.state_file))?,
    );
    pool.sync_network_states(&vlan_ranges);
    let plugin = Arc::new(LocalPluginApi::new(Arc::new(PluginCallbacks::new(
        pool.clone(),
    ))));

    let mut manager = EswitchManager::new(EswitchHandler::new(control), interface_mappings);
    manager
        .define_fabric_mappings()
        .await
        .context("failed to map physical networks")?;
    info!(mappings = ?manager.interface_mappings(), "eswitch-agent: Fabrics mapped");

    let agent = EswitchAgent::new(
        manager,
        plugin,
        config.agent.agent_id.clone(),
        config.polling_interval(),
    );

    // Notifications arrive through this queue once a transport is attached
    let (_notify_tx, notify_rx) = mpsc::channel::<AgentNotification>(NOTIFICATION_QUEUE_DEPTH);
    let shutdown = setup_signal_handlers();

    let stats = agent.run(notify_rx, shutdown).await;
    info!(
        ticks = stats.ticks,
        resyncs = stats.resyncs,
        overruns = stats.overruns,
        "eswitch-agent: Agent loop finished"
    );

    pool.save().context("failed to save segment state")?;
    Ok(())
}

/// Flips the returned watch to true on SIGINT
fn setup_signal_handlers() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("eswitch-agent: Received SIGINT");
            let _ = tx.send(true);
        }
    });

    rx
}
