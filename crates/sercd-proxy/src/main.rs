//! sercd-proxy daemon entry point.
//!
//! Wires the infrastructure adapters into the [`Supervisor`] and drives it
//! from the command line.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load AppConfig (TOML) + CLI overrides
//!  └─ run (default)
//!  │    ├─ DeviceAccess (access(2) probe, su helper, serialport opener)
//!  │    ├─ ProxyStateMachine (tracing sink, channel listener)
//!  │    ├─ Supervisor::start  (blocking pool)
//!  │    └─ wait for Ctrl-C or Crashed, then Supervisor::stop
//!  └─ loopback
//!       └─ StreamPump::start_loopback, stats once per second
//! ```
//!
//! The supervisor API is synchronous and may block (helper process, thread
//! joins), so every call into it goes through `spawn_blocking`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sercd_core::ProxyState;
use sercd_proxy::application::device_access::{DeviceAccess, DeviceOpener};
use sercd_proxy::application::state_machine::ProxyStateMachine;
use sercd_proxy::application::stream_pump::{StreamPump, DEFAULT_SHUTDOWN_GRACE};
use sercd_proxy::application::supervisor::{StartOutcome, Supervisor};
use sercd_proxy::infrastructure::bridge::raw_tcp::RawTcpEngine;
use sercd_proxy::infrastructure::device::su_helper::SuHelper;
use sercd_proxy::infrastructure::device::{NativeAccessProbe, NativePortOpener};
use sercd_proxy::infrastructure::notification::{ChannelStateListener, TracingNotificationSink};
use sercd_proxy::infrastructure::storage::config::{self, AppConfig};

#[derive(Debug, Parser)]
#[command(name = "sercd-proxy", version, about = "Bridge a serial device to a TCP port")]
struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, env = "SERCD_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the proxy until Ctrl-C (the default).
    Run(RunArgs),
    /// Write a test pattern to the device and count what comes back.
    Loopback(LoopbackArgs),
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Serial device path.
    #[arg(long)]
    device: Option<PathBuf>,
    /// Serial baud rate.
    #[arg(long)]
    baud: Option<u32>,
    /// IP address to listen on.
    #[arg(long)]
    interface: Option<String>,
    /// TCP port to listen on.
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Debug, Args)]
struct LoopbackArgs {
    /// Serial device path.
    #[arg(long)]
    device: Option<PathBuf>,
    /// Serial baud rate.
    #[arg(long)]
    baud: Option<u32>,
    /// Stop after this many seconds.
    #[arg(long, default_value_t = 10)]
    duration_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    }
    .context("failed to load configuration")?;

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cfg.daemon.log_level)),
        )
        .init();

    match cli.command.unwrap_or_else(|| Command::Run(RunArgs::default())) {
        Command::Run(args) => run_proxy(cfg, args).await,
        Command::Loopback(args) => run_loopback(cfg, args).await,
    }
}

fn device_access(cfg: &AppConfig) -> DeviceAccess {
    let access = DeviceAccess::new(
        Arc::new(NativeAccessProbe),
        Arc::new(NativePortOpener::default()),
    )
    .with_helper_timeout(cfg.helper_timeout());

    match SuHelper::detect(cfg.helper.program.clone()) {
        Some(helper) => access.with_helper(Arc::new(helper)),
        None => access,
    }
}

async fn run_proxy(mut cfg: AppConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Some(device) = args.device {
        cfg.serial.device = device;
    }
    if let Some(baud) = args.baud {
        cfg.serial.baud_rate = baud;
    }
    if let Some(interface) = args.interface {
        cfg.network.interface = interface;
    }
    if let Some(port) = args.port {
        cfg.network.port = port;
    }
    let proxy_config = cfg
        .to_proxy_config()
        .context("invalid proxy configuration")?;

    let machine = Arc::new(ProxyStateMachine::new(Arc::new(TracingNotificationSink::new())));
    let (listener, mut changes) = ChannelStateListener::new();
    machine.subscribe(Arc::new(listener));

    let supervisor = Arc::new(Supervisor::new(
        Arc::new(device_access(&cfg)),
        Arc::new(RawTcpEngine::new(cfg.poll_interval())),
        machine,
    ));

    let starter = Arc::clone(&supervisor);
    let outcome = tokio::task::spawn_blocking(move || starter.start(proxy_config))
        .await
        .context("start task failed")?
        .context("failed to start proxy")?;
    if let StartOutcome::Started(id) = outcome {
        info!(session = %id, "sercd-proxy running; press Ctrl-C to stop");
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let crashed = loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!("failed to listen for Ctrl-C: {e}");
                }
                info!("shutdown requested");
                break false;
            }
            change = changes.recv() => match change {
                Some(change) if change.to == ProxyState::Crashed => break true,
                Some(_) => continue,
                None => break false,
            },
        }
    };

    let stopper = Arc::clone(&supervisor);
    tokio::task::spawn_blocking(move || stopper.stop())
        .await
        .context("stop task failed")?;

    if crashed {
        bail!("proxy session crashed; see the log for the bridge engine error");
    }
    Ok(())
}

async fn run_loopback(cfg: AppConfig, args: LoopbackArgs) -> anyhow::Result<()> {
    let path = args.device.unwrap_or_else(|| cfg.serial.device.clone());
    let baud = args.baud.unwrap_or(cfg.serial.baud_rate);
    let access = device_access(&cfg);

    let device = tokio::task::spawn_blocking(move || access.open(&path, baud))
        .await
        .context("open task failed")?
        .context("failed to open serial device")?;

    let pump = StreamPump::start_loopback(device, |data: &[u8]| {
        tracing::trace!(len = data.len(), "loopback bytes received");
    })
    .context("failed to start loopback pump")?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let deadline = tokio::time::sleep(Duration::from_secs(args.duration_secs));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(deadline, ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = pump.stats();
                info!(
                    incoming = stats.bytes_read,
                    outgoing = stats.bytes_written,
                    "loopback counters"
                );
                if pump.is_finished() {
                    warn!("loopback loops ended early");
                    break;
                }
            }
            _ = &mut deadline => break,
            _ = &mut ctrl_c => break,
        }
    }

    let report = tokio::task::spawn_blocking(move || pump.shutdown(DEFAULT_SHUTDOWN_GRACE))
        .await
        .context("shutdown task failed")?;

    println!(
        "loopback: {} bytes out, {} bytes in (reader: {:?}, writer: {:?})",
        report.stats.bytes_written,
        report.stats.bytes_read,
        report.reader,
        report.writer
    );
    Ok(())
}
