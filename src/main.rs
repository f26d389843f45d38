//! CLI Entry Point for rig-hmi
//!
//! Drives the device-communication core without a browser:
//! - `watch`: connect the transport and print connection and device status
//! - `send`: one command through the dispatcher
//! - `stop`: idle both commandable units
//! - `estop`: emergency stop plus idle commands to both units
//!
//! # Usage
//!
//! ```bash
//! rig-hmi watch --strategy push --seconds 30
//! rig-hmi send lcu --direction fw --target 40
//! rig-hmi --backend 192.168.2.1 stop
//! rig-hmi --mock estop
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rig_hmi::config::StrategyKind;
use rig_hmi::protocol::{CommandMode, CommandParams, DeviceId, Direction};
use rig_hmi::status::DeviceStatusAggregator;
use rig_hmi::transport::EventKind;
use rig_hmi::{
    tracing_init, Backend, CommandDispatcher, DispatchOutcome, HmiConfig, HttpBackend,
    MockBackend, TransportManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rig-hmi")]
#[command(about = "Operator console core for the LCU/DCU/SDU rig", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/hmi.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend address, overriding environment and configuration
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Use the in-memory mock backend instead of a live one
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print status until Ctrl+C
    Watch {
        /// Override the configured transport strategy
        #[arg(long)]
        strategy: Option<StrategyKind>,

        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Send one command
    Send {
        /// Target unit (lcu or dcu)
        device: DeviceId,

        /// Direction (fw/bw for LCU, cw/ccw for DCU, idle)
        #[arg(long)]
        direction: Direction,

        /// Target value, clamped to the unit's range
        #[arg(long)]
        target: f64,

        /// Run mode
        #[arg(long, default_value = "run_cont")]
        mode: CommandMode,
    },

    /// Idle both commandable units
    Stop,

    /// Emergency stop
    Estop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => HmiConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => HmiConfig::load()?,
    };
    if let Commands::Watch {
        strategy: Some(strategy),
        ..
    } = &cli.command
    {
        config.transport.strategy = *strategy;
    }
    config.validate()?;
    tracing_init::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let address = config.backend_address(cli.backend.as_deref());
    let backend: Arc<dyn Backend> = if cli.mock {
        println!("🧪 Using mock backend");
        Arc::new(MockBackend::new())
    } else {
        println!("🔌 Backend: {} ({})", address, address.source());
        Arc::new(HttpBackend::new(address.clone()))
    };

    let dispatcher = CommandDispatcher::new(
        Arc::clone(&backend),
        config.protocol.table(),
        config.limits.clone(),
    )
    .with_single_in_flight(config.control.single_in_flight);

    match cli.command {
        Commands::Watch { seconds, .. } => {
            if cli.mock && config.transport.strategy == StrategyKind::Push {
                println!("⚠️  Mock backend has no socket; polling instead");
                config.transport.strategy = StrategyKind::Pull;
            }
            watch(&config, &address, backend, seconds).await
        }
        Commands::Send {
            device,
            direction,
            target,
            mode,
        } => {
            let outcome = dispatcher
                .send(device, mode, &CommandParams::motion(direction, target))
                .await;
            report(&format!("{device} {mode}"), &outcome);
            Ok(())
        }
        Commands::Stop => {
            let (lcu, dcu) = tokio::join!(
                dispatcher.idle(DeviceId::Lcu),
                dispatcher.idle(DeviceId::Dcu)
            );
            report("lcu idle", &lcu);
            report("dcu idle", &dcu);
            Ok(())
        }
        Commands::Estop => {
            let (outcome, lcu, dcu) = tokio::join!(
                dispatcher.emergency_stop(),
                dispatcher.idle(DeviceId::Lcu),
                dispatcher.idle(DeviceId::Dcu)
            );
            report("emergency stop", &outcome);
            report("lcu idle", &lcu);
            report("dcu idle", &dcu);
            Ok(())
        }
    }
}

async fn watch(
    config: &HmiConfig,
    address: &rig_hmi::BackendAddress,
    backend: Arc<dyn Backend>,
    seconds: Option<u64>,
) -> Result<()> {
    let transport = TransportManager::from_config(config, address, backend)?;
    let aggregator = DeviceStatusAggregator::attach(&transport);

    transport.on_status_change(|status| println!("📡 Connection: {}", status.label()));
    let view = Arc::clone(&aggregator);
    transport.on(EventKind::DeviceStatusUpdate, move |_| {
        let agg = view.read();
        let now = chrono::Utc::now();
        let devices: Vec<String> = agg
            .records()
            .iter()
            .map(|r| {
                format!(
                    "{}={} ({})",
                    r.device,
                    r.status,
                    agg.last_seen_text(r.device, now)
                )
            })
            .collect();
        println!("📊 {} | {}", agg.overall_summary(), devices.join(", "));
    });

    transport.connect();
    println!("Press Ctrl+C to stop");

    let deadline = async {
        match seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        () = deadline => {}
    }

    transport.disconnect();
    println!("\n👋 Disconnected");
    Ok(())
}

fn report(action: &str, outcome: &DispatchOutcome) {
    match (&outcome.success, &outcome.message) {
        (true, Some(message)) => println!("✅ {action}: {message}"),
        (true, None) => println!("✅ {action}"),
        (false, Some(message)) => eprintln!("❌ {action}: {message}"),
        (false, None) => eprintln!("❌ {action}"),
    }
}
