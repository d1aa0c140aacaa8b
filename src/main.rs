//! # labctl
//!
//! Command-line front end for the instrument layer.
//!
//! ```bash
//! labctl list
//! labctl scpi sg1 query "*IDN?"
//! labctl pump tc110 status
//! labctl chopper chopper rotate 90
//! labctl bias sis set 4 0.005 --tolerance 0.001
//! ```
//!
//! Ctrl-C cancels the long-running loops (`chopper stop`, `bias set`); the device is left in
//! its safe state before the process exits.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use labctl::adapters::ConnectionRegistry;
use labctl::config::{InstrumentDefinition, InstrumentKind, LabConfig, DEFAULT_CONFIG_PATH};
use labctl::motion::{BiasBlock, ChopperMotor};
use labctl::scpi::ScpiInstrument;
use labctl::turbo::TurboPump;
use labctl::{logging, FailureCategory, InstrumentError};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "labctl")]
#[command(about = "Operate laboratory instruments from the command line", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List configured instruments
    List,

    /// Talk to a SCPI instrument
    Scpi {
        id: String,
        #[command(subcommand)]
        action: ScpiAction,
    },

    /// Operate a turbo-pump controller
    Pump {
        id: String,
        #[command(subcommand)]
        action: PumpAction,
    },

    /// Operate the chopper motor
    Chopper {
        id: String,
        #[command(subcommand)]
        action: ChopperAction,
    },

    /// Operate a bias block
    Bias {
        id: String,
        #[command(subcommand)]
        action: BiasAction,
    },
}

#[derive(Subcommand, Debug)]
enum ScpiAction {
    /// Send a command
    Write { command: String },
    /// Send a command and print the answer
    Query {
        command: String,
        /// Settle delay for this query, in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum PumpAction {
    /// Print speed, power, temperature and error state
    Status,
    /// Start the pumping station
    On,
    /// Stop the pumping station
    Off,
    /// Flip the pumping station state
    Toggle,
    /// Acknowledge a pending error
    Ack,
}

#[derive(Subcommand, Debug)]
enum ChopperAction {
    /// Print the absolute position in pulses
    Position,
    /// Rotate by an angle in degrees
    Rotate {
        #[arg(allow_hyphen_values = true)]
        degrees: f64,
    },
    /// Spin continuously at a frequency in Hz
    Spin { hz: f64 },
    /// Brake to a stop and align to the grid
    Stop,
    /// Move to the nearest grid position
    Align,
}

#[derive(Subcommand, Debug)]
enum BiasAction {
    /// Converge the junction voltage to a target
    Set {
        device: u8,
        #[arg(allow_hyphen_values = true)]
        volts: f64,
        /// Relative tolerance
        #[arg(long, default_value_t = 0.001)]
        tolerance: f64,
        #[arg(long, default_value_t = 10)]
        max_iterations: u32,
    },
    /// Print the measured voltage and current
    Read { device: u8 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = LabConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.application.log_level);
    logging::init(level);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    let registry = ConnectionRegistry::new();
    let outcome = run(cli.command, &config, &registry, &cancel).await;
    registry.close_all().await;

    if let Err(err) = &outcome {
        if let Some(instrument_err) = err.downcast_ref::<InstrumentError>() {
            eprintln!("{}", operator_hint(instrument_err.category()));
        }
    }
    outcome
}

async fn run(
    command: Commands,
    config: &LabConfig,
    registry: &ConnectionRegistry,
    cancel: &CancellationToken,
) -> Result<()> {
    match command {
        Commands::List => {
            for def in &config.instruments {
                let state = if def.enabled { "" } else { " (disabled)" };
                println!("{:<16} {:?}{}", def.id, def.kind, state);
            }
            Ok(())
        }
        Commands::Scpi { id, action } => {
            let def = lookup(config, &id, InstrumentKind::Scpi)?;
            let mut sg = ScpiInstrument::connect(registry, def).await?;
            let result = match action {
                ScpiAction::Write { command } => sg.write(&command).await,
                ScpiAction::Query { command, delay_ms } => sg
                    .query(&command, delay_ms.map(std::time::Duration::from_millis))
                    .await
                    .map(|reply| println!("{}", reply)),
            };
            sg.close().await?;
            Ok(result?)
        }
        Commands::Pump { id, action } => {
            let def = lookup(config, &id, InstrumentKind::TurboPump)?;
            let mut pump = TurboPump::connect(registry, def).await?;
            let result = pump_action(&pump, action).await;
            pump.close().await;
            result
        }
        Commands::Chopper { id, action } => {
            let def = lookup(config, &id, InstrumentKind::Chopper)?;
            let mut motor = ChopperMotor::connect(registry, def).await?;
            let result = match action {
                ChopperAction::Position => motor
                    .get_actual_position()
                    .await
                    .map(|pos| println!("{}", pos)),
                ChopperAction::Rotate { degrees } => motor
                    .rotate_relative(degrees)
                    .await
                    .map(|pulses| println!("moved {} pulses", pulses)),
                ChopperAction::Spin { hz } => motor.start_constant_speed(hz).await,
                ChopperAction::Stop => motor
                    .stop_constant_speed(cancel)
                    .await
                    .map(|ticks| println!("stopped after {} braking steps", ticks)),
                ChopperAction::Align => motor
                    .align()
                    .await
                    .map(|target| println!("aligned at {}", target)),
            };
            motor.close().await;
            Ok(result?)
        }
        Commands::Bias { id, action } => {
            let def = lookup(config, &id, InstrumentKind::BiasBlock)?;
            let mut block = BiasBlock::connect(registry, def).await?;
            let result = match action {
                BiasAction::Set {
                    device,
                    volts,
                    tolerance,
                    max_iterations,
                } => block
                    .set_bias_voltage_iterative(device, volts, tolerance, max_iterations, cancel)
                    .await
                    .map(|real| println!("{:.6} V", real)),
                BiasAction::Read { device } => {
                    let volts = block.try_voltage(device).await;
                    let amps = block.try_current(device).await;
                    volts.and_then(|v| amps.map(|a| println!("{:.6} V  {:.9} A", v, a)))
                }
            };
            block.close().await;
            Ok(result?)
        }
    }
}

async fn pump_action(pump: &TurboPump, action: PumpAction) -> Result<()> {
    let report = |what: &str, ok: bool| {
        if ok {
            info!("{} done", what);
            Ok(())
        } else {
            Err(anyhow::anyhow!("{} failed; see log for the cause", what))
        }
    };
    match action {
        PumpAction::Status => {
            let text = |v: Option<String>| v.unwrap_or_else(|| "?".to_string());
            let num = |v: Option<u64>| v.map_or_else(|| "?".to_string(), |n| n.to_string());
            let pumping = match pump.is_pumping().await {
                Some(true) => "on",
                Some(false) => "off",
                None => "?",
            };
            println!("pumping      {}", pumping);
            println!("speed        {} Hz", num(pump.actual_speed_hz().await));
            println!("drive power  {} W", num(pump.drive_power_w().await));
            println!("temperature  {} C", num(pump.pump_temperature_c().await));
            println!("error        {}", text(pump.error_code().await));
            Ok(())
        }
        PumpAction::On => report("pump on", pump.set_pumping(true).await.is_some()),
        PumpAction::Off => report("pump off", pump.set_pumping(false).await.is_some()),
        PumpAction::Toggle => report("toggle", pump.toggle_pumping().await.is_some()),
        PumpAction::Ack => report("error acknowledge", pump.acknowledge_error().await.is_some()),
    }
}

fn lookup<'a>(
    config: &'a LabConfig,
    id: &str,
    kind: InstrumentKind,
) -> Result<&'a InstrumentDefinition> {
    let def = config.instrument(id)?;
    if def.kind != kind {
        bail!("'{}' is a {:?}, not a {:?}", id, def.kind, kind);
    }
    Ok(def)
}

fn operator_hint(category: FailureCategory) -> &'static str {
    match category {
        FailureCategory::Unreachable => {
            "hint: instrument unreachable; check cabling, power and address"
        }
        FailureCategory::Rejected => "hint: instrument answered but rejected the request",
        FailureCategory::NotConverged => {
            "hint: target not reached; widen the tolerance or allow more iterations"
        }
        FailureCategory::Cancelled => "hint: cancelled by operator",
        FailureCategory::Setup => "hint: fix the configuration file",
    }
}
