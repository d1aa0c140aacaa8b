//! Configuration loading using Figment
//!
//! Configuration is loaded from:
//! 1. A TOML file (by default `config/labctl.toml`)
//! 2. Environment variables prefixed with `LABCTL_` (nested keys split on `__`)
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "Cryostat bench"
//! log_level = "info"
//!
//! [[instruments]]
//! id = "vna"
//! type = "scpi"
//! [instruments.transport]
//! kind = "gpib_bridge"
//! host = "192.168.1.50"
//! address = 16
//! timeout_ms = 2000
//! [instruments.scpi]
//! settle_delay_ms = 50
//! ```

use crate::adapters::gpib_bridge::GpibAddress;
use crate::adapters::Endpoint;
use crate::error::{AppResult, InstrumentError};
use crate::motion::modbus::Framing;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default location of the configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/labctl.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// The kind of driver an instrument definition instantiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    /// Generic SCPI instrument behind the command facade
    Scpi,
    /// Framed ASCII turbo-pump controller
    TurboPump,
    /// Modbus chopper/stepper drive
    Chopper,
    /// SIS-mixer bias block
    BiasBlock,
}

/// Instrument definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Unique instrument identifier
    pub id: String,
    /// Driver kind
    #[serde(rename = "type")]
    pub kind: InstrumentKind,
    /// Whether this instrument is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// How to reach the instrument
    pub transport: TransportConfig,
    /// SCPI facade options
    #[serde(default)]
    pub scpi: Option<ScpiConfig>,
    /// Turbo-pump protocol options
    #[serde(default)]
    pub turbo_pump: Option<TurboPumpConfig>,
    /// Chopper drive options
    #[serde(default)]
    pub chopper: Option<ChopperConfig>,
    /// Bias block options
    #[serde(default)]
    pub bias_block: Option<BiasBlockConfig>,
}

/// Physical channel used to reach an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Direct TCP socket
    Socket {
        host: String,
        port: u16,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    /// Direct serial line (8N1, no flow control)
    Serial {
        path: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    /// GPIB device behind an Ethernet or USB bridge
    GpibBridge {
        /// Bridge host for Ethernet bridges
        #[serde(default)]
        host: Option<String>,
        #[serde(default = "default_bridge_port")]
        port: u16,
        /// Serial device for USB bridges
        #[serde(default)]
        serial_path: Option<String>,
        #[serde(default = "default_bridge_baud_rate")]
        baud_rate: u32,
        /// Bus address of the target device (1-31)
        address: u8,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
}

impl TransportConfig {
    /// Read timeout for the underlying connection.
    pub fn timeout(&self) -> Duration {
        match self {
            TransportConfig::Socket { timeout_ms, .. }
            | TransportConfig::Serial { timeout_ms, .. }
            | TransportConfig::GpibBridge { timeout_ms, .. } => Duration::from_millis(*timeout_ms),
        }
    }

    /// The physical endpoint this transport opens. Bridge devices resolve to the bridge.
    pub fn endpoint(&self) -> AppResult<Endpoint> {
        match self {
            TransportConfig::Socket { host, port, .. } => Ok(Endpoint::Tcp {
                host: host.clone(),
                port: *port,
            }),
            TransportConfig::Serial { path, .. } => Ok(Endpoint::Serial { path: path.clone() }),
            TransportConfig::GpibBridge {
                host,
                port,
                serial_path,
                ..
            } => match (host, serial_path) {
                (Some(host), None) => Ok(Endpoint::Tcp {
                    host: host.clone(),
                    port: *port,
                }),
                (None, Some(path)) => Ok(Endpoint::Serial { path: path.clone() }),
                _ => Err(InstrumentError::Configuration(
                    "gpib_bridge transport needs exactly one of 'host' or 'serial_path'".into(),
                )),
            },
        }
    }

    /// Baud rate if the endpoint is a serial line.
    pub fn baud_rate(&self) -> Option<u32> {
        match self {
            TransportConfig::Serial { baud_rate, .. } => Some(*baud_rate),
            TransportConfig::GpibBridge {
                serial_path: Some(_),
                baud_rate,
                ..
            } => Some(*baud_rate),
            _ => None,
        }
    }

    /// Bus address for bridge transports.
    pub fn gpib_address(&self) -> AppResult<Option<GpibAddress>> {
        match self {
            TransportConfig::GpibBridge { address, .. } => GpibAddress::new(*address).map(Some),
            _ => Ok(None),
        }
    }

    fn validate(&self, id: &str) -> Result<(), InstrumentError> {
        let invalid = |what: &str| {
            Err(InstrumentError::Configuration(format!(
                "Instrument '{}': {}",
                id, what
            )))
        };
        match self {
            TransportConfig::Socket { host, .. } if host.is_empty() => {
                return invalid("'host' cannot be empty")
            }
            TransportConfig::Serial { path, .. } if path.is_empty() => {
                return invalid("'path' cannot be empty")
            }
            _ => {}
        }
        if let Err(err) = self.endpoint() {
            return invalid(&err.to_string());
        }
        if let Err(err) = self.gpib_address() {
            return invalid(&err.to_string());
        }
        if self.timeout().is_zero() {
            return invalid("'timeout_ms' must be > 0");
        }
        Ok(())
    }
}

/// SCPI facade configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScpiConfig {
    /// Delay after every write, in milliseconds
    #[serde(default)]
    pub settle_delay_ms: u64,
    /// Maximum bytes read per response
    #[serde(default = "default_scpi_buffer")]
    pub buffer_size: usize,
}

impl Default for ScpiConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 0,
            buffer_size: default_scpi_buffer(),
        }
    }
}

/// Turbo-pump controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurboPumpConfig {
    /// Bus address of the controller (1-255)
    pub device_id: u16,
}

/// Chopper drive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChopperConfig {
    /// Modbus unit identifier
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// Modbus framing on the wire
    #[serde(default)]
    pub framing: Framing,
    /// Positioning speed in rpm
    #[serde(default = "default_speed_rpm")]
    pub speed_rpm: u16,
    /// Acceleration register value
    #[serde(default = "default_ramp")]
    pub acceleration: u16,
    /// Deceleration register value
    #[serde(default = "default_ramp")]
    pub deceleration: u16,
    /// Wait after triggering an absolute move, in milliseconds
    #[serde(default = "default_motor_settle_ms")]
    pub settle_ms: u64,
    /// Speed of the braking moves issued while stopping, in rpm
    #[serde(default = "default_brake_speed_rpm")]
    pub brake_speed_rpm: u16,
    /// Length of each braking move, in pulses
    #[serde(default = "default_brake_step_pulses")]
    pub brake_step_pulses: u16,
}

impl Default for ChopperConfig {
    fn default() -> Self {
        Self {
            unit_id: default_unit_id(),
            framing: Framing::default(),
            speed_rpm: default_speed_rpm(),
            acceleration: default_ramp(),
            deceleration: default_ramp(),
            settle_ms: default_motor_settle_ms(),
            brake_speed_rpm: default_brake_speed_rpm(),
            brake_step_pulses: default_brake_step_pulses(),
        }
    }
}

/// Bias block configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiasBlockConfig {
    /// Attempts per transaction before giving up
    #[serde(default = "default_bias_attempts")]
    pub max_attempts: u32,
    /// Pause between attempts, in milliseconds
    #[serde(default = "default_bias_backoff_ms")]
    pub backoff_ms: u64,
    /// Wait between writing a setpoint and reading it back, in milliseconds
    #[serde(default = "default_bias_settle_ms")]
    pub settle_ms: u64,
    /// Maximum bytes read per response
    #[serde(default = "default_bias_buffer")]
    pub buffer_size: usize,
}

impl Default for BiasBlockConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_bias_attempts(),
            backoff_ms: default_bias_backoff_ms(),
            settle_ms: default_bias_settle_ms(),
            buffer_size: default_bias_buffer(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_bridge_port() -> u16 {
    1234
}

fn default_bridge_baud_rate() -> u32 {
    115200
}

fn default_scpi_buffer() -> usize {
    4096
}

fn default_unit_id() -> u8 {
    1
}

fn default_speed_rpm() -> u16 {
    300
}

fn default_ramp() -> u16 {
    100
}

fn default_motor_settle_ms() -> u64 {
    1000
}

fn default_brake_speed_rpm() -> u16 {
    5
}

fn default_brake_step_pulses() -> u16 {
    50
}

fn default_bias_attempts() -> u32 {
    3
}

fn default_bias_backoff_ms() -> u64 {
    100
}

fn default_bias_settle_ms() -> u64 {
    300
}

fn default_bias_buffer() -> usize {
    1024
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl LabConfig {
    /// Load configuration from the default path and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables with the `LABCTL_` prefix take precedence over the file.
    /// The merged configuration is validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LABCTL_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Instrument IDs are unique
    /// - Each instrument has a usable transport; turbo pumps also need their options block
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(InstrumentError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            if !ids.insert(&instrument.id) {
                return Err(InstrumentError::Configuration(format!(
                    "Duplicate instrument ID: '{}'",
                    instrument.id
                )));
            }
            instrument.transport.validate(&instrument.id)?;
            self.validate_instrument(instrument)?;
        }

        Ok(())
    }

    fn validate_instrument(&self, instrument: &InstrumentDefinition) -> AppResult<()> {
        let missing = |block: &str| {
            InstrumentError::Configuration(format!(
                "Instrument '{}' missing '{}' configuration block",
                instrument.id, block
            ))
        };
        match instrument.kind {
            InstrumentKind::Scpi => {}
            InstrumentKind::TurboPump => {
                let turbo = instrument
                    .turbo_pump
                    .as_ref()
                    .ok_or_else(|| missing("turbo_pump"))?;
                if !(1..=255).contains(&turbo.device_id) {
                    return Err(InstrumentError::Configuration(format!(
                        "Instrument '{}': 'device_id' must be 1-255, got {}",
                        instrument.id, turbo.device_id
                    )));
                }
            }
            InstrumentKind::Chopper => {
                if matches!(instrument.transport, TransportConfig::GpibBridge { .. }) {
                    return Err(InstrumentError::Configuration(format!(
                        "Chopper '{}' cannot be reached through a GPIB bridge",
                        instrument.id
                    )));
                }
            }
            InstrumentKind::BiasBlock => {
                if let Some(bias) = &instrument.bias_block {
                    if bias.max_attempts == 0 {
                        return Err(InstrumentError::Configuration(format!(
                            "Bias block '{}': 'max_attempts' must be > 0",
                            instrument.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Get all enabled instruments
    pub fn enabled_instruments(&self) -> Vec<&InstrumentDefinition> {
        self.instruments.iter().filter(|inst| inst.enabled).collect()
    }

    /// Look up an enabled instrument by id.
    pub fn instrument(&self, id: &str) -> AppResult<&InstrumentDefinition> {
        self.instruments
            .iter()
            .find(|inst| inst.id == id && inst.enabled)
            .ok_or_else(|| {
                InstrumentError::Configuration(format!("No enabled instrument with id '{}'", id))
            })
    }
}
