//! Instrument transport and device-protocol layer for laboratory test equipment.
//!
//! This library turns logical instrument commands into bytes on a wire. It covers signal
//! generators and other SCPI instruments behind GPIB-Ethernet/USB bridges, turbo-pump
//! controllers on an RS-485 line, a Modbus chopper motor and a cryogenic bias block.
//!
//! - [`adapters`]: connections, the GPIB bridge, the closed adapter set and the registry
//! - [`scpi`]: SCPI command facade with settle delays
//! - [`turbo`]: checksummed framed ASCII protocol and typed payload codec
//! - [`motion`]: register-level motor control and bias-voltage convergence
//! - [`config`], [`logging`], [`error`], [`error_recovery`]: the ambient stack

pub mod adapters;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod logging;
pub mod motion;
pub mod scpi;
pub mod turbo;

pub use error::{AppResult, FailureCategory, InstrumentError};
