//! Framed ASCII protocol for turbo-pump controllers.
//!
//! - [`frame`]: telegram layout and checksum
//! - [`codec`]: fixed-width payload types
//! - [`parameters`]: the controller's parameter table
//! - [`pump`]: the per-controller driver

pub mod codec;
pub mod frame;
pub mod parameters;
pub mod pump;

pub use codec::{DataType, Value};
pub use frame::{Action, Frame};
pub use parameters::{Access, Parameter};
pub use pump::TurboPump;
