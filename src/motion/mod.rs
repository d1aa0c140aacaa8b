//! Motion and bias control.
//!
//! - [`modbus`]: register protocol (Modbus TCP and RTU framing)
//! - [`chopper`]: chopper/stepper motor state machine over a [`RegisterBus`]
//! - [`bias`]: SIS bias block with closed-loop voltage convergence
//! - [`mock`]: simulated drive and bias block

pub mod bias;
pub mod chopper;
pub mod mock;
pub mod modbus;

pub use bias::{BiasBlock, Convergence, ConvergenceStep};
pub use chopper::{ChopperMotor, MotionProfile, MotorState, RegisterMap};
pub use mock::{MockBiasBlock, MockDrive};
pub use modbus::{Framing, ModbusClient, RegisterBus};
