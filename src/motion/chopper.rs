//! Chopper/stepper motor on a Modbus motion drive.
//!
//! Positions are signed pulse counts on a 10,000 pulse/rev encoder. Relative moves keep the
//! rotor on a 2,500-pulse (90°) grid: if the rotor drifted more than 50 pulses off the grid,
//! it is re-aligned before the move.
//!
//! State machine:
//!
//! ```text
//! Idle/Aligned ──rotate_relative──▶ MovingRelative
//! Idle/Aligned ──start_constant_speed──▶ MovingConstantSpeed
//! MovingConstantSpeed ──stop_constant_speed──▶ Decelerating ──▶ Aligned
//! any ──align──▶ Aligned      any ──emergency_stop / cancel──▶ Idle
//! ```

use super::modbus::{join_i32, split_i32, ModbusClient, RegisterBus};
use crate::adapters::{ConnectionRegistry, Lease};
use crate::config::{ChopperConfig, InstrumentDefinition};
use crate::error::{AppResult, InstrumentError};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Encoder pulses per revolution.
pub const PULSES_PER_REV: i32 = 10_000;
/// Alignment grid spacing (90°).
pub const GRID_PULSES: i32 = 2_500;
/// Allowed distance from the grid before a move triggers re-alignment.
pub const GRID_TOLERANCE: i32 = 50;
/// Estimated speed below which a decelerating rotor counts as stopped, rev/s.
pub const STOP_THRESHOLD_RPS: f64 = 0.1;
/// Window between the two position samples of a speed estimate.
pub const SPEED_SAMPLE_WINDOW: Duration = Duration::from_millis(100);

/// Relative-position mode word.
pub const MODE_RELATIVE: u16 = 0b0100_0001;
/// Absolute-position mode word.
pub const MODE_ABSOLUTE: u16 = 0b0000_0001;
/// Velocity mode word.
pub const MODE_VELOCITY: u16 = 0b0000_0010;

/// Pulses for a rotation of `angle_deg` degrees, rounded half to even.
pub fn pulses_for(angle_deg: f64) -> i32 {
    (angle_deg / 360.0 * f64::from(PULSES_PER_REV)).round_ties_even() as i32
}

/// Nearest multiple of the alignment grid, rounded half to even.
pub fn nearest_grid(position: i32) -> i32 {
    (f64::from(position) / f64::from(GRID_PULSES)).round_ties_even() as i32 * GRID_PULSES
}

/// Whether `position` is within tolerance of the grid.
pub fn is_on_grid(position: i32) -> bool {
    (position - nearest_grid(position)).abs() <= GRID_TOLERANCE
}

/// Motor controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorState {
    /// Stopped, position unknown relative to the grid
    Idle,
    /// Relative move triggered
    MovingRelative,
    /// Spinning in velocity mode
    MovingConstantSpeed,
    /// Braking towards standstill
    Decelerating,
    /// Stopped on the grid
    Aligned,
}

/// Drive register addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    /// Motion mode word
    pub mode: u16,
    /// Target position or delta, high word
    pub position_high: u16,
    /// Target position or delta, low word
    pub position_low: u16,
    /// Speed, rpm
    pub speed: u16,
    /// Acceleration ramp
    pub acceleration: u16,
    /// Deceleration ramp
    pub deceleration: u16,
    /// Control word that starts or stops motion
    pub trigger: u16,
    /// Value written to `trigger` to start the programmed motion
    pub trigger_value: u16,
    /// Value written to `trigger` to stop immediately
    pub emergency_stop_value: u16,
    /// First of the two actual-position registers (high word)
    pub actual_position: u16,
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self {
            mode: 0x6200,
            position_high: 0x6201,
            position_low: 0x6202,
            speed: 0x6203,
            acceleration: 0x6204,
            deceleration: 0x6205,
            trigger: 0x6002,
            trigger_value: 0x10,
            emergency_stop_value: 0x40,
            actual_position: 0x602A,
        }
    }
}

/// Speeds, ramps and timing used for every move.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionProfile {
    /// Positioning speed, rpm
    pub speed_rpm: u16,
    /// Acceleration ramp, drive units
    pub acceleration: u16,
    /// Deceleration ramp, drive units
    pub deceleration: u16,
    /// Wait after triggering an absolute move
    pub settle: Duration,
    /// Speed of braking moves, rpm
    pub brake_speed_rpm: u16,
    /// Length of each braking move, pulses
    pub brake_step_pulses: u16,
}

impl Default for MotionProfile {
    fn default() -> Self {
        Self::from(&ChopperConfig::default())
    }
}

impl From<&ChopperConfig> for MotionProfile {
    fn from(config: &ChopperConfig) -> Self {
        Self {
            speed_rpm: config.speed_rpm,
            acceleration: config.acceleration,
            deceleration: config.deceleration,
            settle: Duration::from_millis(config.settle_ms),
            brake_speed_rpm: config.brake_speed_rpm,
            brake_step_pulses: config.brake_step_pulses,
        }
    }
}

/// Outcome of one deceleration tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecelerationStep {
    /// Still turning at the given speed, brake again
    Braking(f64),
    /// Below the stop threshold
    Stopped(f64),
}

/// Caller-driven deceleration loop state.
///
/// Each tick the caller issues a braking move, measures the speed and feeds it to
/// [`observe`](Self::observe). There is no iteration bound; callers stop it by cancellation.
#[derive(Debug, Clone)]
pub struct Deceleration {
    threshold_rps: f64,
    ticks: u32,
    last_speed: Option<f64>,
}

impl Deceleration {
    /// Start a deceleration that finishes once `|speed| < threshold_rps`.
    pub fn new(threshold_rps: f64) -> Self {
        Self {
            threshold_rps,
            ticks: 0,
            last_speed: None,
        }
    }

    /// Record a speed estimate.
    pub fn observe(&mut self, speed_rps: f64) -> DecelerationStep {
        self.ticks += 1;
        self.last_speed = Some(speed_rps);
        if speed_rps.abs() < self.threshold_rps {
            DecelerationStep::Stopped(speed_rps)
        } else {
            DecelerationStep::Braking(speed_rps)
        }
    }

    /// Ticks observed so far.
    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    /// Most recent speed estimate.
    pub fn last_speed(&self) -> Option<f64> {
        self.last_speed
    }
}

/// A chopper wheel driven through holding registers.
pub struct ChopperMotor<B: RegisterBus> {
    bus: B,
    map: RegisterMap,
    profile: MotionProfile,
    state: MotorState,
    lease: Option<(ConnectionRegistry, Lease)>,
}

impl<B: RegisterBus> ChopperMotor<B> {
    /// Wrap a register bus with the default register map.
    pub fn new(bus: B, profile: MotionProfile) -> Self {
        Self::with_register_map(bus, profile, RegisterMap::default())
    }

    /// Wrap a register bus with a custom register map.
    pub fn with_register_map(bus: B, profile: MotionProfile, map: RegisterMap) -> Self {
        Self {
            bus,
            map,
            profile,
            state: MotorState::Idle,
            lease: None,
        }
    }

    /// Current controller state.
    pub fn state(&self) -> MotorState {
        self.state
    }

    /// The motion profile in use.
    pub fn profile(&self) -> &MotionProfile {
        &self.profile
    }

    /// The underlying register bus.
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Absolute encoder position, pulses.
    pub async fn get_actual_position(&mut self) -> AppResult<i32> {
        let regs = self
            .bus
            .read_holding_registers(self.map.actual_position, 2)
            .await?;
        match regs.as_slice() {
            [high, low] => Ok(join_i32(*high, *low)),
            _ => Err(InstrumentError::Protocol(format!(
                "expected 2 position registers, got {}",
                regs.len()
            ))),
        }
    }

    /// Speed estimate from two positions sampled 100 ms apart, rev/s.
    pub async fn get_actual_speed(&mut self) -> AppResult<f64> {
        self.sample_speed(None).await
    }

    /// Two position reads around the sampling window. Only the wait between them is
    /// cancellable, so no bus transaction is ever abandoned half way.
    async fn sample_speed(&mut self, cancel: Option<&CancellationToken>) -> AppResult<f64> {
        let first = self.get_actual_position().await?;
        let start = Instant::now();
        match cancel {
            Some(cancel) => tokio::select! {
                _ = cancel.cancelled() => return Err(InstrumentError::Cancelled),
                _ = sleep(SPEED_SAMPLE_WINDOW) => {}
            },
            None => sleep(SPEED_SAMPLE_WINDOW).await,
        }
        let second = self.get_actual_position().await?;
        let elapsed = start.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return Err(InstrumentError::InvalidState("no time elapsed between samples".into()));
        }
        // The encoder counter wraps; the two's-complement difference is the displacement.
        Ok(f64::from(second.wrapping_sub(first)) / (f64::from(PULSES_PER_REV) * elapsed))
    }

    async fn write_ramps(&mut self, speed_rpm: u16) -> AppResult<()> {
        self.bus.write_register(self.map.speed, speed_rpm).await?;
        self.bus
            .write_register(self.map.acceleration, self.profile.acceleration)
            .await?;
        self.bus
            .write_register(self.map.deceleration, self.profile.deceleration)
            .await
    }

    async fn trigger(&mut self) -> AppResult<()> {
        self.bus
            .write_register(self.map.trigger, self.map.trigger_value)
            .await
    }

    async fn write_relative_delta(&mut self, pulses: i32) -> AppResult<()> {
        let [high, low] = split_i32(pulses);
        self.bus.write_register(self.map.position_high, high).await?;
        self.bus.write_register(self.map.position_low, low).await
    }

    /// Rotate by `angle_deg`, re-aligning first if the rotor is off the grid.
    ///
    /// Returns the pulse delta that was commanded.
    pub async fn rotate_relative(&mut self, angle_deg: f64) -> AppResult<i32> {
        let pulses = pulses_for(angle_deg);
        let position = self.get_actual_position().await?;
        if !is_on_grid(position) {
            info!(position, "Rotor off grid, aligning before relative move");
            self.align().await?;
        }

        self.bus.write_register(self.map.mode, MODE_RELATIVE).await?;
        self.write_relative_delta(pulses).await?;
        self.write_ramps(self.profile.speed_rpm).await?;
        self.trigger().await?;
        self.state = MotorState::MovingRelative;
        debug!(angle_deg, pulses, "Relative move triggered");
        Ok(pulses)
    }

    /// Spin continuously at `frequency_hz` revolutions per second.
    pub async fn start_constant_speed(&mut self, frequency_hz: f64) -> AppResult<()> {
        if self.state == MotorState::Decelerating {
            return Err(InstrumentError::InvalidState(
                "cannot start spinning while decelerating".into(),
            ));
        }
        let rpm = (frequency_hz * 60.0).round();
        if !(0.0..=f64::from(u16::MAX)).contains(&rpm) {
            return Err(InstrumentError::OutOfRange(format!(
                "{} Hz is not a valid drive speed",
                frequency_hz
            )));
        }

        self.bus.write_register(self.map.mode, MODE_VELOCITY).await?;
        self.write_ramps(rpm as u16).await?;
        self.trigger().await?;
        self.state = MotorState::MovingConstantSpeed;
        info!(frequency_hz, rpm, "Constant speed started");
        Ok(())
    }

    async fn brake_tick(&mut self, cancel: &CancellationToken) -> AppResult<f64> {
        self.bus.write_register(self.map.mode, MODE_RELATIVE).await?;
        self.write_relative_delta(i32::from(self.profile.brake_step_pulses))
            .await?;
        self.bus
            .write_register(self.map.speed, self.profile.brake_speed_rpm)
            .await?;
        self.trigger().await?;
        self.sample_speed(Some(cancel)).await
    }

    /// Stop immediately.
    pub async fn emergency_stop(&mut self) -> AppResult<()> {
        self.bus
            .write_register(self.map.trigger, self.map.emergency_stop_value)
            .await?;
        self.state = MotorState::Idle;
        warn!("Emergency stop issued");
        Ok(())
    }

    /// Brake until the rotor is nearly stopped, then stop it and align it to the grid.
    ///
    /// Checks `cancel` before every tick and during each speed sampling window, never while
    /// a register transaction is on the wire. On cancellation or error the drive still gets
    /// an emergency stop and the motor ends `Idle`.
    pub async fn stop_constant_speed(&mut self, cancel: &CancellationToken) -> AppResult<u32> {
        self.state = MotorState::Decelerating;
        let mut decel = Deceleration::new(STOP_THRESHOLD_RPS);

        let outcome = loop {
            if cancel.is_cancelled() {
                break Err(InstrumentError::Cancelled);
            }
            match self.brake_tick(cancel).await {
                Ok(speed) => match decel.observe(speed) {
                    DecelerationStep::Stopped(speed) => {
                        debug!(speed, ticks = decel.ticks(), "Rotor below stop threshold");
                        break Ok(());
                    }
                    DecelerationStep::Braking(speed) => {
                        debug!(speed, tick = decel.ticks(), "Braking");
                    }
                },
                Err(err) => break Err(err),
            }
        };

        if let Err(err) = outcome {
            if let Err(stop_err) = self.emergency_stop().await {
                warn!(error = %stop_err, "Emergency stop after failed deceleration also failed");
            }
            return Err(err);
        }

        self.emergency_stop().await?;
        self.align().await?;
        info!(ticks = decel.ticks(), "Stopped and aligned");
        Ok(decel.ticks())
    }

    /// Move to the nearest grid position; returns the target.
    pub async fn align(&mut self) -> AppResult<i32> {
        let position = self.get_actual_position().await?;
        let target = nearest_grid(position);
        debug!(position, target, "Aligning");
        self.go_to_pos(target).await?;
        self.state = MotorState::Aligned;
        Ok(target)
    }

    /// Absolute move to `pulses`, then wait the settle time.
    pub async fn go_to_pos(&mut self, pulses: i32) -> AppResult<()> {
        self.bus
            .write_registers(self.map.position_high, &split_i32(pulses))
            .await?;
        self.bus.write_register(self.map.mode, MODE_ABSOLUTE).await?;
        self.write_ramps(self.profile.speed_rpm).await?;
        self.trigger().await?;
        sleep(self.profile.settle).await;
        Ok(())
    }

    /// Hand the connection back to the registry, if it came from one.
    pub async fn close(&mut self) {
        if let Some((registry, lease)) = self.lease.take() {
            registry.release(lease).await;
        }
    }
}

impl ChopperMotor<ModbusClient> {
    /// Claim the drive's endpoint from `registry` and build a Modbus client for it.
    pub async fn connect(
        registry: &ConnectionRegistry,
        def: &InstrumentDefinition,
    ) -> AppResult<Self> {
        let options = def.chopper.clone().unwrap_or_default();
        let lease = registry.acquire(&def.transport, &def.id).await?;
        let client = ModbusClient::new(lease.connection()?, options.unit_id, options.framing);
        let mut motor = Self::new(client, MotionProfile::from(&options));
        motor.lease = Some((registry.clone(), lease));
        Ok(motor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pulses_for() {
        assert_eq!(pulses_for(360.0), 10_000);
        assert_eq!(pulses_for(90.0), 2_500);
        assert_eq!(pulses_for(1.0), 28);
        assert_eq!(pulses_for(-90.0), -2_500);
    }

    #[test]
    fn test_grid() {
        assert_eq!(nearest_grid(0), 0);
        assert_eq!(nearest_grid(2530), 2500);
        assert_eq!(nearest_grid(3749), 2500);
        assert_eq!(nearest_grid(3751), 5000);
        assert_eq!(nearest_grid(-2560), -2500);
        // Exactly halfway rounds to the even multiple.
        assert_eq!(nearest_grid(1250), 0);
        assert_eq!(nearest_grid(3750), 5000);

        assert!(is_on_grid(2530));
        assert!(is_on_grid(2450));
        assert!(!is_on_grid(2560));
    }

    #[test]
    fn test_deceleration_state_machine() {
        let mut decel = Deceleration::new(STOP_THRESHOLD_RPS);
        assert_eq!(decel.observe(5.0), DecelerationStep::Braking(5.0));
        assert_eq!(decel.observe(-0.3), DecelerationStep::Braking(-0.3));
        assert_eq!(decel.observe(0.05), DecelerationStep::Stopped(0.05));
        assert_eq!(decel.ticks(), 3);
        assert_eq!(decel.last_speed(), Some(0.05));
    }

    #[test]
    fn test_reverse_spin_is_braked_not_stopped() {
        let mut decel = Deceleration::new(STOP_THRESHOLD_RPS);
        assert_eq!(decel.observe(-8.0), DecelerationStep::Braking(-8.0));
        assert_eq!(decel.observe(-0.05), DecelerationStep::Stopped(-0.05));
    }
}
