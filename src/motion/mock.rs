//! Simulated motion drive and bias block
//!
//! Provides simulated hardware for testing without a drive or a cryostat.
//! All timing uses tokio time, so tests can run with a paused clock.
//!
//! # Available Mocks
//!
//! - `MockDrive` - register-level Modbus drive with position integration
//! - `MockBiasBlock` - bias block answering the ASCII protocol, with gain error and noise
//!
//! # Drive model
//!
//! - velocity mode spins at the speed register value (rpm)
//! - relative and absolute moves travel at the speed register value and stop on target
//! - a relative command issued while spinning faster than its own speed halves the velocity
//! - the emergency-stop trigger value stops immediately

use super::chopper::{RegisterMap, MODE_ABSOLUTE, MODE_RELATIVE, MODE_VELOCITY, PULSES_PER_REV};
use super::modbus::{join_i32, split_i32, RegisterBus};
use crate::error::AppResult;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;

// =============================================================================
// MockDrive - Simulated Modbus motion drive
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Motion {
    Stopped,
    /// Pulses per second
    Velocity(f64),
    /// Travel to `target` at `speed` pulses per second
    Move { target: f64, speed: f64 },
}

#[derive(Debug)]
struct DriveState {
    registers: HashMap<u16, u16>,
    position: f64,
    motion: Motion,
    last_update: Instant,
    writes: Vec<(u16, u16)>,
}

impl DriveState {
    /// The 32-bit encoder counter, which wraps like the real register pair.
    fn counter(&self) -> i32 {
        (self.position.round() as i64) as i32
    }

    fn advance(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;

        match self.motion {
            Motion::Stopped => {}
            Motion::Velocity(pps) => self.position += pps * dt,
            Motion::Move { target, speed } => {
                let step = speed * dt;
                let remaining = target - self.position;
                if remaining.abs() <= step {
                    self.position = target;
                    self.motion = Motion::Stopped;
                } else {
                    self.position += step.copysign(remaining);
                }
            }
        }
    }

    fn register(&self, address: u16) -> u16 {
        self.registers.get(&address).copied().unwrap_or(0)
    }
}

fn rpm_to_pps(rpm: u16) -> f64 {
    f64::from(rpm) / 60.0 * f64::from(PULSES_PER_REV)
}

/// Simulated motion drive implementing [`RegisterBus`].
///
/// Clones share the same simulated hardware, so a test can keep a handle while the motor
/// driver owns another.
#[derive(Debug, Clone)]
pub struct MockDrive {
    state: Arc<Mutex<DriveState>>,
    map: RegisterMap,
}

impl Default for MockDrive {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDrive {
    /// Drive at rest at position 0 with the default register map.
    pub fn new() -> Self {
        Self::with_position(0)
    }

    /// Drive at rest at `position` pulses.
    pub fn with_position(position: i32) -> Self {
        Self {
            state: Arc::new(Mutex::new(DriveState {
                registers: HashMap::new(),
                position: f64::from(position),
                motion: Motion::Stopped,
                last_update: Instant::now(),
                writes: Vec::new(),
            })),
            map: RegisterMap::default(),
        }
    }

    /// Current position, pulses.
    pub async fn position(&self) -> i32 {
        let mut state = self.state.lock().await;
        state.advance();
        state.counter()
    }

    /// Current velocity, pulses per second (0 unless in velocity mode).
    pub async fn velocity_pps(&self) -> f64 {
        let mut state = self.state.lock().await;
        state.advance();
        match state.motion {
            Motion::Velocity(pps) => pps,
            _ => 0.0,
        }
    }

    /// Whether the rotor is at rest.
    pub async fn is_stopped(&self) -> bool {
        let mut state = self.state.lock().await;
        state.advance();
        state.motion == Motion::Stopped
    }

    /// Every register write so far, in order.
    pub async fn writes(&self) -> Vec<(u16, u16)> {
        self.state.lock().await.writes.clone()
    }

    /// Forget recorded writes.
    pub async fn clear_writes(&self) {
        self.state.lock().await.writes.clear();
    }

    fn store(&self, state: &mut DriveState, address: u16, value: u16) {
        state.writes.push((address, value));
        state.registers.insert(address, value);
        if address != self.map.trigger {
            return;
        }

        if value == self.map.emergency_stop_value {
            state.motion = Motion::Stopped;
            return;
        }
        if value != self.map.trigger_value {
            return;
        }

        let speed = rpm_to_pps(state.register(self.map.speed));
        let programmed = f64::from(join_i32(
            state.register(self.map.position_high),
            state.register(self.map.position_low),
        ));
        state.motion = match state.register(self.map.mode) {
            MODE_VELOCITY => Motion::Velocity(speed),
            MODE_RELATIVE => match state.motion {
                Motion::Velocity(pps) if pps.abs() > speed => Motion::Velocity(pps / 2.0),
                _ => Motion::Move {
                    target: state.position + programmed,
                    speed,
                },
            },
            MODE_ABSOLUTE => Motion::Move {
                target: programmed,
                speed,
            },
            _ => state.motion,
        };
    }
}

#[async_trait]
impl RegisterBus for MockDrive {
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> AppResult<Vec<u16>> {
        let mut state = self.state.lock().await;
        state.advance();
        let [high, low] = split_i32(state.counter());
        Ok((address..address.saturating_add(count))
            .map(|reg| {
                if reg == self.map.actual_position {
                    high
                } else if reg == self.map.actual_position + 1 {
                    low
                } else {
                    state.register(reg)
                }
            })
            .collect())
    }

    async fn write_register(&mut self, address: u16, value: u16) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.advance();
        self.store(&mut state, address, value);
        Ok(())
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.advance();
        for (offset, value) in values.iter().enumerate() {
            self.store(&mut state, address + offset as u16, *value);
        }
        Ok(())
    }
}

// =============================================================================
// MockBiasBlock - Simulated SIS bias block
// =============================================================================

/// Bias block answering `BIAS:DEV<n>:VOLT[ <v>]` and `BIAS:DEV<n>:CURR`.
///
/// The read-back voltage is `gain * setpoint + offset + noise`, with noise uniform in
/// `[-noise, noise]`. Current is the read-back voltage over a fixed junction resistance.
#[derive(Debug)]
pub struct MockBiasBlock {
    gain: f64,
    offset: f64,
    noise: f64,
    resistance_ohm: f64,
    setpoints: HashMap<u8, f64>,
    rng: StdRng,
}

impl Default for MockBiasBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBiasBlock {
    /// Ideal block: reads back exactly what was set.
    pub fn new() -> Self {
        Self {
            gain: 1.0,
            offset: 0.0,
            noise: 0.0,
            resistance_ohm: 20.0,
            setpoints: HashMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Scale the read-back by `gain`.
    pub fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    /// Add a constant `offset` volts to the read-back.
    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    /// Add uniform noise of at most `noise` volts, reproducible from `seed`.
    pub fn with_noise(mut self, noise: f64, seed: u64) -> Self {
        self.noise = noise.abs();
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn read_back(&mut self, device: u8) -> f64 {
        let set = self.setpoints.get(&device).copied().unwrap_or(0.0);
        let noise = if self.noise > 0.0 {
            self.rng.gen_range(-self.noise..=self.noise)
        } else {
            0.0
        };
        self.gain * set + self.offset + noise
    }

    /// Answer one request.
    pub fn respond(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let text = String::from_utf8_lossy(request);
        let reply = match parse_command(text.trim()) {
            Some((device, "VOLT", Some(value))) => {
                self.setpoints.insert(device, value);
                "OK".to_string()
            }
            Some((device, "VOLT", None)) => {
                format!("BIAS:DEV{}:VOLT {:.9}", device, self.read_back(device))
            }
            Some((device, "CURR", None)) => {
                let current = self.read_back(device) / self.resistance_ohm;
                format!("BIAS:DEV{}:CURR {:.9}", device, current)
            }
            _ => format!("ERROR: unknown command '{}'", text.trim()),
        };
        Some(reply.into_bytes())
    }

    /// Turn into a [`MockDevice`](crate::adapters::MockDevice) responder.
    pub fn into_responder(mut self) -> impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static {
        move |request| self.respond(request)
    }
}

fn parse_command(text: &str) -> Option<(u8, &str, Option<f64>)> {
    let (path, argument) = match text.split_once(' ') {
        Some((path, arg)) => (path, Some(arg.trim().parse::<f64>().ok()?)),
        None => (text, None),
    };
    let mut parts = path.split(':');
    if parts.next()? != "BIAS" {
        return None;
    }
    let device = parts.next()?.strip_prefix("DEV")?.parse().ok()?;
    let field = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((device, field, argument))
}
