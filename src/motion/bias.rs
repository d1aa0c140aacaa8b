//! SIS bias block driver
//!
//! The block speaks newline-free ASCII commands of the form `BIAS:DEV<n>:<FIELD>[ <value>]`
//! over a persistent socket. Any answer containing `ERROR` is a rejected attempt.
//!
//! ## Retry
//! `manipulate` and the numeric getters go through a [`RetryPolicy`]. A getter also retries
//! when the answer does not end in a number.
//!
//! ## Closed-loop setpoint
//! [`BiasBlock::set_bias_voltage_iterative`] corrects the setpoint by the observed error
//! (unit-gain proportional feedback) until the read-back lands within a relative tolerance
//! of the target. The loop itself is the pure [`Convergence`] state machine, so it can be
//! tested without a device.

use crate::adapters::{ConnectionRegistry, Lease, SharedConnection};
use crate::config::{BiasBlockConfig, InstrumentDefinition};
use crate::error::{AppResult, InstrumentError};
use crate::error_recovery::RetryPolicy;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Outcome of feeding one read-back into [`Convergence`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConvergenceStep {
    /// Read-back is within tolerance.
    Converged(f64),
    /// Not there yet; command this setpoint next.
    Adjust(f64),
    /// Iteration budget spent.
    Exhausted,
}

/// Proportional error-feedback loop towards a target voltage.
#[derive(Debug, Clone, PartialEq)]
pub struct Convergence {
    desired: f64,
    tolerance: f64,
    max_iterations: u32,
    iteration: u32,
    setpoint: f64,
    last_reading: Option<f64>,
}

impl Convergence {
    /// Start at `desired`; `tolerance` is relative to `|desired|`.
    pub fn new(desired: f64, tolerance: f64, max_iterations: u32) -> Self {
        Self {
            desired,
            tolerance: tolerance.abs(),
            max_iterations,
            iteration: 0,
            setpoint: desired,
            last_reading: None,
        }
    }

    /// Setpoint to command next.
    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    /// Read-backs observed so far.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Most recent read-back, if any.
    pub fn last_reading(&self) -> Option<f64> {
        self.last_reading
    }

    /// Whether the iteration budget is spent.
    pub fn is_exhausted(&self) -> bool {
        self.iteration >= self.max_iterations
    }

    /// Whether `reading` is close enough to the target.
    pub fn within_tolerance(&self, reading: f64) -> bool {
        (reading - self.desired).abs() <= self.tolerance * self.desired.abs()
    }

    /// Feed one read-back taken at the current setpoint.
    pub fn observe(&mut self, reading: f64) -> ConvergenceStep {
        self.iteration += 1;
        self.last_reading = Some(reading);
        if self.within_tolerance(reading) {
            return ConvergenceStep::Converged(reading);
        }
        self.setpoint += self.desired - reading;
        if self.is_exhausted() {
            ConvergenceStep::Exhausted
        } else {
            ConvergenceStep::Adjust(self.setpoint)
        }
    }

    /// The error describing an exhausted loop.
    pub fn failure(&self) -> InstrumentError {
        InstrumentError::ConvergenceFailure {
            target: self.desired,
            iterations: self.iteration,
            last_reading: self.last_reading,
        }
    }
}

/// Bias block on a shared socket connection.
#[derive(Debug)]
pub struct BiasBlock {
    link: SharedConnection,
    retry: RetryPolicy,
    settle: Duration,
    buffer_size: usize,
    lease: Option<(ConnectionRegistry, Lease)>,
}

impl BiasBlock {
    /// Drive a block on `link` with the retry and timing options of `options`.
    pub fn new(link: SharedConnection, options: &BiasBlockConfig) -> Self {
        Self {
            link,
            retry: RetryPolicy::new(
                options.max_attempts,
                Duration::from_millis(options.backoff_ms),
            ),
            settle: Duration::from_millis(options.settle_ms),
            buffer_size: options.buffer_size.max(1),
            lease: None,
        }
    }

    /// Claim the block's socket from `registry`.
    pub async fn connect(
        registry: &ConnectionRegistry,
        def: &InstrumentDefinition,
    ) -> AppResult<Self> {
        let options = def.bias_block.clone().unwrap_or_default();
        let lease = registry.acquire(&def.transport, &def.id).await?;
        let mut block = Self::new(lease.connection()?, &options);
        block.lease = Some((registry.clone(), lease));
        Ok(block)
    }

    /// Retry bound applied to every transaction.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// One attempt: drop leftovers of earlier attempts, send, read one answer, reject it
    /// if it carries `ERROR`.
    async fn exchange(&self, command: &str) -> AppResult<String> {
        let raw = {
            let mut conn = self.link.lock().await;
            conn.discard_input()?;
            conn.send(command.as_bytes()).await?;
            conn.receive(self.buffer_size).await?
        };
        let reply = String::from_utf8_lossy(&raw).trim().to_string();
        if reply.contains("ERROR") {
            return Err(InstrumentError::DeviceReported(reply));
        }
        Ok(reply)
    }

    /// Send `command` and return the answer, retrying rejected or missing answers.
    #[instrument(skip(self))]
    pub async fn try_manipulate(&self, command: &str) -> AppResult<String> {
        self.retry
            .retry(|attempt| async move {
                debug!(attempt, "bias exchange");
                self.exchange(command).await
            })
            .await
    }

    /// [`try_manipulate`](Self::try_manipulate); an empty string once retries are spent.
    pub async fn manipulate(&self, command: &str) -> String {
        match self.try_manipulate(command).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(command, error = %err, "bias command failed");
                String::new()
            }
        }
    }

    async fn try_number(&self, command: &str) -> AppResult<f64> {
        self.retry
            .retry(|attempt| async move {
                let reply = self.exchange(command).await?;
                let value = reply
                    .split_whitespace()
                    .last()
                    .and_then(|token| token.parse::<f64>().ok())
                    .filter(|value| value.is_finite())
                    .ok_or_else(|| {
                        InstrumentError::Protocol(format!("no number in answer '{}'", reply))
                    })?;
                debug!(attempt, value, "bias reading");
                Ok::<_, InstrumentError>(value)
            })
            .await
    }

    /// Command `volts` on device `device`.
    pub async fn try_set_voltage(&self, device: u8, volts: f64) -> AppResult<()> {
        self.try_manipulate(&format!("BIAS:DEV{}:VOLT {}", device, volts))
            .await
            .map(|_| ())
    }

    /// [`try_set_voltage`](Self::try_set_voltage), logging failures.
    pub async fn set_voltage(&self, device: u8, volts: f64) -> Option<()> {
        self.try_set_voltage(device, volts)
            .await
            .map_err(|err| warn!(device, volts, error = %err, "setting bias voltage failed"))
            .ok()
    }

    /// Measured junction voltage, V.
    pub async fn try_voltage(&self, device: u8) -> AppResult<f64> {
        self.try_number(&format!("BIAS:DEV{}:VOLT", device)).await
    }

    /// Measured junction current, A.
    pub async fn try_current(&self, device: u8) -> AppResult<f64> {
        self.try_number(&format!("BIAS:DEV{}:CURR", device)).await
    }

    /// [`try_voltage`](Self::try_voltage), logging failures.
    pub async fn voltage(&self, device: u8) -> Option<f64> {
        self.try_voltage(device)
            .await
            .map_err(|err| warn!(device, error = %err, "voltage read failed"))
            .ok()
    }

    /// [`try_current`](Self::try_current), logging failures.
    pub async fn current(&self, device: u8) -> Option<f64> {
        self.try_current(device)
            .await
            .map_err(|err| warn!(device, error = %err, "current read failed"))
            .ok()
    }

    /// Drive device `device` until its read-back is within `tolerance * |desired|` of
    /// `desired`, for at most `max_iterations` set/settle/read rounds.
    ///
    /// Returns the converged read-back. On cancellation the last commanded setpoint stays in
    /// place.
    pub async fn set_bias_voltage_iterative(
        &self,
        device: u8,
        desired: f64,
        tolerance: f64,
        max_iterations: u32,
        cancel: &CancellationToken,
    ) -> AppResult<f64> {
        let mut loop_state = Convergence::new(desired, tolerance, max_iterations);

        while !loop_state.is_exhausted() {
            if cancel.is_cancelled() {
                info!(device, setpoint = loop_state.setpoint(), "Bias convergence cancelled");
                return Err(InstrumentError::Cancelled);
            }

            self.try_set_voltage(device, loop_state.setpoint()).await?;
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(device, setpoint = loop_state.setpoint(), "Bias convergence cancelled");
                    return Err(InstrumentError::Cancelled);
                }
                _ = sleep(self.settle) => {}
            }
            let reading = self.try_voltage(device).await?;

            match loop_state.observe(reading) {
                ConvergenceStep::Converged(volts) => {
                    info!(
                        device,
                        volts,
                        iterations = loop_state.iteration(),
                        "Bias voltage converged"
                    );
                    return Ok(volts);
                }
                ConvergenceStep::Adjust(next) => {
                    debug!(device, reading, next, "Correcting setpoint");
                }
                ConvergenceStep::Exhausted => break,
            }
        }

        warn!(
            device,
            desired,
            iterations = loop_state.iteration(),
            last_reading = ?loop_state.last_reading(),
            "Bias voltage did not reach target"
        );
        Err(loop_state.failure())
    }

    /// Hand the socket back to the registry, or close it if owned alone.
    pub async fn close(&mut self) {
        match self.lease.take() {
            Some((registry, lease)) => registry.release(lease).await,
            None => self.link.lock().await.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_device_converges_first_iteration() {
        let mut loop_state = Convergence::new(0.005, 0.001, 10);
        assert_eq!(loop_state.observe(0.005), ConvergenceStep::Converged(0.005));
        assert_eq!(loop_state.iteration(), 1);
    }

    #[test]
    fn test_offset_is_corrected_in_one_step() {
        let mut loop_state = Convergence::new(1.0, 0.001, 10);
        let ConvergenceStep::Adjust(next) = loop_state.observe(1.1) else {
            panic!("offset reading should not converge");
        };
        assert!((next - 0.9).abs() < 1e-12);
        assert!(matches!(
            loop_state.observe(next + 0.1),
            ConvergenceStep::Converged(_)
        ));
        assert_eq!(loop_state.iteration(), 2);
    }

    #[test]
    fn test_budget_exhaustion() {
        let mut loop_state = Convergence::new(1.0, 0.001, 2);
        assert!(matches!(loop_state.observe(0.0), ConvergenceStep::Adjust(_)));
        assert_eq!(loop_state.observe(0.0), ConvergenceStep::Exhausted);
        match loop_state.failure() {
            InstrumentError::ConvergenceFailure {
                iterations,
                last_reading,
                ..
            } => {
                assert_eq!(iterations, 2);
                assert_eq!(last_reading, Some(0.0));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_zero_iterations_is_exhausted() {
        assert!(Convergence::new(1.0, 0.1, 0).is_exhausted());
    }
}
