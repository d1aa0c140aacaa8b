//! Turbo-pump controller driver.
//!
//! Each call is one self-contained transaction: drop any late answer still buffered, send a
//! telegram, read one CR-terminated answer, validate it, decode the payload. Several
//! controllers may share an RS-485 line, so the connection lock is held for the whole
//! exchange.
//!
//! The `Option`-returning methods log one warning and return `None` on any failure. The
//! `try_` variants return the typed error. Nothing here retries.

use super::codec::{toggle_boolean_old, DataType, Value};
use super::frame::{Frame, TERMINATOR};
use super::parameters::{self, Parameter};
use crate::adapters::{ConnectionRegistry, Lease, SharedConnection};
use crate::config::InstrumentDefinition;
use crate::error::{AppResult, InstrumentError};
use tracing::{debug, warn};

/// Upper bound on an answer telegram, terminator included.
const RESPONSE_MAX: usize = 64;

/// One controller on a serial line.
#[derive(Debug)]
pub struct TurboPump {
    link: SharedConnection,
    address: u8,
    lease: Option<(ConnectionRegistry, Lease)>,
}

impl TurboPump {
    /// Talk to the controller at `address` (1-255) over `link`.
    pub fn new(link: SharedConnection, address: u16) -> AppResult<Self> {
        let address = u8::try_from(address)
            .ok()
            .filter(|a| *a >= 1)
            .ok_or_else(|| {
                InstrumentError::OutOfRange(format!("pump address {} outside 1-255", address))
            })?;
        Ok(Self {
            link,
            address,
            lease: None,
        })
    }

    /// Claim the pump's serial line from `registry`.
    pub async fn connect(
        registry: &ConnectionRegistry,
        def: &InstrumentDefinition,
    ) -> AppResult<Self> {
        let options = def.turbo_pump.as_ref().ok_or_else(|| {
            InstrumentError::Configuration(format!("'{}' has no turbo_pump block", def.id))
        })?;
        let lease = registry.acquire(&def.transport, &def.id).await?;
        let mut pump = Self::new(lease.connection()?, options.device_id)?;
        pump.lease = Some((registry.clone(), lease));
        Ok(pump)
    }

    /// Bus address of this controller.
    pub fn address(&self) -> u8 {
        self.address
    }

    async fn transact(&self, request: &Frame) -> AppResult<Frame> {
        let wire = request.encode()?;
        let raw = {
            let mut conn = self.link.lock().await;
            conn.discard_input()?;
            conn.send(wire.as_bytes()).await?;
            conn.receive_until(TERMINATOR, RESPONSE_MAX).await?
        };
        let text = std::str::from_utf8(&raw)
            .map_err(|_| InstrumentError::Protocol("answer is not ASCII".into()))?;
        let answer = Frame::parse(text)?;

        if answer.address != request.address || answer.parameter != request.parameter {
            return Err(InstrumentError::Protocol(format!(
                "asked {:03}/{:03}, answer came from {:03}/{:03}",
                request.address, request.parameter, answer.address, answer.parameter
            )));
        }
        debug!(
            address = self.address,
            parameter = answer.parameter,
            payload = %answer.payload,
            "answer"
        );
        Ok(answer)
    }

    async fn query_raw(&self, param: &Parameter) -> AppResult<String> {
        if !param.readable() {
            return Err(InstrumentError::InvalidState(format!(
                "{} ({:03}) is write-only",
                param.name, param.number
            )));
        }
        let answer = self.transact(&Frame::query(self.address, param.number)).await?;
        Ok(answer.payload)
    }

    async fn set_raw(&self, param: &Parameter, payload: String) -> AppResult<Value> {
        if !param.writable() {
            return Err(InstrumentError::InvalidState(format!(
                "{} ({:03}) is read-only",
                param.name, param.number
            )));
        }
        let answer = self
            .transact(&Frame::set(self.address, param.number, payload))
            .await?;
        param.data_type.decode(&answer.payload)
    }

    /// Read and decode a parameter.
    pub async fn try_read_parameter(&self, param: &Parameter) -> AppResult<Value> {
        let payload = self.query_raw(param).await?;
        param.data_type.decode(&payload)
    }

    /// Encode and write a parameter; returns the value the controller echoes.
    pub async fn try_write_parameter(&self, param: &Parameter, value: &Value) -> AppResult<Value> {
        if !param.writable() {
            return Err(InstrumentError::InvalidState(format!(
                "{} ({:03}) is read-only",
                param.name, param.number
            )));
        }
        let payload = param.data_type.encode(value)?;
        self.set_raw(param, payload).await
    }

    /// Flip a six-digit boolean parameter.
    pub async fn try_toggle(&self, param: &Parameter) -> AppResult<Value> {
        if param.data_type != DataType::BooleanOld {
            return Err(InstrumentError::InvalidState(format!(
                "{} is {:?}; only six-digit booleans can be toggled",
                param.name, param.data_type
            )));
        }
        let current = self.query_raw(param).await?;
        let flipped = toggle_boolean_old(&current)?;
        self.set_raw(param, flipped).await
    }

    /// [`try_read_parameter`](Self::try_read_parameter), logging failures.
    pub async fn read_parameter(&self, param: &Parameter) -> Option<Value> {
        self.report(param, self.try_read_parameter(param).await)
    }

    /// [`try_write_parameter`](Self::try_write_parameter), logging failures.
    pub async fn write_parameter(&self, param: &Parameter, value: &Value) -> Option<Value> {
        self.report(param, self.try_write_parameter(param, value).await)
    }

    /// [`try_toggle`](Self::try_toggle), logging failures.
    pub async fn toggle(&self, param: &Parameter) -> Option<Value> {
        self.report(param, self.try_toggle(param).await)
    }

    fn report(&self, param: &Parameter, result: AppResult<Value>) -> Option<Value> {
        match result {
            Ok(value) => Some(value),
            Err(err @ InstrumentError::Checksum { .. }) => {
                warn!(
                    address = self.address,
                    parameter = param.number,
                    error = %err,
                    "checksum error"
                );
                None
            }
            Err(err) => {
                warn!(
                    address = self.address,
                    parameter = param.number,
                    error = %err,
                    "transaction failed"
                );
                None
            }
        }
    }

    /// Whether the pumping station is on.
    pub async fn is_pumping(&self) -> Option<bool> {
        self.read_parameter(&parameters::PUMPING_STATION)
            .await
            .and_then(|v| v.as_bool())
    }

    /// Switch the pumping station on or off.
    pub async fn set_pumping(&self, on: bool) -> Option<bool> {
        self.write_parameter(&parameters::PUMPING_STATION, &Value::Bool(on))
            .await
            .and_then(|v| v.as_bool())
    }

    /// Flip the pumping station state.
    pub async fn toggle_pumping(&self) -> Option<bool> {
        self.toggle(&parameters::PUMPING_STATION)
            .await
            .and_then(|v| v.as_bool())
    }

    /// Rotor speed in Hz.
    pub async fn actual_speed_hz(&self) -> Option<u64> {
        self.read_parameter(&parameters::ACTUAL_SPEED)
            .await
            .and_then(|v| v.as_uint())
    }

    /// Drive power in W.
    pub async fn drive_power_w(&self) -> Option<u64> {
        self.read_parameter(&parameters::DRIVE_POWER)
            .await
            .and_then(|v| v.as_uint())
    }

    /// Pump bottom temperature in °C.
    pub async fn pump_temperature_c(&self) -> Option<u64> {
        self.read_parameter(&parameters::TEMP_PUMP_BOTTOM)
            .await
            .and_then(|v| v.as_uint())
    }

    /// Current error code, `no Err` when healthy.
    pub async fn error_code(&self) -> Option<String> {
        self.read_text(&parameters::ERROR_CODE).await
    }

    /// Electronics model name.
    pub async fn electronics_name(&self) -> Option<String> {
        self.read_text(&parameters::ELECTRONICS_NAME).await
    }

    /// Controller firmware version.
    pub async fn firmware_version(&self) -> Option<String> {
        self.read_text(&parameters::FIRMWARE_VERSION).await
    }

    /// Acknowledge a pending error.
    pub async fn acknowledge_error(&self) -> Option<()> {
        self.write_parameter(&parameters::ERROR_ACK, &Value::Bool(true))
            .await
            .map(|_| ())
    }

    async fn read_text(&self, param: &Parameter) -> Option<String> {
        self.read_parameter(param)
            .await
            .and_then(|v| v.as_text().map(str::to_string))
    }

    /// Give the line back to the registry, or close it if this driver owns it alone.
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
    use crate::adapters::{MockDevice, MockFraming};
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tracing_test::traced_test;

    fn pump_answering(answer: &'static str) -> (TurboPump, MockDevice) {
        let (conn, device) = MockDevice::spawn("tc110", MockFraming::CarriageReturn, move |_| {
            Some(answer.as_bytes().to_vec())
        });
        (TurboPump::new(Arc::new(Mutex::new(conn)), 1).unwrap(), device)
    }

    #[tokio::test]
    async fn test_read_speed() {
        let (pump, device) = pump_answering("0011030906000820030\r");
        assert_eq!(pump.actual_speed_hz().await, Some(820));
        assert_eq!(device.requests().await, vec!["0010030902=?107\r"]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_checksum_error_is_logged_and_discarded() {
        let (pump, _device) = pump_answering("0011030906000820099\r");
        assert_eq!(pump.actual_speed_hz().await, None);
        assert!(logs_contain("checksum error"));
    }

    #[tokio::test]
    async fn test_answer_from_wrong_parameter() {
        let (pump, _device) = pump_answering("0011031606000820028\r");
        let err = pump
            .try_read_parameter(&parameters::ACTUAL_SPEED)
            .await
            .unwrap_err();
        assert!(matches!(err, InstrumentError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_read_only_parameter_is_not_written() {
        let (pump, device) = pump_answering("unused\r");
        let err = pump
            .try_write_parameter(&parameters::ACTUAL_SPEED, &Value::UInt(1))
            .await
            .unwrap_err();
        assert!(matches!(err, InstrumentError::InvalidState(_)));
        assert!(device.requests().await.is_empty());
    }

    #[test]
    fn test_address_bounds() {
        let (near, _far) = tokio::io::duplex(8);
        let link = Arc::new(Mutex::new(crate::adapters::Connection::from_stream(
            "x",
            near,
            std::time::Duration::from_millis(10),
        )));
        assert!(TurboPump::new(link.clone(), 0).is_err());
        assert!(TurboPump::new(link.clone(), 256).is_err());
        assert!(TurboPump::new(link, 255).is_ok());
    }
}
