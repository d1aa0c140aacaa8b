//! Holding-register access over Modbus TCP or RTU.
//!
//! Only the three function codes the motion drive needs are implemented: read holding
//! registers (0x03), write single register (0x06) and write multiple registers (0x10).
//! Registers are 16-bit, big-endian on the wire.

use crate::adapters::SharedConnection;
use crate::error::{AppResult, InstrumentError};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

const READ_HOLDING_REGISTERS: u8 = 0x03;
const WRITE_SINGLE_REGISTER: u8 = 0x06;
const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
const EXCEPTION_FLAG: u8 = 0x80;

/// MBAP header: transaction id, protocol id, length.
const MBAP_HEADER_SIZE: usize = 6;

/// Register-level access to a drive.
#[async_trait]
pub trait RegisterBus: Send {
    /// Read `count` consecutive holding registers starting at `address`.
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> AppResult<Vec<u16>>;

    /// Write one register.
    async fn write_register(&mut self, address: u16, value: u16) -> AppResult<()>;

    /// Write consecutive registers starting at `address`.
    async fn write_registers(&mut self, address: u16, values: &[u16]) -> AppResult<()>;
}

/// Wire framing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// MBAP header over TCP
    #[default]
    Tcp,
    /// Unit id + PDU + CRC-16 over a serial line
    Rtu,
}

/// Modbus master talking to one unit.
#[derive(Debug)]
pub struct ModbusClient {
    link: SharedConnection,
    unit_id: u8,
    framing: Framing,
    transaction_id: u16,
}

impl ModbusClient {
    /// Create a client for `unit_id` on `link`.
    pub fn new(link: SharedConnection, unit_id: u8, framing: Framing) -> Self {
        Self {
            link,
            unit_id,
            framing,
            transaction_id: 0,
        }
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        if self.transaction_id == 0 {
            self.transaction_id = 1;
        }
        self.transaction_id
    }

    /// Send one request PDU and return the response PDU (function code first).
    async fn transact(&mut self, pdu: &[u8]) -> AppResult<Vec<u8>> {
        let response = match self.framing {
            Framing::Tcp => self.transact_tcp(pdu).await?,
            Framing::Rtu => self.transact_rtu(pdu).await?,
        };
        check_function(pdu[0], &response)?;
        Ok(response)
    }

    /// One MBAP exchange. Replies carrying another transaction id are late answers to
    /// requests that already timed out; they are read in full and dropped.
    async fn transact_tcp(&mut self, pdu: &[u8]) -> AppResult<Vec<u8>> {
        let transaction_id = self.next_transaction_id();
        let mut frame = BytesMut::with_capacity(MBAP_HEADER_SIZE + 1 + pdu.len());
        frame.put_u16(transaction_id);
        frame.put_u16(0);
        frame.put_u16((pdu.len() + 1) as u16);
        frame.put_u8(self.unit_id);
        frame.put_slice(pdu);
        trace!(tx = ?frame.as_ref(), "modbus tcp");

        let mut conn = self.link.lock().await;
        conn.discard_input()?;
        conn.send(&frame).await?;

        let deadline = Instant::now() + conn.timeout();
        loop {
            let header = conn
                .receive_exact_before(MBAP_HEADER_SIZE + 1, deadline)
                .await?;
            let echoed_id = u16::from_be_bytes([header[0], header[1]]);
            let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
            if length < 2 {
                // Framing is lost; whatever follows cannot be trusted.
                conn.discard_input()?;
                return Err(InstrumentError::Protocol(format!(
                    "MBAP length {} too short",
                    length
                )));
            }
            let body = conn.receive_exact_before(length - 1, deadline).await?;
            if echoed_id != transaction_id {
                debug!(expected = transaction_id, received = echoed_id, "dropping stale reply");
                continue;
            }
            if header[6] != self.unit_id {
                return Err(unit_mismatch(self.unit_id, header[6]));
            }
            return Ok(body);
        }
    }

    async fn transact_rtu(&mut self, pdu: &[u8]) -> AppResult<Vec<u8>> {
        let mut frame = BytesMut::with_capacity(pdu.len() + 3);
        frame.put_u8(self.unit_id);
        frame.put_slice(pdu);
        let crc = CRC_MODBUS.checksum(&frame);
        frame.put_u16_le(crc);
        trace!(tx = ?frame.as_ref(), "modbus rtu");

        let mut conn = self.link.lock().await;
        conn.discard_input()?;
        conn.send(&frame).await?;

        let mut response = conn.receive_exact(2).await?;
        let function = response[1];
        let remaining = if function & EXCEPTION_FLAG != 0 {
            3
        } else if function == READ_HOLDING_REGISTERS {
            let count = conn.receive_exact(1).await?;
            response.extend_from_slice(&count);
            usize::from(count[0]) + 2
        } else {
            6
        };
        response.extend(conn.receive_exact(remaining).await?);
        drop(conn);

        let (body, tail) = response.split_at(response.len() - 2);
        let received = u16::from_le_bytes([tail[0], tail[1]]);
        let expected = CRC_MODBUS.checksum(body);
        if received != expected {
            return Err(InstrumentError::Protocol(format!(
                "CRC mismatch: expected {:04X}, received {:04X}",
                expected, received
            )));
        }
        if body[0] != self.unit_id {
            return Err(unit_mismatch(self.unit_id, body[0]));
        }
        Ok(body[1..].to_vec())
    }
}

fn unit_mismatch(expected: u8, received: u8) -> InstrumentError {
    InstrumentError::Protocol(format!("unit {} answered as unit {}", expected, received))
}

fn check_function(function: u8, response: &[u8]) -> AppResult<()> {
    match response.first() {
        Some(code) if *code == function | EXCEPTION_FLAG => {
            let exception = response.get(1).copied().unwrap_or(0);
            Err(InstrumentError::DeviceReported(format!(
                "Modbus exception 0x{:02X} ({}) for function 0x{:02X}",
                exception,
                exception_name(exception),
                function
            )))
        }
        Some(code) if *code == function => Ok(()),
        Some(code) => Err(InstrumentError::Protocol(format!(
            "function 0x{:02X} answered with 0x{:02X}",
            function, code
        ))),
        None => Err(InstrumentError::Protocol("empty response".into())),
    }
}

fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x06 => "server device busy",
        _ => "unknown",
    }
}

#[async_trait]
impl RegisterBus for ModbusClient {
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> AppResult<Vec<u16>> {
        let mut pdu = BytesMut::with_capacity(5);
        pdu.put_u8(READ_HOLDING_REGISTERS);
        pdu.put_u16(address);
        pdu.put_u16(count);

        let response = self.transact(&pdu).await?;
        let byte_count = usize::from(*response.get(1).unwrap_or(&0));
        let data = response.get(2..).unwrap_or_default();
        if byte_count != usize::from(count) * 2 || data.len() != byte_count {
            return Err(InstrumentError::Protocol(format!(
                "asked for {} registers, got {} data bytes",
                count,
                data.len()
            )));
        }
        Ok(data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    async fn write_register(&mut self, address: u16, value: u16) -> AppResult<()> {
        let mut pdu = BytesMut::with_capacity(5);
        pdu.put_u8(WRITE_SINGLE_REGISTER);
        pdu.put_u16(address);
        pdu.put_u16(value);

        let response = self.transact(&pdu).await?;
        if response[..] != pdu[..] {
            return Err(InstrumentError::Protocol(format!(
                "write of 0x{:04X} to 0x{:04X} not echoed",
                value, address
            )));
        }
        Ok(())
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> AppResult<()> {
        let count = u16::try_from(values.len())
            .ok()
            .filter(|c| (1..=123).contains(c))
            .ok_or_else(|| {
                InstrumentError::OutOfRange(format!("cannot write {} registers", values.len()))
            })?;
        let mut pdu = BytesMut::with_capacity(6 + values.len() * 2);
        pdu.put_u8(WRITE_MULTIPLE_REGISTERS);
        pdu.put_u16(address);
        pdu.put_u16(count);
        pdu.put_u8((count * 2) as u8);
        for value in values {
            pdu.put_u16(*value);
        }

        let response = self.transact(&pdu).await?;
        if response.get(1..5) != Some(&pdu[1..5]) {
            return Err(InstrumentError::Protocol(format!(
                "write of {} registers at 0x{:04X} not confirmed",
                count, address
            )));
        }
        Ok(())
    }
}

/// Split a signed 32-bit value into (high, low) registers.
pub fn split_i32(value: i32) -> [u16; 2] {
    let bits = value as u32;
    [(bits >> 16) as u16, bits as u16]
}

/// Join (high, low) registers into a signed 32-bit value.
pub fn join_i32(high: u16, low: u16) -> i32 {
    ((u32::from(high) << 16) | u32::from(low)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Connection;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    fn client(builder: &mut tokio_test::io::Builder, framing: Framing) -> ModbusClient {
        let conn = Connection::from_stream("drive", builder.build(), Duration::from_millis(200));
        ModbusClient::new(Arc::new(Mutex::new(conn)), 1, framing)
    }

    #[tokio::test]
    async fn test_rtu_read_position_pair() {
        let mut builder = tokio_test::io::Builder::new();
        builder
            .write(&[0x01, 0x03, 0x60, 0x2A, 0x00, 0x02, 0xFB, 0xC3])
            .read(&[0x01, 0x03, 0x04, 0xFF, 0xFF, 0x63, 0xC0, 0xD2, 0xB7]);
        let mut modbus = client(&mut builder, Framing::Rtu);

        let regs = modbus.read_holding_registers(0x602A, 2).await.unwrap();
        assert_eq!(regs, vec![0xFFFF, 0x63C0]);
        assert_eq!(join_i32(regs[0], regs[1]), -40_000);
    }

    #[tokio::test]
    async fn test_rtu_write_single_and_multiple() {
        let mut builder = tokio_test::io::Builder::new();
        builder
            .write(&[0x01, 0x06, 0x62, 0x00, 0x00, 0x41, 0x56, 0x42])
            .read(&[0x01, 0x06, 0x62, 0x00, 0x00, 0x41, 0x56, 0x42])
            .write(&[
                0x01, 0x10, 0x62, 0x01, 0x00, 0x02, 0x04, 0x00, 0x00, 0xFF, 0xFF, 0xB1, 0x55,
            ])
            .read(&[0x01, 0x10, 0x62, 0x01, 0x00, 0x02, 0x0F, 0xB0]);
        let mut modbus = client(&mut builder, Framing::Rtu);

        modbus.write_register(0x6200, 0x0041).await.unwrap();
        modbus.write_registers(0x6201, &[0x0000, 0xFFFF]).await.unwrap();
    }

    #[tokio::test]
    async fn test_rtu_exception_is_device_reported() {
        let mut builder = tokio_test::io::Builder::new();
        builder
            .write(&[0x01, 0x03, 0x60, 0x2A, 0x00, 0x02, 0xFB, 0xC3])
            .read(&[0x01, 0x83, 0x02, 0xC0, 0xF1]);
        let mut modbus = client(&mut builder, Framing::Rtu);

        let err = modbus.read_holding_registers(0x602A, 2).await.unwrap_err();
        assert!(matches!(
            err,
            InstrumentError::DeviceReported(ref m) if m.contains("illegal data address")
        ));
    }

    #[tokio::test]
    async fn test_rtu_bad_crc() {
        let mut builder = tokio_test::io::Builder::new();
        builder
            .write(&[0x01, 0x03, 0x60, 0x2A, 0x00, 0x02, 0xFB, 0xC3])
            .read(&[0x01, 0x03, 0x04, 0xFF, 0xFF, 0x63, 0xC0, 0x00, 0x00]);
        let mut modbus = client(&mut builder, Framing::Rtu);

        let err = modbus.read_holding_registers(0x602A, 2).await.unwrap_err();
        assert!(matches!(err, InstrumentError::Protocol(ref m) if m.contains("CRC")));
    }

    #[tokio::test]
    async fn test_tcp_read_uses_mbap_header() {
        let mut builder = tokio_test::io::Builder::new();
        builder
            .write(&[
                0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x60, 0x2A, 0x00, 0x02,
            ])
            .read(&[
                0x00, 0x01, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04, 0x00, 0x00, 0x09, 0xC4,
            ]);
        let mut modbus = client(&mut builder, Framing::Tcp);

        let regs = modbus.read_holding_registers(0x602A, 2).await.unwrap();
        assert_eq!(join_i32(regs[0], regs[1]), 2500);
    }

    #[test]
    fn test_split_join() {
        assert_eq!(split_i32(2500), [0x0000, 0x09C4]);
        assert_eq!(split_i32(-1), [0xFFFF, 0xFFFF]);
        assert_eq!(join_i32(0xFFFF, 0x63C0), -40_000);
    }
}
