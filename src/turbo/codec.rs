//! Typed payload codecs.
//!
//! Every controller parameter has a fixed-width data type. Encoding pads to that width,
//! decoding checks it. The controller answers with one of a few reserved words instead of a
//! value when it rejects a request; those surface as [`InstrumentError::DeviceReported`].
//!
//! The exponential types are only partly known: `UExpoNew` decodes with
//! `10^(int(digits[..len-2]) - 20)`, a rule that has not been checked against a controller,
//! and nothing else about either exponential type is implemented.

use crate::error::{AppResult, InstrumentError};
use std::fmt;

/// Payloads the controller sends instead of a value.
const DEVICE_ERRORS: [&str; 3] = ["NO_DEF", "_RANGE", "_LOGIC"];

/// Six-digit boolean "true".
pub const BOOL_OLD_TRUE: &str = "111111";
/// Six-digit boolean "false".
pub const BOOL_OLD_FALSE: &str = "000000";

/// Parameter data types and their field widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// `111111` / `000000`
    BooleanOld,
    /// Six decimal digits
    UInteger,
    /// Six digits, two implied decimals
    UReal,
    /// Six ASCII characters
    String6,
    /// `1` / `0`
    BooleanNew,
    /// Three decimal digits
    UShortInt,
    /// Six-character exponential, format unknown
    UExpo,
    /// Six-character exponential, decode only
    UExpoNew,
    /// Eight ASCII characters
    String8,
    /// Sixteen ASCII characters
    String16,
}

/// A decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean types
    Bool(bool),
    /// Integer types
    UInt(u64),
    /// Real and exponential types
    Real(f64),
    /// String types
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", if *b { "on" } else { "off" }),
            Value::UInt(n) => write!(f, "{}", n),
            Value::Real(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl Value {
    /// The boolean inside, if any.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The integer inside, if any.
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::UInt(n) => Some(*n),
            _ => None,
        }
    }

    /// The number inside as a float, if any.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Real(x) => Some(*x),
            Value::UInt(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// The text inside, if any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl DataType {
    /// Payload width in characters.
    pub fn width(self) -> usize {
        match self {
            DataType::BooleanNew => 1,
            DataType::UShortInt => 3,
            DataType::BooleanOld
            | DataType::UInteger
            | DataType::UReal
            | DataType::String6
            | DataType::UExpo
            | DataType::UExpoNew => 6,
            DataType::String8 => 8,
            DataType::String16 => 16,
        }
    }

    /// Value to payload text.
    pub fn encode(self, value: &Value) -> AppResult<String> {
        match (self, value) {
            (DataType::BooleanOld, Value::Bool(b)) => {
                Ok(if *b { BOOL_OLD_TRUE } else { BOOL_OLD_FALSE }.to_string())
            }
            (DataType::BooleanNew, Value::Bool(b)) => Ok(if *b { "1" } else { "0" }.to_string()),
            (DataType::UInteger | DataType::UShortInt, Value::UInt(n)) => {
                let width = self.width();
                let text = format!("{:0width$}", n, width = width);
                if text.len() > width {
                    return Err(out_of_range(self, value));
                }
                Ok(text)
            }
            (DataType::UReal, Value::Real(x)) => {
                if !x.is_finite() || *x < 0.0 {
                    return Err(out_of_range(self, value));
                }
                let text = format!("{:07.2}", x).replace('.', "");
                if text.len() > self.width() {
                    return Err(out_of_range(self, value));
                }
                Ok(text)
            }
            (DataType::String6 | DataType::String8 | DataType::String16, Value::Text(s)) => {
                let width = self.width();
                if !s.is_ascii() || s.len() > width {
                    return Err(out_of_range(self, value));
                }
                Ok(format!("{:<width$}", s, width = width))
            }
            (DataType::UExpo | DataType::UExpoNew, _) => Err(InstrumentError::UnsupportedEncoding(
                format!("{:?} values cannot be written", self),
            )),
            _ => Err(InstrumentError::InvalidState(format!(
                "{:?} cannot hold {:?}",
                self, value
            ))),
        }
    }

    /// Payload text to value.
    pub fn decode(self, payload: &str) -> AppResult<Value> {
        if let Some(word) = DEVICE_ERRORS.iter().find(|w| payload.trim() == **w) {
            return Err(InstrumentError::DeviceReported((*word).to_string()));
        }
        if !payload.is_ascii() {
            return Err(InstrumentError::Protocol(format!(
                "{:?} payload '{}' is not ASCII",
                self,
                payload.escape_debug()
            )));
        }
        if payload.len() != self.width() {
            return Err(InstrumentError::Protocol(format!(
                "{:?} payload '{}' is not {} characters wide",
                self,
                payload,
                self.width()
            )));
        }

        match self {
            DataType::BooleanOld => match payload {
                BOOL_OLD_TRUE => Ok(Value::Bool(true)),
                BOOL_OLD_FALSE => Ok(Value::Bool(false)),
                _ => Err(malformed(self, payload)),
            },
            DataType::BooleanNew => match payload {
                "1" => Ok(Value::Bool(true)),
                "0" => Ok(Value::Bool(false)),
                _ => Err(malformed(self, payload)),
            },
            DataType::UInteger | DataType::UShortInt => {
                Ok(Value::UInt(unsigned(self, payload)?))
            }
            DataType::UReal => Ok(Value::Real(unsigned(self, payload)? as f64 / 100.0)),
            DataType::String6 | DataType::String8 | DataType::String16 => {
                Ok(Value::Text(payload.trim_end().to_string()))
            }
            DataType::UExpo => Err(InstrumentError::UnsupportedEncoding(
                "UExpo payloads cannot be decoded".into(),
            )),
            DataType::UExpoNew => {
                // Unverified: exponent reconstruction has not been confirmed on hardware.
                let mantissa = &payload[..payload.len() - 2];
                let exponent = mantissa
                    .trim()
                    .parse::<i32>()
                    .map_err(|_| malformed(self, payload))?;
                Ok(Value::Real(10f64.powi(exponent - 20)))
            }
        }
    }
}

/// Flip a six-digit boolean by XOR with the integer 111111.
///
/// Only the two legal payloads are accepted.
pub fn toggle_boolean_old(payload: &str) -> AppResult<String> {
    if payload != BOOL_OLD_TRUE && payload != BOOL_OLD_FALSE {
        return Err(malformed(DataType::BooleanOld, payload));
    }
    let current: u32 = payload
        .parse()
        .map_err(|_| malformed(DataType::BooleanOld, payload))?;
    Ok(format!("{:06}", current ^ 111_111))
}

fn unsigned(data_type: DataType, payload: &str) -> AppResult<u64> {
    if !payload.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed(data_type, payload));
    }
    payload.parse().map_err(|_| malformed(data_type, payload))
}

fn malformed(data_type: DataType, payload: &str) -> InstrumentError {
    InstrumentError::Protocol(format!("'{}' is not a valid {:?} payload", payload, data_type))
}

fn out_of_range(data_type: DataType, value: &Value) -> InstrumentError {
    InstrumentError::OutOfRange(format!("{:?} does not fit {:?}", value, data_type))
}
