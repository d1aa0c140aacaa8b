//! Telegram framing for the turbo-pump controller.
//!
//! ```text
//! 001 10 010 06 111111 015 \r
//! │   │  │   │  │      └─ checksum: sum of all preceding bytes mod 256, 3 digits
//! │   │  │   │  └──────── payload
//! │   │  │   └─────────── payload length, 2 digits
//! │   │  └─────────────── parameter number, 3 digits
//! │   └────────────────── action: 00 query, 10 set / answer
//! └────────────────────── device address, 3 digits
//! ```

use crate::error::{AppResult, InstrumentError};

/// Payload of a parameter query.
pub const QUERY_PAYLOAD: &str = "=?";

/// Shortest legal telegram without terminator: header (10) + checksum (3).
const MIN_FRAME_LEN: usize = 13;

/// Telegram terminator.
pub const TERMINATOR: u8 = b'\r';

/// Action field of a telegram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// `00`: read a parameter
    Query,
    /// `10`: write a parameter, also used by the controller for every answer
    Set,
}

impl Action {
    /// Two-digit wire code.
    pub fn code(self) -> &'static str {
        match self {
            Action::Query => "00",
            Action::Set => "10",
        }
    }

    fn from_code(code: &str) -> AppResult<Self> {
        match code {
            "00" => Ok(Action::Query),
            "10" => Ok(Action::Set),
            other => Err(InstrumentError::Protocol(format!(
                "unknown action code '{}'",
                other
            ))),
        }
    }
}

/// One telegram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Device address, 1-255
    pub address: u8,
    /// Query or set
    pub action: Action,
    /// Parameter number, 0-999
    pub parameter: u16,
    /// Fixed-width payload text
    pub payload: String,
}

/// Sum of all bytes modulo 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    (bytes.iter().map(|b| u32::from(*b)).sum::<u32>() % 256) as u8
}

impl Frame {
    /// A parameter read request.
    pub fn query(address: u8, parameter: u16) -> Self {
        Self {
            address,
            action: Action::Query,
            parameter,
            payload: QUERY_PAYLOAD.to_string(),
        }
    }

    /// A parameter write request (or a controller answer).
    pub fn set(address: u8, parameter: u16, payload: impl Into<String>) -> Self {
        Self {
            address,
            action: Action::Set,
            parameter,
            payload: payload.into(),
        }
    }

    /// Everything up to, not including, the checksum.
    fn message(&self) -> AppResult<String> {
        if self.parameter > 999 {
            return Err(InstrumentError::OutOfRange(format!(
                "parameter number {} has more than 3 digits",
                self.parameter
            )));
        }
        if self.payload.len() > 99 || !self.payload.is_ascii() {
            return Err(InstrumentError::OutOfRange(format!(
                "payload '{}' is not ASCII of at most 99 characters",
                self.payload
            )));
        }
        Ok(format!(
            "{:03}{}{:03}{:02}{}",
            self.address,
            self.action.code(),
            self.parameter,
            self.payload.len(),
            self.payload
        ))
    }

    /// Wire form: message, 3-digit checksum, carriage return.
    pub fn encode(&self) -> AppResult<String> {
        let message = self.message()?;
        let sum = checksum(message.as_bytes());
        Ok(format!("{}{:03}\r", message, sum))
    }

    /// Parse and validate a received telegram. Trailing CR/LF is ignored.
    ///
    /// The checksum is checked first, over all but the last three characters.
    pub fn parse(text: &str) -> AppResult<Self> {
        let text = text.trim_end_matches(['\r', '\n']);
        if !text.is_ascii() {
            return Err(InstrumentError::Protocol("telegram is not ASCII".into()));
        }
        if text.len() < MIN_FRAME_LEN {
            return Err(InstrumentError::Protocol(format!(
                "telegram '{}' shorter than {} characters",
                text, MIN_FRAME_LEN
            )));
        }

        let (message, received) = text.split_at(text.len() - 3);
        let expected = checksum(message.as_bytes());
        let matches = received.bytes().all(|b| b.is_ascii_digit())
            && received.parse::<u16>().ok() == Some(u16::from(expected));
        if !matches {
            return Err(InstrumentError::Checksum {
                expected,
                received: received.to_string(),
            });
        }

        let address = digits(&message[0..3], "address")?;
        let action = Action::from_code(&message[3..5])?;
        let parameter = digits(&message[5..8], "parameter")?;
        let declared = digits(&message[8..10], "length")?;
        let payload = &message[10..];
        if usize::from(declared) != payload.len() {
            return Err(InstrumentError::Protocol(format!(
                "declared payload length {} but got {} characters",
                declared,
                payload.len()
            )));
        }
        let address = u8::try_from(address).map_err(|_| {
            InstrumentError::Protocol(format!("address {} out of range", address))
        })?;

        Ok(Self {
            address,
            action,
            parameter,
            payload: payload.to_string(),
        })
    }
}

fn digits(field: &str, what: &str) -> AppResult<u16> {
    if !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(InstrumentError::Protocol(format!(
            "{} field '{}' is not numeric",
            what, field
        )));
    }
    field
        .parse()
        .map_err(|_| InstrumentError::Protocol(format!("{} field '{}' unreadable", what, field)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_query() {
        assert_eq!(Frame::query(1, 309).encode().unwrap(), "0010030902=?107\r");
        assert_eq!(Frame::query(1, 10).encode().unwrap(), "0010001002=?096\r");
    }

    #[test]
    fn test_encode_set() {
        assert_eq!(
            Frame::set(1, 10, "111111").encode().unwrap(),
            "0011001006111111015\r"
        );
    }

    #[test]
    fn test_parse_answer() {
        let frame = Frame::parse("0011030906000000020\r").unwrap();
        assert_eq!(frame.address, 1);
        assert_eq!(frame.action, Action::Set);
        assert_eq!(frame.parameter, 309);
        assert_eq!(frame.payload, "000000");
    }

    #[test]
    fn test_parse_rejects_bad_checksum() {
        let err = Frame::parse("0011030906000000018\r").unwrap_err();
        assert!(matches!(
            err,
            InstrumentError::Checksum { expected: 20, ref received } if received == "018"
        ));
    }

    #[test]
    fn test_parse_rejects_length_mismatch() {
        let message = "001103090600000";
        let text = format!("{}{:03}", message, checksum(message.as_bytes()));
        let err = Frame::parse(&text).unwrap_err();
        assert!(matches!(err, InstrumentError::Protocol(ref m) if m.contains("declared")));
    }

    #[test]
    fn test_parse_rejects_short_and_garbage() {
        assert!(matches!(
            Frame::parse("00110309"),
            Err(InstrumentError::Protocol(_))
        ));
        let message = "0x11030902=?";
        let text = format!("{}{:03}", message, checksum(message.as_bytes()));
        assert!(matches!(Frame::parse(&text), Err(InstrumentError::Protocol(_))));
    }

    #[test]
    fn test_parameter_wider_than_three_digits() {
        assert!(Frame::query(1, 1000).encode().is_err());
    }
}
