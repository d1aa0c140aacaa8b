//! Controller parameter table.

use super::codec::DataType;

/// Who may touch a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Query only
    ReadOnly,
    /// Set only (commands such as error acknowledge)
    WriteOnly,
    /// Query and set
    ReadWrite,
}

/// One controller parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameter {
    /// Three-digit parameter number
    pub number: u16,
    /// Controller mnemonic
    pub name: &'static str,
    /// Payload type
    pub data_type: DataType,
    /// Allowed actions
    pub access: Access,
}

impl Parameter {
    const fn new(number: u16, name: &'static str, data_type: DataType, access: Access) -> Self {
        Self {
            number,
            name,
            data_type,
            access,
        }
    }

    /// Whether queries are allowed.
    pub fn readable(&self) -> bool {
        self.access != Access::WriteOnly
    }

    /// Whether sets are allowed.
    pub fn writable(&self) -> bool {
        self.access != Access::ReadOnly
    }

    /// Look a parameter up by number.
    pub fn lookup(number: u16) -> Option<&'static Parameter> {
        ALL.iter().find(|p| p.number == number)
    }
}

/// Pump heating on/off
pub const HEATING: Parameter =
    Parameter::new(1, "Heating", DataType::BooleanOld, Access::ReadWrite);
/// Standby mode
pub const STANDBY: Parameter =
    Parameter::new(2, "Standby", DataType::BooleanOld, Access::ReadWrite);
/// Acknowledge a pending error
pub const ERROR_ACK: Parameter =
    Parameter::new(9, "ErrorAckn", DataType::BooleanOld, Access::WriteOnly);
/// Pumping station on/off
pub const PUMPING_STATION: Parameter =
    Parameter::new(10, "PumpgStatn", DataType::BooleanOld, Access::ReadWrite);
/// Motor of the turbo pump
pub const MOTOR_PUMP: Parameter =
    Parameter::new(23, "MotorPump", DataType::BooleanOld, Access::ReadWrite);
/// Current error code, `no Err` when clear
pub const ERROR_CODE: Parameter =
    Parameter::new(303, "Error code", DataType::String6, Access::ReadOnly);
/// Set rotation speed in Hz
pub const SET_ROT_SPEED: Parameter =
    Parameter::new(308, "SetRotSpd", DataType::UInteger, Access::ReadOnly);
/// Actual rotation speed in Hz
pub const ACTUAL_SPEED: Parameter =
    Parameter::new(309, "ActualSpd", DataType::UInteger, Access::ReadOnly);
/// Drive current in A
pub const DRIVE_CURRENT: Parameter =
    Parameter::new(310, "DrvCurrent", DataType::UReal, Access::ReadOnly);
/// Firmware version of the electronics
pub const FIRMWARE_VERSION: Parameter =
    Parameter::new(312, "Fw version", DataType::String6, Access::ReadOnly);
/// Drive voltage in V
pub const DRIVE_VOLTAGE: Parameter =
    Parameter::new(313, "DrvVoltage", DataType::UReal, Access::ReadOnly);
/// Drive power in W
pub const DRIVE_POWER: Parameter =
    Parameter::new(316, "DrvPower", DataType::UInteger, Access::ReadOnly);
/// Temperature of the pump bottom part in °C
pub const TEMP_PUMP_BOTTOM: Parameter =
    Parameter::new(330, "TempPmpBot", DataType::UInteger, Access::ReadOnly);
/// Pressure reading of an attached gauge in hPa
pub const PRESSURE: Parameter =
    Parameter::new(340, "Pressure", DataType::UExpoNew, Access::ReadOnly);
/// Motor temperature in °C
pub const TEMP_MOTOR: Parameter =
    Parameter::new(346, "TempMotor", DataType::UInteger, Access::ReadOnly);
/// Electronics name
pub const ELECTRONICS_NAME: Parameter =
    Parameter::new(349, "ElecName", DataType::String6, Access::ReadOnly);

/// Every known parameter.
pub const ALL: &[Parameter] = &[
    HEATING,
    STANDBY,
    ERROR_ACK,
    PUMPING_STATION,
    MOTOR_PUMP,
    ERROR_CODE,
    SET_ROT_SPEED,
    ACTUAL_SPEED,
    DRIVE_CURRENT,
    FIRMWARE_VERSION,
    DRIVE_VOLTAGE,
    DRIVE_POWER,
    TEMP_PUMP_BOTTOM,
    PRESSURE,
    TEMP_MOTOR,
    ELECTRONICS_NAME,
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_numbers_are_unique_and_three_digit() {
        let mut seen = HashSet::new();
        for p in ALL {
            assert!(p.number <= 999, "{} too wide", p.name);
            assert!(seen.insert(p.number), "{} listed twice", p.number);
        }
    }

    #[test]
    fn test_lookup() {
        assert_eq!(Parameter::lookup(309), Some(&ACTUAL_SPEED));
        assert!(Parameter::lookup(998).is_none());
        assert!(!ERROR_ACK.readable());
        assert!(!ACTUAL_SPEED.writable());
    }
}
