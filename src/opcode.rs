//! Command set of the AFE boards
//!
//! Opcode values are fixed by the device firmware and must not change.

/// An AFE command opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[non_exhaustive]
#[repr(u8)]
pub enum Opcode {
    /// Read the 96-bit unique id, answered in three chunks
    GetSerialNumber = 0x00,
    /// Read the firmware version
    GetVersion = 0x01,
    /// Read the cause of the last reset. Also sent unsolicited after boot.
    ResetReason = 0x02,
    /// Reset the device
    ResetAll = 0x03,
    /// Start the ADC conversion loop
    StartAdc = 0x04,
    /// Latest sensor value and timestamp, by channel mask
    GetSensorLast = 0x30,
    /// Averaged sensor value and timestamp, by channel mask
    GetSensorAverage = 0x31,
    /// Drive a GPIO pin
    WriteGpio = 0xA2,
    /// Set a DAC output in raw counts, by subdevice mask
    SetDacRaw = 0xC2,
    /// Set a DAC output in SI units, by subdevice mask
    SetDacSi = 0xC3,
    /// Set the averaging mode, by channel mask
    SetAveragingMode = 0xD0,
    /// Set the exponential averaging factor, by channel mask
    SetAveragingAlpha = 0xD1,
    /// Set the sampling interval in milliseconds, by channel mask
    SetTimeInterval = 0xD2,
    /// Set the linear coefficient `a`, by channel mask
    SetCoefficientA = 0xD3,
    /// Set the offset coefficient `b`, by channel mask
    SetCoefficientB = 0xD4,
    /// Set the multiplicator, by channel mask
    SetMultiplicator = 0xD5,
    /// Read the averaging mode, by channel mask
    GetAveragingMode = 0xD6,
    /// Read the exponential averaging factor, by channel mask
    GetAveragingAlpha = 0xD7,
    /// Read the sampling interval, by channel mask
    GetTimeInterval = 0xD8,
    /// Read `a`, `b` and the multiplicator, by channel mask
    GetCoefficients = 0xD9,
    /// Set the regulator optimal temperature, by subdevice mask
    SetRegulatorTOpt = 0xE5,
    /// Set the regulator voltage/temperature slope, by subdevice mask
    SetRegulatorDvDt = 0xE6,
    /// Set the regulator base voltage, by subdevice mask
    SetRegulatorV0 = 0xE7,
    /// Set the regulator base temperature, by subdevice mask
    SetRegulatorT0 = 0xE8,
    /// Enable or disable the regulator loop, by subdevice mask
    SetRegulatorEnabled = 0xE9,
}

/// An opcode byte that is not part of the command set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct UnknownOpcode(pub u8);

impl TryFrom<u8> for Opcode {
    type Error = UnknownOpcode;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use Opcode::*;
        Ok(match value {
            0x00 => GetSerialNumber,
            0x01 => GetVersion,
            0x02 => ResetReason,
            0x03 => ResetAll,
            0x04 => StartAdc,
            0x30 => GetSensorLast,
            0x31 => GetSensorAverage,
            0xA2 => WriteGpio,
            0xC2 => SetDacRaw,
            0xC3 => SetDacSi,
            0xD0 => SetAveragingMode,
            0xD1 => SetAveragingAlpha,
            0xD2 => SetTimeInterval,
            0xD3 => SetCoefficientA,
            0xD4 => SetCoefficientB,
            0xD5 => SetMultiplicator,
            0xD6 => GetAveragingMode,
            0xD7 => GetAveragingAlpha,
            0xD8 => GetTimeInterval,
            0xD9 => GetCoefficients,
            0xE5 => SetRegulatorTOpt,
            0xE6 => SetRegulatorDvDt,
            0xE7 => SetRegulatorV0,
            0xE8 => SetRegulatorT0,
            0xE9 => SetRegulatorEnabled,
            other => return Err(UnknownOpcode(other)),
        })
    }
}

impl From<Opcode> for u8 {
    fn from(val: Opcode) -> Self {
        val as u8
    }
}

/// Channel averaging mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum AveragingMode {
    /// Raw samples
    None = 0,
    /// Exponential moving average, weighted by alpha
    Exponential = 1,
    /// Plain moving average
    Moving = 2,
}

impl TryFrom<u8> for AveragingMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AveragingMode::None),
            1 => Ok(AveragingMode::Exponential),
            2 => Ok(AveragingMode::Moving),
            other => Err(other),
        }
    }
}

/// Cause of the last device reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ResetReason {
    /// Cold start
    PowerOn,
    /// The device watchdog expired
    Watchdog,
    /// Requested by firmware, e.g. [Opcode::ResetAll]
    Software,
    /// Supply voltage dropped
    BrownOut,
    /// The reset pin was asserted
    Pin,
    /// A code this hub doesn't know
    Unknown(u8),
}

impl From<u8> for ResetReason {
    fn from(value: u8) -> Self {
        match value {
            0 => ResetReason::PowerOn,
            1 => ResetReason::Watchdog,
            2 => ResetReason::Software,
            3 => ResetReason::BrownOut,
            4 => ResetReason::Pin,
            other => ResetReason::Unknown(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_values_are_fixed() {
        assert_eq!(u8::from(Opcode::GetSerialNumber), 0x00);
        assert_eq!(u8::from(Opcode::StartAdc), 0x04);
        assert_eq!(u8::from(Opcode::GetSensorAverage), 0x31);
        assert_eq!(u8::from(Opcode::WriteGpio), 0xA2);
        assert_eq!(u8::from(Opcode::SetDacSi), 0xC3);
        assert_eq!(u8::from(Opcode::GetCoefficients), 0xD9);
        assert_eq!(u8::from(Opcode::SetRegulatorEnabled), 0xE9);
    }

    #[test]
    fn every_opcode_parses_back() {
        for raw in 0..=u8::MAX {
            if let Ok(op) = Opcode::try_from(raw) {
                assert_eq!(u8::from(op), raw);
            }
        }
        assert_eq!(Opcode::try_from(0x05), Err(UnknownOpcode(0x05)));
        assert_eq!(Opcode::try_from(0xFF), Err(UnknownOpcode(0xFF)));
    }

    #[test]
    fn reset_reasons() {
        assert_eq!(ResetReason::from(1), ResetReason::Watchdog);
        assert_eq!(ResetReason::from(0x42), ResetReason::Unknown(0x42));
    }
}
