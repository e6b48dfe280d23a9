//! Accumulated command results
//!
//! A response may arrive as up to fifteen chunks. Each decoded chunk is a
//! [Response]; the executing command folds them into a [CommandOutcome] with
//! [CommandOutcome::merge()]. The merge rules are:
//!
//! * scalar fields (firmware version, reset reason, GPIO echo) are overwritten
//!   by the newest chunk
//! * nested fields (serial number parts, per channel and per subdevice
//!   fields) are merged field by field, so a later chunk only overwrites the
//!   fields it carries

use crate::{
    codec::ChannelMask,
    dispatch::{ChannelParam, Response, SensorKind, SubdeviceParam},
    opcode::{AveragingMode, ResetReason},
    CHANNELS,
};

/// Number of regulator/DAC subdevices on a board
pub const SUBDEVICES: usize = 2;

/// Result fields of one channel, including the timestamp pseudo-channel
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[allow(missing_docs)]
pub struct ChannelOutcome {
    pub averaging_mode: Option<AveragingMode>,
    pub alpha: Option<f32>,
    pub time_interval_ms: Option<u32>,
    pub a: Option<f32>,
    pub b: Option<f32>,
    pub multiplicator: Option<f32>,
    /// Sensor value, last or average depending on the command
    pub value: Option<f32>,
    /// Device timestamp of `value`, milliseconds
    pub timestamp_ms: Option<u32>,
}

impl ChannelOutcome {
    fn set(&mut self, param: &ChannelParam) {
        match *param {
            ChannelParam::AveragingMode(m) => self.averaging_mode = Some(m),
            ChannelParam::Alpha(v) => self.alpha = Some(v),
            ChannelParam::TimeInterval(v) => self.time_interval_ms = Some(v),
            ChannelParam::A(v) => self.a = Some(v),
            ChannelParam::B(v) => self.b = Some(v),
            ChannelParam::Multiplicator(v) => self.multiplicator = Some(v),
        }
    }

    /// Does this channel carry any result?
    pub fn is_empty(&self) -> bool {
        *self == ChannelOutcome::default()
    }
}

/// Result fields of one regulator/DAC subdevice
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[allow(missing_docs)]
pub struct SubdeviceOutcome {
    pub t_opt: Option<f32>,
    pub dv_dt: Option<f32>,
    pub v0: Option<f32>,
    pub t0: Option<f32>,
    pub enabled: Option<bool>,
    pub dac_raw: Option<u16>,
    pub dac_si: Option<f32>,
}

impl SubdeviceOutcome {
    fn set(&mut self, param: &SubdeviceParam) {
        match *param {
            SubdeviceParam::TOpt(v) => self.t_opt = Some(v),
            SubdeviceParam::DvDt(v) => self.dv_dt = Some(v),
            SubdeviceParam::V0(v) => self.v0 = Some(v),
            SubdeviceParam::T0(v) => self.t0 = Some(v),
            SubdeviceParam::Enabled(v) => self.enabled = Some(v),
            SubdeviceParam::DacRaw(v) => self.dac_raw = Some(v),
            SubdeviceParam::DacSi(v) => self.dac_si = Some(v),
        }
    }
}

/// GPIO state echoed by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct GpioState {
    /// GPIO port index
    pub port: u8,
    /// Pin within the port
    pub pin: u8,
    /// Output level
    pub value: bool,
}

/// Everything a device answered to one command
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CommandOutcome {
    /// Serial number words, by chunk
    pub serial: [Option<u32>; 3],
    /// Firmware version word
    pub firmware_version: Option<u32>,
    /// Reason given in a reset notification
    pub reset_reason: Option<ResetReason>,
    /// Channels `0..8`, then the timestamp pseudo-channel
    pub channels: [ChannelOutcome; CHANNELS + 1],
    /// Regulator/DAC confirmations, bit 0 master, bit 1 slave
    pub subdevices: [SubdeviceOutcome; SUBDEVICES],
    /// Echo of a GPIO write
    pub gpio: Option<GpioState>,
    /// Set by commands answered with a bare acknowledgement
    pub acknowledged: bool,
    /// Set for sensor reads that returned averaged values
    pub averaged: bool,
}

impl CommandOutcome {
    /// Fold one decoded chunk into the outcome
    pub fn merge(&mut self, resp: &Response) {
        match resp {
            Response::SerialNumberPart { index, part } => {
                if let Some(slot) = self.serial.get_mut(*index as usize) {
                    *slot = Some(*part);
                }
            }
            Response::FirmwareVersion(v) => self.firmware_version = Some(*v),
            Response::Reset(reason) => self.reset_reason = Some(*reason),
            Response::Ack(_) => self.acknowledged = true,
            Response::SensorValue {
                kind,
                channel,
                value,
            } => {
                self.averaged = *kind == SensorKind::Average;
                if let Some(ch) = self.channels.get_mut(*channel as usize) {
                    ch.value = Some(*value);
                }
            }
            Response::SensorTimestamp {
                kind,
                channel,
                timestamp_ms,
            } => {
                self.averaged = *kind == SensorKind::Average;
                if let Some(ch) = self.channels.get_mut(*channel as usize) {
                    ch.timestamp_ms = Some(*timestamp_ms);
                }
            }
            Response::Channel { mask, param } => self.merge_channels(*mask, param),
            Response::Subdevice { mask, param } => {
                for (i, sub) in self.subdevices.iter_mut().enumerate() {
                    if *mask & (1u8 << i) != 0 {
                        sub.set(param);
                    }
                }
            }
            Response::Gpio(state) => self.gpio = Some(*state),
            Response::Unrecognized { .. } => {}
        }
    }

    fn merge_channels(&mut self, mask: ChannelMask, param: &ChannelParam) {
        for c in mask.channels() {
            if let Some(ch) = self.channels.get_mut(c as usize) {
                ch.set(param);
            }
        }
    }

    /// The 96-bit unique id, once all three parts were received
    pub fn unique_id(&self) -> Option<[u32; 3]> {
        match self.serial {
            [Some(a), Some(b), Some(c)] => Some([a, b, c]),
            _ => None,
        }
    }

    /// Sensor value and timestamp of a channel, if both were received
    pub fn reading(&self, channel: u8) -> Option<(f32, u32)> {
        let ch = self.channels.get(channel as usize)?;
        Some((ch.value?, ch.timestamp_ms?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;

    #[test]
    fn serial_parts_merge() {
        let mut out = CommandOutcome::default();
        out.merge(&Response::SerialNumberPart { index: 0, part: 1 });
        out.merge(&Response::SerialNumberPart { index: 2, part: 3 });
        assert_eq!(out.unique_id(), None);
        out.merge(&Response::SerialNumberPart { index: 1, part: 2 });
        assert_eq!(out.unique_id(), Some([1, 2, 3]));
    }

    #[test]
    fn nested_channel_fields_merge() {
        let mut out = CommandOutcome::default();
        out.merge(&Response::Channel {
            mask: ChannelMask(0b11),
            param: ChannelParam::A(1.0),
        });
        out.merge(&Response::Channel {
            mask: ChannelMask(0b10),
            param: ChannelParam::B(2.0),
        });
        assert_eq!(out.channels[0].a, Some(1.0));
        assert_eq!(out.channels[0].b, None);
        assert_eq!(out.channels[1].a, Some(1.0));
        assert_eq!(out.channels[1].b, Some(2.0));
        assert!(out.channels[2].is_empty());
    }

    #[test]
    fn scalars_overwrite() {
        let mut out = CommandOutcome::default();
        out.merge(&Response::FirmwareVersion(1));
        out.merge(&Response::FirmwareVersion(7));
        assert_eq!(out.firmware_version, Some(7));
        assert!(!out.acknowledged);
        out.merge(&Response::Ack(Opcode::StartAdc));
        assert!(out.acknowledged);
    }

    #[test]
    fn readings_need_both_chunks() {
        let mut out = CommandOutcome::default();
        out.merge(&Response::SensorValue {
            kind: SensorKind::Last,
            channel: 4,
            value: 21.5,
        });
        assert_eq!(out.reading(4), None);
        out.merge(&Response::SensorTimestamp {
            kind: SensorKind::Last,
            channel: 4,
            timestamp_ms: 1000,
        });
        assert_eq!(out.reading(4), Some((21.5, 1000)));
        assert!(!out.averaged);
    }

    #[test]
    fn subdevice_mask() {
        let mut out = CommandOutcome::default();
        out.merge(&Response::Subdevice {
            mask: 0b10,
            param: SubdeviceParam::DacRaw(0x0123),
        });
        assert_eq!(out.subdevices[0].dac_raw, None);
        assert_eq!(out.subdevices[1].dac_raw, Some(0x0123));
    }
}
