//! Response dispatch
//!
//! Turns a decoded [MessageEnvelope] into a typed [Response], and applies that
//! response to the state the hub keeps for the device. Every opcode of the
//! command set has an explicit branch; anything else becomes
//! [Response::Unrecognized], which is logged and otherwise ignored.

use crate::{
    codec::{read_f32, read_u16, read_u32, ChannelMask, DecodeError, MessageEnvelope},
    device::{DeviceState, Reading},
    opcode::{AveragingMode, Opcode, ResetReason, UnknownOpcode},
    outcome::GpioState,
    CHANNELS,
};

/// Which sensor value a read returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum SensorKind {
    /// [Opcode::GetSensorLast]
    Last,
    /// [Opcode::GetSensorAverage]
    Average,
}

/// A confirmed channel setting
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum ChannelParam {
    AveragingMode(AveragingMode),
    Alpha(f32),
    TimeInterval(u32),
    A(f32),
    B(f32),
    Multiplicator(f32),
}

/// A confirmed regulator or DAC setting
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum SubdeviceParam {
    TOpt(f32),
    DvDt(f32),
    V0(f32),
    T0(f32),
    Enabled(bool),
    DacRaw(u16),
    DacSi(f32),
}

/// One decoded response chunk
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Response {
    /// One of the three serial number words, `index` is `0..3`
    SerialNumberPart { index: u8, part: u32 },
    /// Firmware version
    FirmwareVersion(u32),
    /// The device (re)booted
    Reset(ResetReason),
    /// Bare acknowledgement of a command without data
    Ack(Opcode),
    /// First half of a sensor reading
    SensorValue {
        kind: SensorKind,
        channel: u8,
        value: f32,
    },
    /// Second half of a sensor reading
    SensorTimestamp {
        kind: SensorKind,
        channel: u8,
        timestamp_ms: u32,
    },
    /// Channel setting, for every channel in `mask`
    Channel {
        mask: ChannelMask,
        param: ChannelParam,
    },
    /// Regulator/DAC setting, bit 0 master, bit 1 slave
    Subdevice { mask: u8, param: SubdeviceParam },
    /// GPIO echo
    Gpio(GpioState),
    /// An opcode this hub doesn't know
    Unrecognized { opcode: u8 },
}

/// Reasons a received frame was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[non_exhaustive]
pub enum ProtocolError {
    /// The frame could not be decoded at all
    Decode(DecodeError),
    /// A request frame, i.e. without the response bit, was received
    NotAResponse,
    /// The opcode is known, but the payload does not fit it
    Malformed {
        /// The raw opcode
        opcode: u8,
    },
    /// A chunk of the executing command arrived out of order
    OutOfSequence {
        /// The chunk id the command waits for
        expected: u8,
        /// The chunk id that arrived
        got: u8,
    },
}

impl From<DecodeError> for ProtocolError {
    fn from(value: DecodeError) -> Self {
        ProtocolError::Decode(value)
    }
}

impl Response {
    /// Decode the payload of a response envelope
    pub fn decode(env: &MessageEnvelope) -> Result<Response, ProtocolError> {
        let op = match Opcode::try_from(env.opcode) {
            Ok(op) => op,
            Err(UnknownOpcode(opcode)) => return Ok(Response::Unrecognized { opcode }),
        };
        let p = env.payload();
        let malformed = ProtocolError::Malformed { opcode: env.opcode };

        let resp = match op {
            Opcode::GetSerialNumber => {
                let index = env.chunk_id - 1;
                if index >= 3 {
                    return Err(malformed);
                }
                let part = read_u32(p, 0).ok_or(malformed)?;
                Response::SerialNumberPart { index, part }
            }
            Opcode::GetVersion => Response::FirmwareVersion(read_u32(p, 0).ok_or(malformed)?),
            Opcode::ResetReason => {
                let code = *p.first().ok_or(malformed)?;
                Response::Reset(ResetReason::from(code))
            }
            Opcode::ResetAll | Opcode::StartAdc => Response::Ack(op),
            Opcode::GetSensorLast | Opcode::GetSensorAverage => {
                let kind = if op == Opcode::GetSensorLast {
                    SensorKind::Last
                } else {
                    SensorKind::Average
                };
                let channel = *p.first().ok_or(malformed)?;
                if channel > ChannelMask::TIMESTAMP {
                    return Err(malformed);
                }
                // Odd chunks carry the value, even chunks the timestamp
                if env.chunk_id % 2 == 1 {
                    let value = read_f32(p, 1).ok_or(malformed)?;
                    Response::SensorValue {
                        kind,
                        channel,
                        value,
                    }
                } else {
                    let timestamp_ms = read_u32(p, 1).ok_or(malformed)?;
                    Response::SensorTimestamp {
                        kind,
                        channel,
                        timestamp_ms,
                    }
                }
            }
            Opcode::WriteGpio => match p {
                [port, pin, value, ..] => Response::Gpio(GpioState {
                    port: *port,
                    pin: *pin,
                    value: *value != 0,
                }),
                _ => return Err(malformed),
            },
            Opcode::SetDacRaw => subdevice(p, |b| read_u16(b, 1).map(SubdeviceParam::DacRaw))
                .ok_or(malformed)?,
            Opcode::SetDacSi => subdevice(p, |b| read_f32(b, 1).map(SubdeviceParam::DacSi))
                .ok_or(malformed)?,
            Opcode::SetRegulatorTOpt => {
                subdevice(p, |b| read_f32(b, 1).map(SubdeviceParam::TOpt)).ok_or(malformed)?
            }
            Opcode::SetRegulatorDvDt => {
                subdevice(p, |b| read_f32(b, 1).map(SubdeviceParam::DvDt)).ok_or(malformed)?
            }
            Opcode::SetRegulatorV0 => {
                subdevice(p, |b| read_f32(b, 1).map(SubdeviceParam::V0)).ok_or(malformed)?
            }
            Opcode::SetRegulatorT0 => {
                subdevice(p, |b| read_f32(b, 1).map(SubdeviceParam::T0)).ok_or(malformed)?
            }
            Opcode::SetRegulatorEnabled => {
                subdevice(p, |b| b.get(1).map(|v| SubdeviceParam::Enabled(*v != 0)))
                    .ok_or(malformed)?
            }
            // Setters echo `[mask, value]`
            Opcode::SetAveragingMode => by_mask(p, averaging_mode).ok_or(malformed)?,
            Opcode::SetAveragingAlpha => {
                by_mask(p, |b| read_f32(b, 1).map(ChannelParam::Alpha)).ok_or(malformed)?
            }
            Opcode::SetTimeInterval => {
                by_mask(p, |b| read_u32(b, 1).map(ChannelParam::TimeInterval)).ok_or(malformed)?
            }
            Opcode::SetCoefficientA => {
                by_mask(p, |b| read_f32(b, 1).map(ChannelParam::A)).ok_or(malformed)?
            }
            Opcode::SetCoefficientB => {
                by_mask(p, |b| read_f32(b, 1).map(ChannelParam::B)).ok_or(malformed)?
            }
            Opcode::SetMultiplicator => {
                by_mask(p, |b| read_f32(b, 1).map(ChannelParam::Multiplicator)).ok_or(malformed)?
            }
            // Getters answer one `[channel, value]` chunk per channel
            Opcode::GetAveragingMode => by_channel(p, averaging_mode).ok_or(malformed)?,
            Opcode::GetAveragingAlpha => {
                by_channel(p, |b| read_f32(b, 1).map(ChannelParam::Alpha)).ok_or(malformed)?
            }
            Opcode::GetTimeInterval => {
                by_channel(p, |b| read_u32(b, 1).map(ChannelParam::TimeInterval))
                    .ok_or(malformed)?
            }
            // ...except coefficients, which take three chunks: a, b, multiplicator
            Opcode::GetCoefficients => {
                let field = (env.chunk_id - 1) % 3;
                by_channel(p, |b| {
                    let v = read_f32(b, 1)?;
                    Some(match field {
                        0 => ChannelParam::A(v),
                        1 => ChannelParam::B(v),
                        _ => ChannelParam::Multiplicator(v),
                    })
                })
                .ok_or(malformed)?
            }
        };
        Ok(resp)
    }
}

fn averaging_mode(p: &[u8]) -> Option<ChannelParam> {
    let raw = *p.get(1)?;
    AveragingMode::try_from(raw)
        .ok()
        .map(ChannelParam::AveragingMode)
}

fn by_mask(p: &[u8], f: impl FnOnce(&[u8]) -> Option<ChannelParam>) -> Option<Response> {
    let mask = ChannelMask(*p.first()?);
    Some(Response::Channel { mask, param: f(p)? })
}

fn by_channel(p: &[u8], f: impl FnOnce(&[u8]) -> Option<ChannelParam>) -> Option<Response> {
    let channel = *p.first()?;
    if channel as usize >= CHANNELS {
        return None;
    }
    Some(Response::Channel {
        mask: ChannelMask::single(channel),
        param: f(p)?,
    })
}

fn subdevice(p: &[u8], f: impl FnOnce(&[u8]) -> Option<SubdeviceParam>) -> Option<Response> {
    let mask = *p.first()?;
    Some(Response::Subdevice { mask, param: f(p)? })
}

/// Apply a response to the hub's view of the device
///
/// Only confirmed values end up here, nothing is assumed from the requests.
pub fn apply(state: &mut DeviceState, resp: &Response) {
    match *resp {
        Response::SerialNumberPart { index, part } => {
            if index == 0 {
                state.serial_parts = [None; 3];
            }
            state.serial_parts[index as usize] = Some(part);
            if let [Some(a), Some(b), Some(c)] = state.serial_parts {
                if state.unique_id != Some([a, b, c]) {
                    hub_info!(
                        "Device {=u8} serial {=u32:08x}-{=u32:08x}-{=u32:08x}",
                        state.short_id,
                        a,
                        b,
                        c
                    );
                }
                state.unique_id = Some([a, b, c]);
            }
        }
        Response::FirmwareVersion(v) => {
            hub_debug!("Device {=u8} firmware {=u32}", state.short_id, v);
            state.firmware_version = Some(v);
        }
        Response::Reset(reason) => {
            hub_warn!("Device {=u8} was reset: {}", state.short_id, reason);
            state.on_reset(reason);
        }
        Response::Ack(Opcode::StartAdc) => state.adc_running = true,
        Response::Ack(Opcode::ResetAll) => state.configured = false,
        Response::Ack(_) => {}
        Response::SensorValue {
            kind,
            channel,
            value,
        } => {
            state.pending_value = Some((kind, channel, value));
        }
        Response::SensorTimestamp {
            kind,
            channel,
            timestamp_ms,
        } => {
            let Some((pk, pc, value)) = state.pending_value.take() else {
                hub_warn!("Device {=u8} timestamp without value", state.short_id);
                return;
            };
            if pk != kind || pc != channel {
                hub_warn!("Device {=u8} reading mixed channels", state.short_id);
                return;
            }
            let reading = Reading {
                timestamp_ms,
                value,
            };
            match state.channels.get_mut(channel as usize) {
                Some(ch) if kind == SensorKind::Last => ch.latest_reading = Some(reading),
                Some(ch) => ch.average_reading = Some(reading),
                None => state.clock = Some(reading),
            }
        }
        Response::Channel { mask, param } => {
            if mask.is_timestamp() {
                hub_debug!("Device {=u8} timestamp channel setting ignored", state.short_id);
                return;
            }
            for c in mask.channels() {
                if let Some(ch) = state.channels.get_mut(c as usize) {
                    ch.set(param);
                }
            }
        }
        Response::Subdevice { mask, param } => {
            for (i, sub) in state.subdevices.iter_mut().enumerate() {
                if mask & (1u8 << i) != 0 {
                    sub.set(param);
                }
            }
        }
        Response::Gpio(_) => {}
        Response::Unrecognized { opcode } => {
            hub_warn!("Device {=u8} unrecognized opcode {=u8:02x}", state.short_id, opcode);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode};

    fn response(short_id: u8, opcode: u8, payload: &[u8], chunk: u8, max: u8) -> MessageEnvelope {
        let id = (1u16 << 10) | ((short_id as u16) << 2);
        decode(id, &encode(opcode, payload, chunk, max)).unwrap()
    }

    fn f32_payload(lead: u8, v: f32) -> [u8; 5] {
        let b = v.to_le_bytes();
        [lead, b[0], b[1], b[2], b[3]]
    }

    #[test]
    fn serial_number_assembles() {
        let mut state = DeviceState::new(35);
        let parts = [0x1234_5678u32, 0xABCD_EF01, 0x9876_5432];
        for (i, part) in parts.iter().enumerate() {
            let env = response(35, 0x00, &part.to_le_bytes(), i as u8 + 1, 3);
            let resp = Response::decode(&env).unwrap();
            assert_eq!(
                resp,
                Response::SerialNumberPart {
                    index: i as u8,
                    part: *part
                }
            );
            apply(&mut state, &resp);
        }
        assert_eq!(state.unique_id, Some(parts));
    }

    #[test]
    fn unknown_opcode_is_unrecognized() {
        let env = response(3, 0x77, &[1, 2], 1, 1);
        let resp = Response::decode(&env).unwrap();
        assert_eq!(resp, Response::Unrecognized { opcode: 0x77 });
        let mut state = DeviceState::new(3);
        let before = state.clone();
        apply(&mut state, &resp);
        assert_eq!(state, before);
    }

    #[test]
    fn setter_echo_updates_masked_channels() {
        let mut state = DeviceState::new(3);
        let env = response(3, 0xD1, &f32_payload(0b101, 0.5), 1, 1);
        let resp = Response::decode(&env).unwrap();
        apply(&mut state, &resp);
        assert_eq!(state.channels[0].alpha, Some(0.5));
        assert_eq!(state.channels[1].alpha, None);
        assert_eq!(state.channels[2].alpha, Some(0.5));
    }

    #[test]
    fn timestamp_mask_leaves_channels_alone() {
        let mut state = DeviceState::new(3);
        let env = response(3, 0xD2, &[0x00, 100, 0, 0, 0], 1, 1);
        let resp = Response::decode(&env).unwrap();
        apply(&mut state, &resp);
        assert!(state.channels.iter().all(|c| c.time_interval_ms.is_none()));
    }

    #[test]
    fn sensor_pairs_build_readings() {
        let mut state = DeviceState::new(3);
        let frames = [
            response(3, 0x30, &f32_payload(1, 21.5), 1, 4),
            response(3, 0x30, &[1, 0xE8, 0x03, 0, 0], 2, 4),
            response(3, 0x30, &f32_payload(8, 0.0), 3, 4),
            response(3, 0x30, &[8, 0xD0, 0x07, 0, 0], 4, 4),
        ];
        for env in frames.iter() {
            let resp = Response::decode(env).unwrap();
            apply(&mut state, &resp);
        }
        assert_eq!(
            state.channels[1].latest_reading,
            Some(Reading {
                timestamp_ms: 1000,
                value: 21.5
            })
        );
        assert_eq!(state.channels[1].average_reading, None);
        assert_eq!(state.clock.map(|r| r.timestamp_ms), Some(2000));
    }

    #[test]
    fn average_reading_kept_apart() {
        let mut state = DeviceState::new(3);
        for env in [
            response(3, 0x31, &f32_payload(0, 3.0), 1, 2),
            response(3, 0x31, &[0, 10, 0, 0, 0], 2, 2),
        ] {
            apply(&mut state, &Response::decode(&env).unwrap());
        }
        assert_eq!(state.channels[0].latest_reading, None);
        assert_eq!(state.channels[0].average_reading.map(|r| r.value), Some(3.0));
    }

    #[test]
    fn coefficients_by_chunk() {
        let mut state = DeviceState::new(3);
        for (i, v) in [2.0f32, -1.0, 0.5].iter().enumerate() {
            let env = response(3, 0xD9, &f32_payload(6, *v), i as u8 + 1, 3);
            apply(&mut state, &Response::decode(&env).unwrap());
        }
        let ch = &state.channels[6];
        assert_eq!((ch.a, ch.b, ch.multiplicator), (Some(2.0), Some(-1.0), Some(0.5)));
    }

    #[test]
    fn reset_clears_confirmed_settings() {
        let mut state = DeviceState::new(3);
        state.configured = true;
        state.adc_running = true;
        state.channels[0].alpha = Some(0.1);
        let env = response(3, 0x02, &[1], 1, 1);
        let resp = Response::decode(&env).unwrap();
        assert_eq!(resp, Response::Reset(ResetReason::Watchdog));
        apply(&mut state, &resp);
        assert!(!state.configured);
        assert!(!state.adc_running);
        assert_eq!(state.channels[0].alpha, None);
        assert_eq!(state.last_reset, Some(ResetReason::Watchdog));
    }

    #[test]
    fn malformed_payloads() {
        let env = response(3, 0x00, &[1, 2, 3, 4], 4, 4);
        assert_eq!(
            Response::decode(&env),
            Err(ProtocolError::Malformed { opcode: 0x00 })
        );
        let env = response(3, 0xD0, &[1, 9], 1, 1);
        assert_eq!(
            Response::decode(&env),
            Err(ProtocolError::Malformed { opcode: 0xD0 })
        );
        let env = response(3, 0x30, &[9, 0, 0, 0, 0], 1, 2);
        assert_eq!(
            Response::decode(&env),
            Err(ProtocolError::Malformed { opcode: 0x30 })
        );
    }

    #[test]
    fn dac_and_regulator_by_subdevice() {
        let mut state = DeviceState::new(3);
        let env = response(3, 0xC2, &[0b01, 0x34, 0x12], 1, 1);
        apply(&mut state, &Response::decode(&env).unwrap());
        let env = response(3, 0xE9, &[0b11, 1], 1, 1);
        apply(&mut state, &Response::decode(&env).unwrap());
        assert_eq!(state.subdevices[0].dac_raw, Some(0x1234));
        assert_eq!(state.subdevices[1].dac_raw, None);
        assert_eq!(state.subdevices[1].regulator_enabled, Some(true));
    }
}
