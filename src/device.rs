//! Devices
//!
//! The hub keeps one [Device] per short id it has heard from. A device owns
//! the hub's view of the board ([DeviceState]), which is only ever updated
//! from confirmed responses, and the [CommandExecutor] for commands sent to it.
//!
//! A device that has answered but is not yet configured walks a fixed
//! checklist, one command at a time:
//!
//! 1. read the serial number
//! 2. read the firmware version
//! 3. for each channel `0..8`, push every configured setting that differs
//!    from the confirmed one, in the order averaging mode, alpha, time
//!    interval, `a`, `b`, multiplicator
//! 4. start the ADC
//!
//! Once nothing is missing, the device is marked configured and, if a poll
//! interval is set, polled for its latest sensor values.

use embassy_time::{Duration, Instant};

use crate::{
    codec::{CanFrame, ChannelMask, MessageEnvelope},
    config::{ChannelConfig, DeviceConfig, HubConfig},
    dispatch::{self, ChannelParam, ProtocolError, Response, SensorKind, SubdeviceParam},
    executor::{
        CommandError, CommandExecutor, CommandRequest, EnqueueError, Finished, PendingCommand,
        MAX_TIMEOUTS,
    },
    opcode::{AveragingMode, Opcode, ResetReason},
    outcome::SUBDEVICES,
    Priority, CHANNELS,
};

/// Channels polled by the first sensor request
pub const POLL_LOW: ChannelMask = ChannelMask(0x0F);

/// Channels polled by the second sensor request
pub const POLL_HIGH: ChannelMask = ChannelMask(0xF0);

/// A sensor value with the device timestamp it was taken at
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Reading {
    /// Milliseconds since the device booted
    pub timestamp_ms: u32,
    /// The value, in the unit given by the channel coefficients
    pub value: f32,
}

/// Confirmed settings and readings of one analog channel
///
/// Settings mirror [ChannelConfig], readings are kept per sensor request kind.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Channel {
    pub averaging_mode: Option<AveragingMode>,
    pub alpha: Option<f32>,
    pub time_interval_ms: Option<u32>,
    pub a: Option<f32>,
    pub b: Option<f32>,
    pub multiplicator: Option<f32>,
    pub latest_reading: Option<Reading>,
    pub average_reading: Option<Reading>,
}

impl Channel {
    pub(crate) fn set(&mut self, param: ChannelParam) {
        match param {
            ChannelParam::AveragingMode(m) => self.averaging_mode = Some(m),
            ChannelParam::Alpha(v) => self.alpha = Some(v),
            ChannelParam::TimeInterval(v) => self.time_interval_ms = Some(v),
            ChannelParam::A(v) => self.a = Some(v),
            ChannelParam::B(v) => self.b = Some(v),
            ChannelParam::Multiplicator(v) => self.multiplicator = Some(v),
        }
    }

    /// Forget the confirmed settings, keeping the readings
    fn forget_settings(&mut self) {
        *self = Channel {
            latest_reading: self.latest_reading,
            average_reading: self.average_reading,
            ..Channel::default()
        };
    }

    /// The first setting in `want` that this channel doesn't have yet
    ///
    /// Floats are compared bit for bit, so a NaN setting is confirmed by a
    /// NaN echo.
    fn missing(&self, index: u8, want: &ChannelConfig) -> Option<CommandRequest> {
        let mask = ChannelMask::single(index);
        if let Some(m) = want.averaging_mode.filter(|m| self.averaging_mode != Some(*m)) {
            return Some(CommandRequest::set_averaging_mode(mask, m));
        }
        if let Some(v) = want.alpha.filter(|v| !same_bits(self.alpha, *v)) {
            return Some(CommandRequest::set_alpha(mask, v));
        }
        if let Some(v) = want
            .time_interval_ms
            .filter(|v| self.time_interval_ms != Some(*v))
        {
            return Some(CommandRequest::set_time_interval(mask, v));
        }
        if let Some(v) = want.a.filter(|v| !same_bits(self.a, *v)) {
            return Some(CommandRequest::set_a(mask, v));
        }
        if let Some(v) = want.b.filter(|v| !same_bits(self.b, *v)) {
            return Some(CommandRequest::set_b(mask, v));
        }
        if let Some(v) = want
            .multiplicator
            .filter(|v| !same_bits(self.multiplicator, *v))
        {
            return Some(CommandRequest::set_multiplicator(mask, v));
        }
        None
    }
}

fn same_bits(have: Option<f32>, want: f32) -> bool {
    have.is_some_and(|h| h.to_bits() == want.to_bits())
}

/// Confirmed settings of one regulator/DAC subdevice
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Subdevice {
    pub t_opt: Option<f32>,
    pub dv_dt: Option<f32>,
    pub v0: Option<f32>,
    pub t0: Option<f32>,
    pub regulator_enabled: Option<bool>,
    pub dac_raw: Option<u16>,
    pub dac_si: Option<f32>,
}

impl Subdevice {
    pub(crate) fn set(&mut self, param: SubdeviceParam) {
        match param {
            SubdeviceParam::TOpt(v) => self.t_opt = Some(v),
            SubdeviceParam::DvDt(v) => self.dv_dt = Some(v),
            SubdeviceParam::V0(v) => self.v0 = Some(v),
            SubdeviceParam::T0(v) => self.t0 = Some(v),
            SubdeviceParam::Enabled(v) => self.regulator_enabled = Some(v),
            SubdeviceParam::DacRaw(v) => self.dac_raw = Some(v),
            SubdeviceParam::DacSi(v) => self.dac_si = Some(v),
        }
    }
}

/// The hub's view of a device
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceState {
    /// The 8-bit bus address
    pub short_id: u8,
    /// The 96-bit serial number, once all three words were received
    pub unique_id: Option<[u32; 3]>,
    /// Firmware version word
    pub firmware_version: Option<u32>,
    /// Reason of the last reset the device reported
    pub last_reset: Option<ResetReason>,
    /// Answered recently, see [MAX_TIMEOUTS]
    pub online: bool,
    /// Every configured setting was confirmed
    pub configured: bool,
    /// The device acknowledged [Opcode::StartAdc]
    pub adc_running: bool,
    /// Analog channels, by index
    pub channels: [Channel; CHANNELS],
    /// Bit 0 master, bit 1 slave
    pub subdevices: [Subdevice; SUBDEVICES],
    /// Device clock, as reported on the timestamp pseudo-channel
    pub clock: Option<Reading>,
    #[cfg_attr(feature = "serde", serde(skip))]
    pub(crate) serial_parts: [Option<u32>; 3],
    #[cfg_attr(feature = "serde", serde(skip))]
    pub(crate) pending_value: Option<(SensorKind, u8, f32)>,
}

impl DeviceState {
    /// A device we know nothing about yet
    pub const fn new(short_id: u8) -> Self {
        const CH: Channel = Channel {
            averaging_mode: None,
            alpha: None,
            time_interval_ms: None,
            a: None,
            b: None,
            multiplicator: None,
            latest_reading: None,
            average_reading: None,
        };
        const SUB: Subdevice = Subdevice {
            t_opt: None,
            dv_dt: None,
            v0: None,
            t0: None,
            regulator_enabled: None,
            dac_raw: None,
            dac_si: None,
        };
        Self {
            short_id,
            unique_id: None,
            firmware_version: None,
            last_reset: None,
            online: true,
            configured: false,
            adc_running: false,
            channels: [CH; CHANNELS],
            subdevices: [SUB; SUBDEVICES],
            clock: None,
            serial_parts: [None; 3],
            pending_value: None,
        }
    }

    /// The device rebooted: all settings are back to its defaults
    pub(crate) fn on_reset(&mut self, reason: ResetReason) {
        self.last_reset = Some(reason);
        self.configured = false;
        self.adc_running = false;
        self.pending_value = None;
        self.channels.iter_mut().for_each(Channel::forget_settings);
        self.subdevices = [Subdevice::default(); SUBDEVICES];
    }
}

/// A copy of everything the hub knows about a device
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceSnapshot {
    /// Confirmed state
    pub state: DeviceState,
    /// Hub uptime when the device last answered
    pub last_seen_ms: Option<u64>,
    /// Commands waiting behind the executing one
    pub queued: usize,
    /// Opcode of the command in flight
    pub executing: Option<Opcode>,
    /// See [MAX_TIMEOUTS]
    pub consecutive_timeouts: u8,
}

/// A device on the bus, and the commands in flight to it
pub struct Device {
    state: DeviceState,
    executor: CommandExecutor,
    defaults: HubConfig,
    now: Instant,
    last_seen: Option<Instant>,
    last_poll: Option<Instant>,
    last_presence: Option<Instant>,
}

impl Device {
    pub(crate) fn new(short_id: u8, defaults: HubConfig, now: Instant) -> Self {
        Self {
            state: DeviceState::new(short_id),
            executor: CommandExecutor::new(),
            defaults,
            now,
            last_seen: None,
            last_poll: None,
            last_presence: None,
        }
    }

    /// The 8-bit bus address
    #[inline]
    pub fn short_id(&self) -> u8 {
        self.state.short_id
    }

    /// Confirmed state of the device
    #[inline]
    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// The command executor of this device
    #[inline]
    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Has the device answered since its last three timeouts?
    #[inline]
    pub fn is_online(&self) -> bool {
        self.state.online
    }

    /// Queue a command for this device
    ///
    /// May be called from a completion callback.
    pub fn enqueue(&mut self, req: CommandRequest) -> Result<(), EnqueueError> {
        let cmd = PendingCommand::new(self.short_id(), &req, &self.defaults, self.now);
        self.executor.enqueue(cmd).map_err(|c| {
            hub_warn!(
                "Device {=u8} queue full, dropping {}",
                self.state.short_id,
                c.opcode
            );
            EnqueueError::QueueFull
        })
    }

    /// Handle a response envelope addressed from this device
    ///
    /// Everything that decodes is applied to the state. Only chunks of the
    /// executing command, in order, go into its outcome.
    pub(crate) fn handle(&mut self, env: &MessageEnvelope, now: Instant) -> Result<(), ProtocolError> {
        self.now = now;
        self.mark_seen(now);

        let resp = Response::decode(env)?;
        dispatch::apply(&mut self.state, &resp);

        if self.executor.check_chunk(env)? {
            if let Some(done) = self.executor.on_response(env, &resp, now) {
                self.finish(done);
            }
        }
        Ok(())
    }

    fn mark_seen(&mut self, now: Instant) {
        if !self.state.online {
            hub_info!("Device {=u8} back online", self.state.short_id);
            self.state.online = true;
        }
        self.last_seen = Some(now);
    }

    /// Time out the executing command, then queue whatever the device needs
    /// next
    ///
    /// An offline device is only sent a presence request every
    /// `offline_retry_interval`, until it answers.
    pub(crate) fn tick(&mut self, now: Instant, config: Option<&DeviceConfig>) {
        self.now = now;
        if let Some(done) = self.executor.check_timeout(now) {
            self.finish(done);
        }
        if !self.executor.is_idle() {
            return;
        }
        if !self.state.online {
            self.check_presence(now);
            return;
        }

        if !self.state.configured {
            match self.next_setting(config) {
                Some(req) => {
                    let _ = self.enqueue(req);
                }
                None => {
                    hub_info!("Device {=u8} configured", self.state.short_id);
                    self.state.configured = true;
                }
            }
            return;
        }

        let Some(interval) = config.and_then(|c| c.poll_interval) else {
            return;
        };
        let due = self
            .last_poll
            .map_or(true, |at| now.saturating_duration_since(at) >= interval);
        if due {
            self.last_poll = Some(now);
            // The executor is idle, so both fit
            let _ = self.enqueue(CommandRequest::sensor_last(POLL_LOW));
            let _ = self.enqueue(CommandRequest::sensor_last(POLL_HIGH));
        }
    }

    fn check_presence(&mut self, now: Instant) {
        let due = self.last_presence.map_or(true, |at| {
            now.saturating_duration_since(at) >= self.defaults.offline_retry_interval
        });
        if due {
            self.last_presence = Some(now);
            hub_debug!("Device {=u8} offline, checking presence", self.state.short_id);
            let _ = self.enqueue(CommandRequest::get_serial_number().with_priority(Priority::Low));
        }
    }

    /// The next configuration command, or [None] if fully configured
    pub fn next_setting(&self, config: Option<&DeviceConfig>) -> Option<CommandRequest> {
        let st = &self.state;
        if st.unique_id.is_none() {
            return Some(CommandRequest::get_serial_number());
        }
        if st.firmware_version.is_none() {
            return Some(CommandRequest::get_version());
        }
        if let Some(cfg) = config {
            let missing = st
                .channels
                .iter()
                .zip(cfg.channels.iter())
                .enumerate()
                .find_map(|(i, (have, want))| have.missing(i as u8, want));
            if missing.is_some() {
                return missing;
            }
        }
        if !st.adc_running {
            return Some(CommandRequest::start_adc());
        }
        None
    }

    /// Start the next queued command, if allowed
    pub(crate) fn next_frame(&mut self, now: Instant) -> Option<(CanFrame, Duration)> {
        self.now = now;
        self.executor
            .start_next(now, self.defaults.inter_command_delay)
    }

    /// The frame of the executing command could not be sent
    pub(crate) fn send_failed(&mut self, now: Instant) {
        self.now = now;
        if let Some(done) = self.executor.send_failed(now) {
            self.finish(done);
        }
    }

    fn finish(&mut self, done: Finished) {
        match done.result {
            Ok(_) => hub_trace!("Device {=u8} {} done", self.state.short_id, done.command.opcode),
            Err(e) => hub_warn!(
                "Device {=u8} {} failed: {}",
                self.state.short_id,
                done.command.opcode,
                e
            ),
        }
        if done.result == Err(CommandError::Timeout)
            && self.executor.consecutive_timeouts() >= MAX_TIMEOUTS
            && self.state.online
        {
            hub_warn!("Device {=u8} offline", self.state.short_id);
            self.state.online = false;
            self.last_presence = Some(done.at);
        }
        if done.command.preserve {
            self.executor.archive(&done);
        }
        done.notify(self);
    }

    /// A copy of everything the hub knows about this device
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            state: self.state.clone(),
            last_seen_ms: self.last_seen.map(|t| t.as_millis()),
            queued: self.executor.queued(),
            executing: self.executor.executing(),
            consecutive_timeouts: self.executor.consecutive_timeouts(),
        }
    }
}
