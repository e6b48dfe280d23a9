//! Command executor
//!
//! Every device has one [CommandExecutor]: a FIFO of queued commands, at most
//! one executing command, and a short history of finished commands that
//! asked to be preserved.
//!
//! A command moves through [CommandStatus] like this:
//!
//! ```text
//! None --enqueue--> Idle --start_next--> Sent --last chunk--> Received
//!                                          \---timeout------> Error
//!                                           \--send failed--> Error
//! ```
//!
//! The executor never retries on its own. The completion callback is handed the
//! [Device], so it can re-enqueue if it wants to.
//!
//! All methods take the current time as an argument, the executor never reads
//! a clock itself.

use embassy_time::{Duration, Instant};
use heapless::Deque;

use crate::{
    codec::{encode_command, CanFrame, ChannelMask, MessageEnvelope},
    config::HubConfig,
    device::Device,
    dispatch::{ProtocolError, Response},
    opcode::{AveragingMode, Opcode},
    outcome::CommandOutcome,
    CanAddr, Priority,
};

/// The number of commands that can wait behind the executing one
pub const QUEUE_DEPTH: usize = 8;

/// The number of preserved commands kept per device
pub const HISTORY_DEPTH: usize = 4;

/// Consecutive timeouts after which a device is considered offline
pub const MAX_TIMEOUTS: u8 = 3;

/// Lifecycle of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum CommandStatus {
    /// Created, not queued yet
    None,
    /// Waiting in the queue
    Idle,
    /// Sent, waiting for the last chunk
    Sent,
    /// The last chunk arrived
    Received,
    /// Timed out, or could not be sent
    Error,
}

/// Why a command did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[non_exhaustive]
pub enum CommandError {
    /// No last chunk arrived within the command timeout
    Timeout,
    /// The CAN peripheral did not take the frame
    Transport,
}

/// An error when enqueueing a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[non_exhaustive]
pub enum EnqueueError {
    /// No device with this short id is known
    UnknownDevice,
    /// The device's queue is full
    QueueFull,
}

/// Completion callback of a command
///
/// Called synchronously from the hub step that finished the command, with the
/// device the command was sent to.
pub type Completion = fn(&mut Device, Result<&CommandOutcome, CommandError>);

/// A command, as handed to [`Hub::enqueue_command()`][crate::Hub::enqueue_command]
#[derive(Clone, Copy)]
pub struct CommandRequest {
    opcode: Opcode,
    payload: [u8; 6],
    len: u8,
    timeout: Option<Duration>,
    priority: Option<Priority>,
    preserve: bool,
    on_done: Option<Completion>,
}

impl CommandRequest {
    /// A command with a raw payload, truncated to six bytes
    pub fn new(opcode: Opcode, payload: &[u8]) -> Self {
        let len = payload.len().min(6);
        let mut buf = [0u8; 6];
        buf[..len].copy_from_slice(&payload[..len]);
        Self {
            opcode,
            payload: buf,
            len: len as u8,
            timeout: None,
            priority: None,
            preserve: false,
            on_done: None,
        }
    }

    fn with_f32(opcode: Opcode, lead: u8, v: f32) -> Self {
        let b = v.to_le_bytes();
        Self::new(opcode, &[lead, b[0], b[1], b[2], b[3]])
    }

    /// Override the hub's default command timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the hub's default arbitration priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Keep the outcome in the device's history after completion
    pub fn preserve(mut self) -> Self {
        self.preserve = true;
        self
    }

    /// Call `f` when the command completes or fails
    pub fn on_done(mut self, f: Completion) -> Self {
        self.on_done = Some(f);
        self
    }

    /// The opcode of this command
    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// The payload bytes following the chunk header
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.len as usize]
    }

    /// Read the 96-bit serial number
    pub fn get_serial_number() -> Self {
        Self::new(Opcode::GetSerialNumber, &[])
    }

    /// Read the firmware version
    pub fn get_version() -> Self {
        Self::new(Opcode::GetVersion, &[])
    }

    /// Read the reason of the last reset
    pub fn reset_reason() -> Self {
        Self::new(Opcode::ResetReason, &[])
    }

    /// Reset the device to its defaults
    pub fn reset_all() -> Self {
        Self::new(Opcode::ResetAll, &[])
    }

    /// Start sampling
    pub fn start_adc() -> Self {
        Self::new(Opcode::StartAdc, &[])
    }

    /// Latest values of the channels in `mask`
    ///
    /// Every channel takes two chunks, so at most seven channels fit in
    /// one response.
    pub fn sensor_last(mask: ChannelMask) -> Self {
        Self::new(Opcode::GetSensorLast, &[mask.0])
    }

    /// Averaged values of the channels in `mask`, see [Self::sensor_last]
    pub fn sensor_average(mask: ChannelMask) -> Self {
        Self::new(Opcode::GetSensorAverage, &[mask.0])
    }

    /// Drive a GPIO pin
    pub fn write_gpio(port: u8, pin: u8, value: bool) -> Self {
        Self::new(Opcode::WriteGpio, &[port, pin, value as u8])
    }

    /// Set the DAC output in counts
    pub fn set_dac_raw(subdevices: u8, raw: u16) -> Self {
        let b = raw.to_le_bytes();
        Self::new(Opcode::SetDacRaw, &[subdevices, b[0], b[1]])
    }

    /// Set the DAC output in volts
    pub fn set_dac_si(subdevices: u8, volts: f32) -> Self {
        Self::with_f32(Opcode::SetDacSi, subdevices, volts)
    }

    /// Averaging mode of the channels in `mask`
    pub fn set_averaging_mode(mask: ChannelMask, mode: AveragingMode) -> Self {
        Self::new(Opcode::SetAveragingMode, &[mask.0, mode as u8])
    }

    /// Exponential averaging factor
    pub fn set_alpha(mask: ChannelMask, alpha: f32) -> Self {
        Self::with_f32(Opcode::SetAveragingAlpha, mask.0, alpha)
    }

    /// Sampling interval in milliseconds
    pub fn set_time_interval(mask: ChannelMask, ms: u32) -> Self {
        let b = ms.to_le_bytes();
        Self::new(Opcode::SetTimeInterval, &[mask.0, b[0], b[1], b[2], b[3]])
    }

    /// Linear coefficient
    pub fn set_a(mask: ChannelMask, a: f32) -> Self {
        Self::with_f32(Opcode::SetCoefficientA, mask.0, a)
    }

    /// Offset coefficient
    pub fn set_b(mask: ChannelMask, b: f32) -> Self {
        Self::with_f32(Opcode::SetCoefficientB, mask.0, b)
    }

    /// Multiplicator applied after `a` and `b`
    pub fn set_multiplicator(mask: ChannelMask, m: f32) -> Self {
        Self::with_f32(Opcode::SetMultiplicator, mask.0, m)
    }

    /// One chunk per channel
    pub fn get_averaging_mode(mask: ChannelMask) -> Self {
        Self::new(Opcode::GetAveragingMode, &[mask.0])
    }

    /// One chunk per channel
    pub fn get_alpha(mask: ChannelMask) -> Self {
        Self::new(Opcode::GetAveragingAlpha, &[mask.0])
    }

    /// One chunk per channel
    pub fn get_time_interval(mask: ChannelMask) -> Self {
        Self::new(Opcode::GetTimeInterval, &[mask.0])
    }

    /// `a`, `b` and multiplicator of the channels in `mask`, three chunks per
    /// channel, so at most five channels fit in one response
    pub fn get_coefficients(mask: ChannelMask) -> Self {
        Self::new(Opcode::GetCoefficients, &[mask.0])
    }

    /// Regulator target temperature
    pub fn set_regulator_t_opt(subdevices: u8, t: f32) -> Self {
        Self::with_f32(Opcode::SetRegulatorTOpt, subdevices, t)
    }

    /// Regulator voltage/temperature slope
    pub fn set_regulator_dv_dt(subdevices: u8, slope: f32) -> Self {
        Self::with_f32(Opcode::SetRegulatorDvDt, subdevices, slope)
    }

    /// Regulator voltage at `t0`
    pub fn set_regulator_v0(subdevices: u8, v: f32) -> Self {
        Self::with_f32(Opcode::SetRegulatorV0, subdevices, v)
    }

    /// Regulator reference temperature
    pub fn set_regulator_t0(subdevices: u8, t: f32) -> Self {
        Self::with_f32(Opcode::SetRegulatorT0, subdevices, t)
    }

    /// Switch the regulator loop on or off
    pub fn set_regulator_enabled(subdevices: u8, enabled: bool) -> Self {
        Self::new(Opcode::SetRegulatorEnabled, &[subdevices, enabled as u8])
    }
}

/// A command owned by a device's executor
pub struct PendingCommand {
    /// Opcode, also used to match responses
    pub opcode: Opcode,
    /// Where the command goes
    pub target: CanAddr,
    /// When the command was queued
    pub enqueued_at: Instant,
    /// Time the device gets to send the last chunk
    pub command_timeout: Duration,
    /// Time the CAN peripheral gets to take the frame
    pub can_send_timeout: Duration,
    /// Keep in history after completion
    pub preserve: bool,
    /// Current lifecycle state
    pub status: CommandStatus,
    frame: CanFrame,
    on_done: Option<Completion>,
}

impl PendingCommand {
    /// Encode a request for the device at `short_id`
    pub fn new(short_id: u8, req: &CommandRequest, cfg: &HubConfig, now: Instant) -> Self {
        let target = CanAddr::command(short_id, req.priority.unwrap_or(cfg.priority));
        Self {
            opcode: req.opcode,
            target,
            enqueued_at: now,
            command_timeout: req.timeout.unwrap_or(cfg.command_timeout),
            can_send_timeout: cfg.can_send_timeout,
            preserve: req.preserve,
            status: CommandStatus::None,
            frame: encode_command(target, req.opcode.into(), req.payload()),
            on_done: req.on_done,
        }
    }

    /// The encoded frame
    #[inline]
    pub fn frame(&self) -> &CanFrame {
        &self.frame
    }
}

/// A finished command, returned by the executor so the device can run its
/// completion callback
pub struct Finished {
    /// The command, with its final status
    pub command: PendingCommand,
    /// The accumulated outcome, or why there is none
    pub result: Result<CommandOutcome, CommandError>,
    /// When the command finished
    pub at: Instant,
}

impl Finished {
    /// Call the completion callback, if any
    pub(crate) fn notify(&self, device: &mut Device) {
        if let Some(f) = self.command.on_done {
            f(device, self.result.as_ref().map_err(|e| *e));
        }
    }
}

/// A preserved command, kept after completion
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[allow(missing_docs)]
pub struct ExecutedCommand {
    pub opcode: Opcode,
    pub status: CommandStatus,
    pub enqueued_at: Instant,
    pub finished_at: Instant,
    pub result: Result<CommandOutcome, CommandError>,
}

impl From<&Finished> for ExecutedCommand {
    fn from(f: &Finished) -> Self {
        Self {
            opcode: f.command.opcode,
            status: f.command.status,
            enqueued_at: f.command.enqueued_at,
            finished_at: f.at,
            result: f.result,
        }
    }
}

struct InFlight {
    command: PendingCommand,
    sent_at: Instant,
    next_chunk: u8,
    outcome: CommandOutcome,
}

/// Per device command queue and state machine
pub struct CommandExecutor {
    queue: Deque<PendingCommand, QUEUE_DEPTH>,
    executing: Option<InFlight>,
    history: Deque<ExecutedCommand, HISTORY_DEPTH>,
    last_done: Option<Instant>,
    timeouts: u8,
}

impl CommandExecutor {
    /// An empty executor
    pub const fn new() -> Self {
        Self {
            queue: Deque::new(),
            executing: None,
            history: Deque::new(),
            last_done: None,
            timeouts: 0,
        }
    }

    /// Append a command to the queue
    ///
    /// Gives the command back if the queue is full.
    pub fn enqueue(&mut self, mut cmd: PendingCommand) -> Result<(), PendingCommand> {
        cmd.status = CommandStatus::Idle;
        self.queue.push_back(cmd).map_err(|mut c| {
            c.status = CommandStatus::None;
            c
        })
    }

    /// Fail the executing command if its timeout has passed
    ///
    /// The timeout is exceeded only when strictly more than `command_timeout`
    /// elapsed since the command was sent.
    pub fn check_timeout(&mut self, now: Instant) -> Option<Finished> {
        let expired = self.executing.as_ref().is_some_and(|inf| {
            now.saturating_duration_since(inf.sent_at) > inf.command.command_timeout
        });
        if !expired {
            return None;
        }
        let inf = self.executing.take()?;
        self.timeouts = self.timeouts.saturating_add(1);
        Some(self.finish(inf, Err(CommandError::Timeout), now))
    }

    /// Move the queue head to the executing slot, if the executor is idle and
    /// `min_delay` has passed since the last command finished
    ///
    /// Returns the frame to send and the time the peripheral gets to take it.
    pub fn start_next(&mut self, now: Instant, min_delay: Duration) -> Option<(CanFrame, Duration)> {
        if self.executing.is_some() {
            return None;
        }
        if let Some(done) = self.last_done {
            if now.saturating_duration_since(done) < min_delay {
                return None;
            }
        }
        let mut command = self.queue.pop_front()?;
        command.status = CommandStatus::Sent;
        let out = (command.frame, command.can_send_timeout);
        self.executing = Some(InFlight {
            command,
            sent_at: now,
            next_chunk: 1,
            outcome: CommandOutcome::default(),
        });
        Some(out)
    }

    /// Fail the executing command because it could not be sent
    pub fn send_failed(&mut self, now: Instant) -> Option<Finished> {
        let inf = self.executing.take()?;
        Some(self.finish(inf, Err(CommandError::Transport), now))
    }

    /// Does this envelope belong to the executing command, and is it the
    /// chunk we expect next?
    ///
    /// Returns `Ok(false)` for envelopes that don't match the executing
    /// opcode. These are still valid, e.g. unsolicited reset notifications.
    pub fn check_chunk(&self, env: &MessageEnvelope) -> Result<bool, ProtocolError> {
        let Some(inf) = self.executing.as_ref() else {
            return Ok(false);
        };
        if u8::from(inf.command.opcode) != env.opcode {
            return Ok(false);
        }
        if env.chunk_id != inf.next_chunk {
            return Err(ProtocolError::OutOfSequence {
                expected: inf.next_chunk,
                got: env.chunk_id,
            });
        }
        Ok(true)
    }

    /// Fold a response chunk into the executing command
    ///
    /// Call [Self::check_chunk()] first. Returns the finished command when
    /// this was the last chunk.
    pub fn on_response(
        &mut self,
        env: &MessageEnvelope,
        resp: &Response,
        now: Instant,
    ) -> Option<Finished> {
        let inf = self.executing.as_mut()?;
        if u8::from(inf.command.opcode) != env.opcode {
            return None;
        }
        inf.outcome.merge(resp);
        inf.next_chunk = env.chunk_id.saturating_add(1);

        if !env.is_last_chunk() {
            return None;
        }
        let inf = self.executing.take()?;
        self.timeouts = 0;
        let outcome = inf.outcome;
        Some(self.finish(inf, Ok(outcome), now))
    }

    fn finish(
        &mut self,
        mut inf: InFlight,
        result: Result<CommandOutcome, CommandError>,
        now: Instant,
    ) -> Finished {
        inf.command.status = match result {
            Ok(_) => CommandStatus::Received,
            Err(_) => CommandStatus::Error,
        };
        self.last_done = Some(now);
        Finished {
            command: inf.command,
            result,
            at: now,
        }
    }

    /// Keep a finished command in the history, dropping the oldest entry if
    /// the history is full
    pub fn archive(&mut self, finished: &Finished) {
        if self.history.is_full() {
            self.history.pop_front();
        }
        // Can't fail, we just made room
        let _ = self.history.push_back(ExecutedCommand::from(finished));
    }

    /// Nothing executing and nothing queued
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.executing.is_none() && self.queue.is_empty()
    }

    /// Number of commands waiting behind the executing one
    #[inline]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Opcode of the executing command
    pub fn executing(&self) -> Option<Opcode> {
        self.executing.as_ref().map(|inf| inf.command.opcode)
    }

    /// Consecutive commands that timed out
    #[inline]
    pub fn consecutive_timeouts(&self) -> u8 {
        self.timeouts
    }

    /// Preserved commands, oldest first
    pub fn history(&self) -> impl Iterator<Item = &ExecutedCommand> {
        self.history.iter()
    }
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode};

    const T0: Instant = Instant::from_millis(1_000);

    fn cfg() -> HubConfig {
        HubConfig::DEFAULT
    }

    fn cmd(req: CommandRequest) -> PendingCommand {
        PendingCommand::new(9, &req, &cfg(), T0)
    }

    fn response(opcode: u8, payload: &[u8], chunk: u8, max: u8) -> MessageEnvelope {
        decode((1 << 10) | (9 << 2), &encode(opcode, payload, chunk, max)).unwrap()
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn timeout_fires_strictly_after_deadline() {
        let mut ex = CommandExecutor::new();
        let timeout = ms(200);
        ex.enqueue(cmd(CommandRequest::get_version().with_timeout(timeout)))
            .ok()
            .unwrap();
        assert!(ex.start_next(T0, Duration::from_ticks(0)).is_some());

        assert!(ex.check_timeout(T0).is_none());
        assert!(ex.check_timeout(T0 + ms(199)).is_none());
        assert!(ex.check_timeout(T0 + timeout).is_none());
        assert_eq!(ex.executing(), Some(Opcode::GetVersion));

        let done = ex.check_timeout(T0 + timeout + ms(1)).unwrap();
        assert_eq!(done.result, Err(CommandError::Timeout));
        assert_eq!(done.command.status, CommandStatus::Error);
        assert_eq!(ex.executing(), None);
        assert_eq!(ex.consecutive_timeouts(), 1);
    }

    #[test]
    fn fifo_and_single_in_flight() {
        let mut ex = CommandExecutor::new();
        ex.enqueue(cmd(CommandRequest::get_serial_number())).ok().unwrap();
        ex.enqueue(cmd(CommandRequest::get_version())).ok().unwrap();
        assert_eq!(ex.queued(), 2);

        let (first, _) = ex.start_next(T0, ms(0)).unwrap();
        assert_eq!(first.data()[0], 0x00);
        // Second one waits while the first is in flight
        assert!(ex.start_next(T0 + ms(10), ms(0)).is_none());

        let env = response(0x00, &1u32.to_le_bytes(), 1, 1);
        assert_eq!(ex.check_chunk(&env), Ok(true));
        let resp = Response::decode(&env).unwrap();
        let done = ex.on_response(&env, &resp, T0 + ms(20)).unwrap();
        assert_eq!(done.command.status, CommandStatus::Received);

        let (second, _) = ex.start_next(T0 + ms(20), ms(0)).unwrap();
        assert_eq!(second.data()[0], 0x01);
    }

    #[test]
    fn inter_command_delay() {
        let mut ex = CommandExecutor::new();
        ex.enqueue(cmd(CommandRequest::start_adc())).ok().unwrap();
        ex.enqueue(cmd(CommandRequest::start_adc())).ok().unwrap();
        ex.start_next(T0, ms(5)).unwrap();
        let env = response(0x04, &[], 1, 1);
        let resp = Response::decode(&env).unwrap();
        ex.on_response(&env, &resp, T0 + ms(1)).unwrap();

        assert!(ex.start_next(T0 + ms(5), ms(5)).is_none());
        assert!(ex.start_next(T0 + ms(6), ms(5)).is_some());
    }

    #[test]
    fn chunks_accumulate_until_last() {
        let mut ex = CommandExecutor::new();
        ex.enqueue(cmd(CommandRequest::get_serial_number().preserve()))
            .ok()
            .unwrap();
        ex.start_next(T0, ms(0)).unwrap();

        let parts = [0x1234_5678u32, 0xABCD_EF01, 0x9876_5432];
        let mut finished = None;
        for (i, part) in parts.iter().enumerate() {
            let env = response(0x00, &part.to_le_bytes(), i as u8 + 1, 3);
            assert_eq!(ex.check_chunk(&env), Ok(true));
            let resp = Response::decode(&env).unwrap();
            finished = ex.on_response(&env, &resp, T0 + ms(1));
            if i < 2 {
                assert!(finished.is_none());
            }
        }
        let done = finished.unwrap();
        assert_eq!(done.result.unwrap().unique_id(), Some(parts));
        ex.archive(&done);
        let hist: heapless::Vec<_, 4> = ex.history().collect();
        assert_eq!(hist.len(), 1);
        assert_eq!(hist[0].status, CommandStatus::Received);
    }

    #[test]
    fn out_of_sequence_chunk_rejected() {
        let mut ex = CommandExecutor::new();
        ex.enqueue(cmd(CommandRequest::get_serial_number())).ok().unwrap();
        ex.start_next(T0, ms(0)).unwrap();
        let env = response(0x00, &[0; 4], 2, 3);
        assert_eq!(
            ex.check_chunk(&env),
            Err(ProtocolError::OutOfSequence {
                expected: 1,
                got: 2
            })
        );
        assert_eq!(ex.executing(), Some(Opcode::GetSerialNumber));
    }

    #[test]
    fn other_opcodes_do_not_match() {
        let mut ex = CommandExecutor::new();
        ex.enqueue(cmd(CommandRequest::get_version())).ok().unwrap();
        ex.start_next(T0, ms(0)).unwrap();
        let env = response(0x02, &[0], 1, 1);
        assert_eq!(ex.check_chunk(&env), Ok(false));
        let resp = Response::decode(&env).unwrap();
        assert!(ex.on_response(&env, &resp, T0).is_none());
        assert_eq!(ex.executing(), Some(Opcode::GetVersion));
    }

    #[test]
    fn queue_full_gives_command_back() {
        let mut ex = CommandExecutor::new();
        for _ in 0..QUEUE_DEPTH {
            ex.enqueue(cmd(CommandRequest::get_version())).ok().unwrap();
        }
        let back = ex.enqueue(cmd(CommandRequest::start_adc())).err().unwrap();
        assert_eq!(back.opcode, Opcode::StartAdc);
        assert_eq!(back.status, CommandStatus::None);
    }

    #[test]
    fn history_is_capped() {
        let mut ex = CommandExecutor::new();
        for n in 0..(HISTORY_DEPTH as u64 + 2) {
            ex.enqueue(cmd(CommandRequest::get_version().preserve()))
                .ok()
                .unwrap();
            let at = T0 + ms(n * 1000);
            ex.start_next(at, ms(0)).unwrap();
            let done = ex.send_failed(at).unwrap();
            assert_eq!(done.result, Err(CommandError::Transport));
            ex.archive(&done);
        }
        assert_eq!(ex.history().count(), HISTORY_DEPTH);
        assert_eq!(ex.history().next().unwrap().finished_at, T0 + ms(2000));
    }

    #[test]
    fn priority_in_identifier() {
        let c = cmd(CommandRequest::get_version());
        assert_eq!(c.frame().id(), (9 << 2) | Priority::Normal as u16);
        let c = cmd(CommandRequest::get_version().with_priority(Priority::High));
        assert_eq!(c.frame().id(), 9 << 2);
        assert_eq!(c.target.priority, Priority::High);
    }
}
