//! # AFE Hub
//!
//! This is the bus side of a hub that manages a fleet of analog front-end
//! (AFE) boards. It's intended to run on a bare metal microcontroller that owns
//! one classic CAN bus, where every AFE board is a device with an 8-bit
//! "short id".
//!
//! ## Entities
//!
//! There are two roles on the bus:
//!
//! 1. The Hub, which is the only node that sends commands. It discovers
//!    devices, pushes their configuration, and polls their sensors.
//! 2. The Devices (AFE boards), which only respond to commands from the Hub,
//!    with the exception of an unsolicited reset notification sent after boot.
//!
//! ## Addressing
//!
//! Only standard (11-bit) identifiers are used. See [CanAddr] for the layout:
//! the response flag, the device short id, and a 2-bit priority.
//!
//! ## Message Framing
//!
//! Every frame payload starts with an opcode byte and a chunk header byte. A
//! response that does not fit in the six remaining payload bytes is sent as up
//! to fifteen chunks, numbered `1..=max_chunks`. The last chunk completes the
//! response. See [codec] for the details, and [opcode] for the command set.
//!
//! ## Commands
//!
//! Each device has its own FIFO queue of commands, and at most one command
//! in flight at any time. A command completes when its last chunk arrives, or
//! fails when no last chunk arrived within its timeout. There are no automatic
//! retries: the completion callback receives the device and may re-enqueue.
//!
//! ## Hub "steps"
//!
//! The application calls [Hub::step()] periodically from a single task. One
//! step will:
//!
//! 1. Feed the watchdog
//! 2. Process UP TO one received frame from the receive ring
//! 3. Advance the discovery scan, probing UP TO one address
//! 4. For each known device: check for a timed out command, enqueue the next
//!    missing configuration setting or a sensor poll, and send the next
//!    queued command
//!
//! The CAN receive interrupt pushes frames into the ring returned by
//! [Hub::receiver()]. This never blocks and never takes the hub lock, so it is
//! safe to do from interrupt context.
//!
//! ## Faults
//!
//! Nothing in this crate halts the step loop. Bus errors restart the CAN
//! peripheral, protocol errors drop the frame, and a command timeout only
//! affects the device it was sent to. A device that misses three commands in
//! a row is marked offline, but is never forgotten: it is marked online again
//! as soon as it answers anything.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![allow(async_fn_in_trait)]
#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod codec;
pub mod config;
pub mod device;
pub mod discovery;
pub mod dispatch;
pub mod executor;
pub mod hub;
pub mod opcode;
pub mod outcome;
pub mod ring;
#[cfg(feature = "postcard-helpers")]
pub mod wirehelp;

pub use crate::codec::CanFrame;
pub use crate::hub::Hub;

/// The number of frames the receive ring can hold
pub const RX_SIZE: usize = 32;

/// The maximum number of devices tracked by a Hub
pub const MAX_DEVICES: usize = 16;

/// The number of analog channels on every device
pub const CHANNELS: usize = 8;

/// An error type for the [`CanBus`] trait
#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error<E> {
    /// Some error with the underlying CAN peripheral
    Bus(E),
    /// The peripheral did not accept the frame in time
    Timeout,
}

impl<E> From<E> for Error<E> {
    fn from(value: E) -> Self {
        Self::Bus(value)
    }
}

/// Error state of the CAN peripheral, as reported by its error counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum BusState {
    /// Normal operation
    Active,
    /// An error counter crossed the warning limit
    Warning,
    /// The node no longer sends active error flags
    Passive,
    /// The node left the bus, and must be restarted
    BusOff,
}

impl BusState {
    /// Is it worth putting a frame on the bus right now?
    #[inline]
    pub fn is_healthy(&self) -> bool {
        *self == BusState::Active
    }

    /// Does the peripheral need a restart before it can send again?
    #[inline]
    pub fn needs_restart(&self) -> bool {
        *self == BusState::BusOff
    }
}

/// A trait representing the transmit side of the CAN peripheral
///
/// Reception is not part of this trait: the receive interrupt (or a polling
/// task) pushes frames into [`Hub::receiver()`].
pub trait CanBus {
    /// The error type of the underlying CAN peripheral
    type BusError;

    /// Send a single frame.
    ///
    /// The future should complete as soon as the frame was handed to a transmit
    /// mailbox, NOT when it was acknowledged. The hub bounds this call with
    /// the configured send timeout, so it MUST be cancellation safe.
    async fn send_frame(&mut self, frame: &CanFrame) -> Result<(), Error<Self::BusError>>;

    /// The current error state of the peripheral
    fn state(&self) -> BusState;

    /// Take the peripheral off the bus and bring it back, clearing error counters
    async fn restart(&mut self) -> Result<(), Error<Self::BusError>>;
}

/// A hardware watchdog that resets the microcontroller when it isn't fed
pub trait Watchdog {
    /// Restart the watchdog period
    fn feed(&mut self);
}

/// CAN identifier priority, the two least significant identifier bits
///
/// Lower values win arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[repr(u8)]
pub enum Priority {
    /// `0b00`
    High = 0,
    /// `0b01`
    Normal = 1,
    /// `0b10`
    Low = 2,
    /// `0b11`
    Lowest = 3,
}

impl Priority {
    const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Priority::High,
            1 => Priority::Normal,
            2 => Priority::Low,
            _ => Priority::Lowest,
        }
    }
}

/// CAN identifier
///
/// [CanAddr] is the 11-bit standard identifier used on the bus. It consists of:
///
/// * 1 response-bit
/// * 8 address-bits (`0..=255`), the device short id
/// * 2 priority-bits
///
/// e.g. `0bR_AAAAAAAA_PP`. The Hub always sends with the response bit clear,
/// devices set it on their replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct CanAddr {
    /// Short id of the device sending or receiving the frame
    pub short_id: u8,
    /// Arbitration priority
    pub priority: Priority,
    /// Set when the frame was sent by a device
    pub response: bool,
}

/// Identifier Error
#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[non_exhaustive]
pub enum CanAddrError {
    /// The identifier does not fit in 11 bits
    NotStandard,
}

impl CanAddr {
    const RESPONSE_BIT: u16 = 1 << 10;
    const MAX_STANDARD: u16 = 0x7FF;

    /// The address the Hub uses to send a command to a device
    pub const fn command(short_id: u8, priority: Priority) -> Self {
        Self {
            short_id,
            priority,
            response: false,
        }
    }
}

impl TryFrom<u16> for CanAddr {
    type Error = CanAddrError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        if value > Self::MAX_STANDARD {
            return Err(CanAddrError::NotStandard);
        }
        Ok(CanAddr {
            short_id: ((value >> 2) & 0xFF) as u8,
            priority: Priority::from_bits(value as u8),
            response: (value & Self::RESPONSE_BIT) != 0,
        })
    }
}

impl From<CanAddr> for u16 {
    fn from(val: CanAddr) -> Self {
        let resp = if val.response { CanAddr::RESPONSE_BIT } else { 0 };
        resp | ((val.short_id as u16) << 2) | (val.priority as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_address_layout() {
        let addr = CanAddr::command(35, Priority::Low);
        assert_eq!(u16::from(addr), (35 << 2) | 2);
    }

    #[test]
    fn response_address_decodes() {
        let raw: u16 = (1 << 10) | (200 << 2) | 3;
        let addr = CanAddr::try_from(raw).unwrap();
        assert_eq!(addr.short_id, 200);
        assert_eq!(addr.priority, Priority::Lowest);
        assert!(addr.response);
        assert_eq!(u16::from(addr), raw);
    }

    #[test]
    fn extended_identifier_rejected() {
        assert_eq!(CanAddr::try_from(0x800), Err(CanAddrError::NotStandard));
    }
}
