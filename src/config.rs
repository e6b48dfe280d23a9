//! Hub and device configuration

use embassy_time::Duration;

use crate::{opcode::AveragingMode, Priority, CHANNELS};

/// Minimum time between the end of one command and the start of the next,
/// per device
pub const INTER_COMMAND_DELAY: Duration = Duration::from_millis(5);

/// Time a device gets to send the last chunk of a response
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Time the CAN peripheral gets to accept a frame for sending
pub const CAN_SEND_TIMEOUT: Duration = Duration::from_millis(10);

/// Time between two discovery probes
pub const PROBE_INTERVAL: Duration = Duration::from_millis(50);

/// Time between two presence requests to a device that went offline
pub const OFFLINE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Runtime settings of a [Hub][crate::Hub]
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct HubConfig {
    /// See [INTER_COMMAND_DELAY]
    pub inter_command_delay: Duration,
    /// Used when a command does not set its own timeout
    pub command_timeout: Duration,
    /// See [CAN_SEND_TIMEOUT]
    pub can_send_timeout: Duration,
    /// See [OFFLINE_RETRY_INTERVAL]
    pub offline_retry_interval: Duration,
    /// Priority of commands sent by the hub
    pub priority: Priority,
}

impl HubConfig {
    /// The default settings, usable in `const` context
    pub const DEFAULT: HubConfig = HubConfig {
        inter_command_delay: INTER_COMMAND_DELAY,
        command_timeout: COMMAND_TIMEOUT,
        can_send_timeout: CAN_SEND_TIMEOUT,
        offline_retry_interval: OFFLINE_RETRY_INTERVAL,
        priority: Priority::Normal,
    };
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Discovery scan range and limits
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct DiscoveryConfig {
    /// First short id to probe
    pub id_min: u8,
    /// Last short id to probe, inclusive
    pub id_max: u8,
    /// Scanning stops once this many devices are known
    pub max_devices: usize,
    /// See [PROBE_INTERVAL]
    pub probe_interval: Duration,
}

impl DiscoveryConfig {
    /// Scan `id_min..=id_max` until `max_devices` devices are known
    ///
    /// Short id 0 is not a device address, so both bounds are at least 1.
    pub const fn new(id_min: u8, id_max: u8, max_devices: usize) -> Self {
        Self {
            id_min: if id_min == 0 { 1 } else { id_min },
            id_max: if id_max == 0 { 1 } else { id_max },
            max_devices,
            probe_interval: PROBE_INTERVAL,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::new(1, u8::MAX, crate::MAX_DEVICES)
    }
}

/// Desired settings of one analog channel
///
/// `None` fields are left as the device has them.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct ChannelConfig {
    /// Averaging mode
    pub averaging_mode: Option<AveragingMode>,
    /// Exponential averaging factor
    pub alpha: Option<f32>,
    /// Sampling interval, milliseconds
    pub time_interval_ms: Option<u32>,
    /// Linear coefficient
    pub a: Option<f32>,
    /// Offset coefficient
    pub b: Option<f32>,
    /// Multiplicator
    pub multiplicator: Option<f32>,
}

/// Desired settings of one device
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct DeviceConfig {
    /// Per channel settings, by channel index
    pub channels: [ChannelConfig; CHANNELS],
    /// How often a configured device is asked for its latest sensor values.
    /// `None` disables polling.
    pub poll_interval: Option<Duration>,
}

/// Source of per device settings, e.g. a settings file loaded at boot
pub trait ConfigSource {
    /// Desired settings for the device with the given short id
    ///
    /// Returning [None] means the device only needs its identity read
    /// and its ADC started.
    fn device_config(&self, short_id: u8) -> Option<DeviceConfig>;
}

/// A [ConfigSource] that applies the same settings to every device
impl ConfigSource for DeviceConfig {
    fn device_config(&self, _short_id: u8) -> Option<DeviceConfig> {
        Some(*self)
    }
}

/// A [ConfigSource] with no settings for any device
impl ConfigSource for () {
    fn device_config(&self, _short_id: u8) -> Option<DeviceConfig> {
        None
    }
}
