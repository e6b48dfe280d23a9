//! Hub Interface
//!
//! The Hub is responsible for running the bus.

use core::ops::DerefMut;

use embassy_sync::{blocking_mutex::raw::RawMutex, mutex::Mutex};
use embassy_time::{with_timeout, Duration, Instant, TimeoutError};

use crate::{
    codec::{decode_frame, encode_command, CanFrame},
    config::{ConfigSource, DiscoveryConfig, HubConfig},
    device::{Device, DeviceSnapshot},
    discovery::{DiscoveryAction, DiscoveryEngine},
    executor::{CommandRequest, EnqueueError, ExecutedCommand, HISTORY_DEPTH},
    opcode::Opcode,
    ring::RingBuffer,
    CanAddr, CanBus, Error, Priority, Watchdog, MAX_DEVICES, RX_SIZE,
};

/// Priority of discovery probes, so they never delay configured devices
pub const PROBE_PRIORITY: Priority = Priority::Low;

/// Hub interface and data storage
///
/// The static Hub is intended to be used in three separate places in an
/// application:
///
/// 1. In the CAN receive interrupt, which pushes every received frame into
///    [Hub::receiver()]
/// 2. In one task, where [Hub::step()] is called periodically, to service
///    bus operations
/// 3. Anywhere else, where [Hub::enqueue_command()] or
///    [Hub::device_snapshot()] are called, e.g. from a network command server
///
/// The receive ring is lock free from the interrupt's point of view. All other
/// state is behind an async Mutex, locked for the duration of one step.
///
/// ```rust
/// use afe_hub::{config::HubConfig, Hub};
/// use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
///
/// static HUB: Hub<CriticalSectionRawMutex> = Hub::new(HubConfig::DEFAULT);
/// ```
pub struct Hub<R: RawMutex + 'static, const RX: usize = RX_SIZE> {
    rx: RingBuffer<RX>,
    inner: Mutex<R, HubInner>,
}

struct HubInner {
    devices: heapless::Vec<Device, MAX_DEVICES>,
    discovery: DiscoveryEngine,
    config: HubConfig,
}

impl HubInner {
    fn device_mut(&mut self, short_id: u8) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.short_id() == short_id)
    }

    fn device(&self, short_id: u8) -> Option<&Device> {
        self.devices.iter().find(|d| d.short_id() == short_id)
    }
}

/// Instantiation methods
impl<R: RawMutex + 'static, const RX: usize> Hub<R, RX> {
    /// Create a new hub with no known devices and discovery stopped
    ///
    /// Intended to be used to create a static.
    pub const fn new(config: HubConfig) -> Self {
        Self {
            rx: RingBuffer::new(),
            inner: Mutex::new(HubInner {
                devices: heapless::Vec::new(),
                discovery: DiscoveryEngine::new(),
                config,
            }),
        }
    }

    /// The receive ring, to be filled from the CAN receive interrupt
    #[inline]
    pub fn receiver(&self) -> &RingBuffer<RX> {
        &self.rx
    }

    /// Number of received frames dropped because the ring was full
    #[inline]
    pub fn rx_overflows(&self) -> u32 {
        self.rx.overflows()
    }
}

/// Bus management and operation method(s)
impl<R: RawMutex + 'static, const RX: usize> Hub<R, RX> {
    /// Perform one "step" of the bus
    ///
    /// One call to `step` will:
    ///
    /// 1. Feed the watchdog
    /// 2. Route UP TO one received frame to its device, creating the device
    ///    if it is new
    /// 3. Send UP TO one discovery probe, or restart the bus if it is off
    /// 4. For every known device: time out the executing command, queue the
    ///    next configuration setting or sensor poll, and send UP TO one
    ///    command
    ///
    /// This method should be called regularly.
    ///
    /// The `bus`, `watchdog` and `configs` resources are passed in on every
    /// call, rather than making them part of the `Hub`, to keep the static
    /// free of generics other than the mutex.
    ///
    /// Failed sends are handled here: the command fails with
    /// [CommandError::Transport][crate::executor::CommandError::Transport]
    /// and the bus is restarted. An error is only returned when that
    /// restart fails. Even then every device is still ticked, so executing
    /// commands time out, but nothing more is sent until the next step.
    pub async fn step<B, W, C>(
        &self,
        bus: &mut B,
        watchdog: &mut W,
        configs: &C,
    ) -> Result<(), Error<B::BusError>>
    where
        B: CanBus,
        W: Watchdog,
        C: ConfigSource,
    {
        self.step_at(Instant::now(), bus, watchdog, configs).await
    }

    /// Like [Hub::step()], with the current time given by the caller
    pub async fn step_at<B, W, C>(
        &self,
        now: Instant,
        bus: &mut B,
        watchdog: &mut W,
        configs: &C,
    ) -> Result<(), Error<B::BusError>>
    where
        B: CanBus,
        W: Watchdog,
        C: ConfigSource,
    {
        watchdog.feed();
        let mut inner = self.inner.lock().await;
        let inner = inner.deref_mut();

        if let Some(frame) = self.rx.pop() {
            route(inner, &frame, now);
        }
        let probed = discover(inner, bus, now).await;
        serve_devices(inner, bus, configs, now, probed).await
    }
}

/// Command and inspection methods
impl<R: RawMutex + 'static, const RX: usize> Hub<R, RX> {
    /// Queue a command for a known device
    pub async fn enqueue_command(
        &self,
        short_id: u8,
        req: CommandRequest,
    ) -> Result<(), EnqueueError> {
        self.inner
            .lock()
            .await
            .device_mut(short_id)
            .ok_or(EnqueueError::UnknownDevice)
            .and_then(|d| d.enqueue(req))
    }

    /// A copy of everything the hub knows about a device
    pub async fn device_snapshot(&self, short_id: u8) -> Option<DeviceSnapshot> {
        self.inner
            .lock()
            .await
            .device(short_id)
            .map(Device::snapshot)
    }

    /// Preserved commands of a device, oldest first
    pub async fn executed_history(
        &self,
        short_id: u8,
    ) -> Option<heapless::Vec<ExecutedCommand, HISTORY_DEPTH>> {
        self.inner
            .lock()
            .await
            .device(short_id)
            .map(|d| d.executor().history().copied().collect())
    }

    /// Get the short ids of all devices that are currently answering
    pub async fn connected(&self) -> heapless::Vec<u8, MAX_DEVICES> {
        self.inner
            .lock()
            .await
            .devices
            .iter()
            .filter_map(|d| d.is_online().then_some(d.short_id()))
            .collect()
    }

    /// Start scanning for devices
    pub async fn start_discovery(&self, config: DiscoveryConfig) {
        self.inner.lock().await.discovery.start(config);
    }

    /// Stop scanning for devices. Known devices are kept.
    pub async fn stop_discovery(&self) {
        self.inner.lock().await.discovery.stop();
    }

    /// Is a discovery scan running?
    pub async fn is_discovering(&self) -> bool {
        self.inner.lock().await.discovery.is_scanning()
    }
}

/// Decode one received frame and hand it to its device
fn route(inner: &mut HubInner, frame: &CanFrame, now: Instant) {
    let env = match decode_frame(frame) {
        Ok(env) => env,
        Err(e) => {
            hub_warn!("Dropping frame {=u16:03x}: {}", frame.id(), e);
            return;
        }
    };
    if !env.is_response {
        hub_trace!("Ignoring request to {=u8}", env.device_short_id);
        return;
    }

    let id = env.device_short_id;
    if id == 0 {
        hub_trace!("Ignoring response from short id 0");
        return;
    }
    if inner.device(id).is_none() {
        let dev = Device::new(id, inner.config, now);
        if inner.devices.push(dev).is_err() {
            hub_warn!("Device table full, ignoring {=u8}", id);
            return;
        }
        hub_info!("New device {=u8}", id);
    }
    let Some(dev) = inner.device_mut(id) else {
        return;
    };
    hub_trace!("Frame from {=u8}, opcode {=u8:02x}", id, env.opcode);
    if let Err(e) = dev.handle(&env, now) {
        hub_warn!("Device {=u8} protocol error: {}", id, e);
    }
}

/// A helper function that advances the discovery scan by one tick
async fn discover<B: CanBus>(
    inner: &mut HubInner,
    bus: &mut B,
    now: Instant,
) -> Result<(), Error<B::BusError>> {
    let devices = &inner.devices;
    let action = inner.discovery.tick(now, bus.state(), devices.len(), |id| {
        devices.iter().any(|d| d.short_id() == id && d.is_online())
    });

    match action {
        DiscoveryAction::None => Ok(()),
        DiscoveryAction::RestartBus => restart(bus).await,
        DiscoveryAction::Probe(id) => {
            let addr = CanAddr::command(id, PROBE_PRIORITY);
            let frame = encode_command(addr, Opcode::GetSerialNumber.into(), &[]);
            match send(bus, &frame, inner.config.can_send_timeout).await {
                Ok(()) => Ok(()),
                Err(_e) => {
                    hub_error!("Probe to {=u8} not sent", id);
                    restart(bus).await
                }
            }
        }
    }
}

/// A helper function that serves all known devices, sending zero or one
/// command to each
///
/// Once the bus could not be restarted, the remaining devices are only
/// ticked. The first restart error is returned.
async fn serve_devices<B: CanBus, C: ConfigSource>(
    inner: &mut HubInner,
    bus: &mut B,
    configs: &C,
    now: Instant,
    mut result: Result<(), Error<B::BusError>>,
) -> Result<(), Error<B::BusError>> {
    for dev in inner.devices.iter_mut() {
        let config = configs.device_config(dev.short_id());
        dev.tick(now, config.as_ref());
        if result.is_err() {
            continue;
        }

        let Some((frame, timeout)) = dev.next_frame(now) else {
            continue;
        };
        if bus.state().needs_restart() {
            dev.send_failed(now);
            result = restart(bus).await;
            continue;
        }
        match send(bus, &frame, timeout).await {
            Ok(()) => hub_debug!("Sent {=u8:02x} to {=u8}", frame.data()[0], dev.short_id()),
            Err(_e) => {
                hub_error!("Command to {=u8} not sent", dev.short_id());
                dev.send_failed(now);
                result = restart(bus).await;
            }
        }
    }
    result
}

async fn send<B: CanBus>(
    bus: &mut B,
    frame: &CanFrame,
    timeout: Duration,
) -> Result<(), Error<B::BusError>> {
    match with_timeout(timeout, bus.send_frame(frame)).await {
        Ok(res) => res,
        Err(TimeoutError) => Err(Error::Timeout),
    }
}

async fn restart<B: CanBus>(bus: &mut B) -> Result<(), Error<B::BusError>> {
    hub_warn!("Restarting CAN bus");
    bus.restart().await
}
