//! Discovery
//!
//! Devices don't announce themselves (except after a reset), so the hub
//! scans a range of short ids, sending one presence request (a
//! [GetSerialNumber][crate::opcode::Opcode::GetSerialNumber] command) per
//! probe interval. Any device that answers is picked up by the normal
//! receive path.
//!
//! The scan wraps around from `id_max` to `id_min` and keeps going until
//! `max_devices` devices are known, or it is stopped.

use embassy_time::Instant;

use crate::{config::DiscoveryConfig, BusState, MAX_DEVICES};

/// What the hub should do after a discovery tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum DiscoveryAction {
    /// Nothing this tick
    None,
    /// Send a presence request to this short id
    Probe(u8),
    /// The bus is off, restart it before probing again
    RestartBus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
enum State {
    Idle,
    Scanning,
}

/// Scan state machine
pub struct DiscoveryEngine {
    state: State,
    config: DiscoveryConfig,
    current_id: u8,
    last_probe: Option<Instant>,
}

impl DiscoveryEngine {
    /// An idle engine
    pub const fn new() -> Self {
        let config = DiscoveryConfig::new(1, u8::MAX, MAX_DEVICES);
        Self {
            state: State::Idle,
            config,
            current_id: config.id_min,
            last_probe: None,
        }
    }

    /// Start (or restart) scanning at `config.id_min`
    pub fn start(&mut self, config: DiscoveryConfig) {
        let mut config = config;
        config.id_min = config.id_min.max(1);
        config.id_max = config.id_max.max(1);
        if config.id_min > config.id_max {
            core::mem::swap(&mut config.id_min, &mut config.id_max);
        }
        hub_info!(
            "Discovery {=u8}..={=u8}, up to {=usize} devices",
            config.id_min,
            config.id_max,
            config.max_devices
        );
        self.config = config;
        self.current_id = config.id_min;
        self.last_probe = None;
        self.state = State::Scanning;
    }

    /// Stop scanning
    pub fn stop(&mut self) {
        self.state = State::Idle;
    }

    /// Is a scan running?
    #[inline]
    pub fn is_scanning(&self) -> bool {
        self.state == State::Scanning
    }

    /// The next id that will be considered for a probe
    #[inline]
    pub fn current_id(&self) -> u8 {
        self.current_id
    }

    fn advance(&mut self) {
        self.current_id = if self.current_id >= self.config.id_max {
            self.config.id_min
        } else {
            self.current_id + 1
        };
    }

    /// Advance the scan
    ///
    /// `known` is the number of devices the hub tracks, `is_online` tells
    /// whether a short id belongs to a device that is currently answering.
    /// Those ids are skipped without using up a probe interval.
    pub fn tick(
        &mut self,
        now: Instant,
        bus: BusState,
        known: usize,
        is_online: impl Fn(u8) -> bool,
    ) -> DiscoveryAction {
        if self.state != State::Scanning {
            return DiscoveryAction::None;
        }
        if known >= self.config.max_devices {
            hub_info!("Discovery done, {=usize} devices", known);
            self.state = State::Idle;
            return DiscoveryAction::None;
        }
        if bus.needs_restart() {
            return DiscoveryAction::RestartBus;
        }
        if !bus.is_healthy() {
            return DiscoveryAction::None;
        }
        if let Some(at) = self.last_probe {
            if now.saturating_duration_since(at) < self.config.probe_interval {
                return DiscoveryAction::None;
            }
        }

        let span = (self.config.id_max - self.config.id_min) as usize + 1;
        for _ in 0..span {
            let id = self.current_id;
            self.advance();
            if !is_online(id) {
                self.last_probe = Some(now);
                hub_trace!("Probing {=u8}", id);
                return DiscoveryAction::Probe(id);
            }
        }
        DiscoveryAction::None
    }
}

impl Default for DiscoveryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_time::Duration;

    const T0: Instant = Instant::from_millis(0);

    fn at(ms: u64) -> Instant {
        T0 + Duration::from_millis(ms)
    }

    #[test]
    fn idle_does_nothing() {
        let mut eng = DiscoveryEngine::new();
        assert!(!eng.is_scanning());
        assert_eq!(eng.tick(T0, BusState::Active, 0, |_| false), DiscoveryAction::None);
    }

    #[test]
    fn halts_at_max_devices() {
        let mut eng = DiscoveryEngine::new();
        eng.start(DiscoveryConfig::new(35, 37, 2));

        assert_eq!(eng.tick(at(0), BusState::Active, 0, |_| false), DiscoveryAction::Probe(35));
        // 35 answered
        assert_eq!(eng.tick(at(50), BusState::Active, 1, |id| id == 35), DiscoveryAction::Probe(36));
        // 36 answered
        assert_eq!(
            eng.tick(at(100), BusState::Active, 2, |id| id == 35 || id == 36),
            DiscoveryAction::None
        );
        assert!(!eng.is_scanning());
    }

    #[test]
    fn wraps_and_skips_online() {
        let mut eng = DiscoveryEngine::new();
        eng.start(DiscoveryConfig::new(10, 12, 8));
        let online = |id: u8| id == 11;
        let mut probes = heapless::Vec::<u8, 8>::new();
        for n in 0..5 {
            if let DiscoveryAction::Probe(id) = eng.tick(at(n * 50), BusState::Active, 1, online) {
                probes.push(id).unwrap();
            }
        }
        assert_eq!(&probes[..], &[10, 12, 10, 12, 10]);
    }

    #[test]
    fn probe_interval_respected() {
        let mut eng = DiscoveryEngine::new();
        eng.start(DiscoveryConfig::new(1, 5, 8));
        assert_eq!(eng.tick(at(0), BusState::Active, 0, |_| false), DiscoveryAction::Probe(1));
        assert_eq!(eng.tick(at(49), BusState::Active, 0, |_| false), DiscoveryAction::None);
        assert_eq!(eng.tick(at(50), BusState::Active, 0, |_| false), DiscoveryAction::Probe(2));
    }

    #[test]
    fn bus_errors() {
        let mut eng = DiscoveryEngine::new();
        eng.start(DiscoveryConfig::new(1, 5, 8));
        assert_eq!(eng.tick(at(0), BusState::BusOff, 0, |_| false), DiscoveryAction::RestartBus);
        assert_eq!(eng.tick(at(1), BusState::Passive, 0, |_| false), DiscoveryAction::None);
        assert_eq!(eng.tick(at(2), BusState::Warning, 0, |_| false), DiscoveryAction::None);
        // Nothing was skipped
        assert_eq!(eng.current_id(), 1);
        assert_eq!(eng.tick(at(3), BusState::Active, 0, |_| false), DiscoveryAction::Probe(1));
    }

    #[test]
    fn id_zero_is_never_probed() {
        let mut eng = DiscoveryEngine::new();
        eng.start(DiscoveryConfig {
            id_min: 0,
            ..DiscoveryConfig::new(1, 2, 8)
        });
        assert_eq!(eng.current_id(), 1);
        assert_eq!(DiscoveryConfig::new(0, 0, 1).id_min, 1);

        let mut probes = heapless::Vec::<u8, 8>::new();
        for n in 0..4 {
            if let DiscoveryAction::Probe(id) = eng.tick(at(n * 50), BusState::Active, 0, |_| false) {
                probes.push(id).unwrap();
            }
        }
        assert_eq!(&probes[..], &[1, 2, 1, 2]);
    }

    #[test]
    fn all_online_means_no_probe() {
        let mut eng = DiscoveryEngine::new();
        eng.start(DiscoveryConfig::new(3, 4, 8));
        assert_eq!(eng.tick(at(0), BusState::Active, 2, |_| true), DiscoveryAction::None);
        assert!(eng.is_scanning());
    }
}
