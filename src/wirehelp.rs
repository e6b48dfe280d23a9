//! Wire data format helper functions
//!
//! Used by an outer command server (e.g. over Ethernet) that reports device
//! state with [postcard].

use serde::Serialize;

use crate::{
    device::DeviceSnapshot,
    executor::{ExecutedCommand, HISTORY_DEPTH},
    opcode::Opcode,
};

/// Wire view of a preserved command
#[derive(Serialize)]
pub struct WireExecuted {
    /// Opcode of the command
    pub opcode: Opcode,
    /// Hub uptime when the command finished
    pub finished_ms: u64,
    /// Set if the last chunk arrived
    pub ok: bool,
}

impl From<&ExecutedCommand> for WireExecuted {
    fn from(cmd: &ExecutedCommand) -> Self {
        Self {
            opcode: cmd.opcode,
            finished_ms: cmd.finished_at.as_millis(),
            ok: cmd.result.is_ok(),
        }
    }
}

/// Encode a snapshot into `buf`, returning the used part
pub fn encode_snapshot<'a>(snap: &DeviceSnapshot, buf: &'a mut [u8]) -> Option<&'a mut [u8]> {
    postcard::to_slice(snap, buf).ok()
}

/// Encode a device history into `buf`, returning the used part
pub fn encode_history<'a, 'b>(
    history: impl IntoIterator<Item = &'b ExecutedCommand>,
    buf: &'a mut [u8],
) -> Option<&'a mut [u8]> {
    let wire: heapless::Vec<WireExecuted, HISTORY_DEPTH> = history
        .into_iter()
        .take(HISTORY_DEPTH)
        .map(WireExecuted::from)
        .collect();
    postcard::to_slice(&wire, buf).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceState;

    #[test]
    fn snapshot_fits_a_frame_buffer() {
        let snap = DeviceSnapshot {
            state: DeviceState::new(35),
            last_seen_ms: Some(1234),
            queued: 0,
            executing: None,
            consecutive_timeouts: 0,
        };
        let mut buf = [0u8; 512];
        let used = encode_snapshot(&snap, &mut buf).unwrap();
        // short id first
        assert_eq!(used[0], 35);
    }

    #[test]
    fn small_buffer_fails() {
        let snap = DeviceSnapshot {
            state: DeviceState::new(1),
            last_seen_ms: None,
            queued: 0,
            executing: None,
            consecutive_timeouts: 0,
        };
        let mut buf = [0u8; 4];
        assert!(encode_snapshot(&snap, &mut buf).is_none());
    }

    #[test]
    fn empty_history() {
        let mut buf = [0u8; 16];
        let used = encode_history(core::iter::empty(), &mut buf).unwrap();
        assert_eq!(used, &[0]);
    }
}
