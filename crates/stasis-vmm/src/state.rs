//! Serialized machine state.
//!
//! A [`MachineState`] is what [`Machine::save`](crate::machine::Machine::save)
//! produces at a quiescent point and what the live-upgrade path hands to the
//! re-exec'd host process. The wire encoding is JSON; each device's payload
//! is opaque to the core and round-trips through the driver's own
//! save/load.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::devices::DeviceInfo;

/// Errors from state encoding or decoding.
#[derive(Error, Debug)]
pub enum StateError {
    /// The state blob could not be encoded or parsed.
    #[error("state encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Everything needed to reconstruct a machine's configuration and device
/// state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineState {
    /// Number of vCPUs the machine ran with.
    pub vcpus: usize,
    /// Device roster with per-device state payloads, in attach order.
    pub devices: Vec<DeviceInfo>,
}

impl MachineState {
    /// Encode to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, StateError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Decode from JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self, StateError> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let mut post = DeviceInfo::new("post0", "debug-port");
        post.data = serde_json::json!({"last": 0x42});
        post.debug = true;
        let state = MachineState {
            vcpus: 2,
            devices: vec![post],
        };

        let bytes = state.to_json().unwrap();
        let back = MachineState::from_json(&bytes).unwrap();
        assert_eq!(back.vcpus, 2);
        assert_eq!(back.devices.len(), 1);
        assert_eq!(back.devices[0].name, "post0");
        assert_eq!(back.devices[0].driver, "debug-port");
        assert_eq!(back.devices[0].data["last"], 0x42);
        assert!(back.devices[0].debug);
    }

    #[test]
    fn rejects_malformed_state() {
        assert!(MachineState::from_json(b"not json").is_err());
        assert!(MachineState::from_json(b"{\"vcpus\": \"two\"}").is_err());
    }

    #[test]
    fn device_order_is_preserved() {
        let state = MachineState {
            vcpus: 1,
            devices: vec![
                DeviceInfo::new("a", "debug-port"),
                DeviceInfo::new("b", "debug-port"),
                DeviceInfo::new("c", "debug-port"),
            ],
        };
        let back = MachineState::from_json(&state.to_json().unwrap()).unwrap();
        let names: Vec<_> = back.devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }
}
