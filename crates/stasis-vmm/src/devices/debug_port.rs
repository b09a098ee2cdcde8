//! POST diagnostic port (I/O port 0x80).
//!
//! Firmware and early kernel code write progress codes to port 0x80; real
//! chipsets latch the last value for a front-panel display. This driver
//! latches it too, which makes it the smallest useful PIO device and the
//! standard smoke test for the dispatch path.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use vm_memory::GuestAddress;

use super::{Device, DeviceCore, DeviceError, DeviceInfo};
use crate::io::{IoError, IoOperations, WriteOutcome};
use crate::machine::AttachContext;
use crate::memory::MemoryRegion;

/// The standard POST code port.
pub const DEBUG_PORT_BASE: u64 = 0x80;

/// Latched POST code device.
#[derive(Debug)]
pub struct DebugPort {
    core: DeviceCore,
    last: Arc<Mutex<u8>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DebugPortState {
    last: u8,
}

impl DebugPort {
    /// Factory-table constructor.
    pub fn from_info(info: &DeviceInfo) -> Result<Arc<dyn Device>, DeviceError> {
        Ok(Arc::new(Self {
            core: DeviceCore::new(info),
            last: Arc::new(Mutex::new(0)),
        }))
    }

    /// The most recently written POST code.
    pub fn last_code(&self) -> u8 {
        *self.last.lock().expect("debug port poisoned")
    }
}

impl Device for DebugPort {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn attach(&self, ctx: &mut AttachContext<'_>) -> Result<(), DeviceError> {
        ctx.register_pio(
            MemoryRegion::new(GuestAddress(DEBUG_PORT_BASE), 1),
            Box::new(DebugPortOps {
                last: Arc::clone(&self.last),
            }),
        );
        Ok(())
    }

    fn load(&self, state: serde_json::Value) -> Result<(), DeviceError> {
        let state: DebugPortState = serde_json::from_value(state)?;
        *self.last.lock().expect("debug port poisoned") = state.last;
        Ok(())
    }

    fn save(&self) -> Result<serde_json::Value, DeviceError> {
        Ok(serde_json::to_value(DebugPortState {
            last: self.last_code(),
        })?)
    }
}

struct DebugPortOps {
    last: Arc<Mutex<u8>>,
}

impl IoOperations for DebugPortOps {
    fn read(&mut self, _offset: u64, _size: u8) -> Result<u64, IoError> {
        Ok(u64::from(*self.last.lock().expect("debug port poisoned")))
    }

    fn write(&mut self, _offset: u64, _size: u8, value: u64) -> Result<WriteOutcome, IoError> {
        *self.last.lock().expect("debug port poisoned") = value as u8;
        Ok(WriteOutcome::Handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::create_device;
    use crate::io::{IoAccess, IoCompletion, IoHandler};

    #[test]
    fn latches_last_write() {
        let mut ops = DebugPortOps {
            last: Arc::new(Mutex::new(0)),
        };
        ops.write(0, 1, 0x42).unwrap();
        assert_eq!(ops.read(0, 1).unwrap(), 0x42);
        ops.write(0, 1, 0x13).unwrap();
        assert_eq!(ops.read(0, 1).unwrap(), 0x13);
    }

    #[test]
    fn state_round_trips_through_factory() {
        let mut info = DeviceInfo::new("post0", "debug-port");
        info.data = serde_json::json!({"last": 0x5a});
        let device = create_device(&info).unwrap();

        let saved = device.save().unwrap();
        assert_eq!(saved["last"], 0x5a);
    }

    #[test]
    fn serialized_dispatch_reaches_the_latch() {
        let info = DeviceInfo::new("post0", "debug-port");
        let device = DebugPort::from_info(&info).unwrap();
        let handler = IoHandler::new(
            Arc::clone(&device),
            GuestAddress(DEBUG_PORT_BASE),
            Box::new(DebugPortOps {
                last: Arc::new(Mutex::new(0)),
            }),
        );

        handler
            .submit(IoAccess::Write { size: 1, value: 0x99 }, 0)
            .unwrap();
        let read = handler.submit(IoAccess::Read { size: 1 }, 0).unwrap();
        assert_eq!(read, IoCompletion::Read(0x99));
    }
}
