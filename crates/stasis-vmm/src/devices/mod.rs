//! The device capability set and driver factory.
//!
//! The core consumes devices strictly through the [`Device`] trait:
//! identity, I/O range registration at attach time, pause/acquire per
//! [`crate::pause`], state save/load, interrupt injection and debug
//! gating. Concrete drivers implement [`Device::core`] over an embedded
//! [`DeviceCore`] and override the handful of methods they care about.
//!
//! Drivers are registered in a process-wide name→constructor table,
//! populated once and read-only thereafter; [`create_device`] resolves a
//! serialized [`DeviceInfo`] against it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::io::IoError;
use crate::machine::AttachContext;
use crate::pause::{PauseError, PauseState};

pub mod debug_port;

/// Errors from device construction, attach, and state round-trips.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// No driver with this name is registered.
    #[error("unknown driver: {0}")]
    UnknownDriver(String),

    /// Serialized device state did not match the driver's schema.
    #[error("bad device state: {0}")]
    State(#[from] serde_json::Error),

    /// Setting up the device's I/O plumbing failed.
    #[error("device I/O setup failed: {0}")]
    Io(#[from] IoError),

    /// Reserving the device's memory regions failed.
    #[error("device memory setup failed: {0}")]
    Memory(#[from] crate::memory::MemoryError),

    /// A kernel call on behalf of the device failed.
    #[error("kernel call failed: {0}")]
    Kvm(#[source] kvm_ioctls::Error),
}

/// Serialized device descriptor: identity plus driver-defined state.
///
/// This is what machine snapshots carry per device; `data` is opaque to
/// the core and round-trips through [`Device::save`]/[`Device::load`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Instance name, unique within a machine.
    pub name: String,
    /// Driver name, resolved against the factory table.
    pub driver: String,
    /// Driver-defined state blob.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Whether per-device debug logging is enabled.
    #[serde(default)]
    pub debug: bool,
}

impl DeviceInfo {
    /// Descriptor with no state payload.
    pub fn new(name: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: driver.into(),
            data: serde_json::Value::Null,
            debug: false,
        }
    }
}

/// Identity, pause bookkeeping and debug flag shared by every driver.
#[derive(Debug)]
pub struct DeviceCore {
    name: String,
    driver: String,
    pause: PauseState,
    debug: AtomicBool,
}

impl DeviceCore {
    pub fn new(info: &DeviceInfo) -> Self {
        Self {
            name: info.name.clone(),
            driver: info.driver.clone(),
            pause: PauseState::new(),
            debug: AtomicBool::new(info.debug),
        }
    }
}

/// The fixed capability set the core consumes from every device.
pub trait Device: Send + Sync + fmt::Debug {
    /// The shared bookkeeping embedded in the driver.
    fn core(&self) -> &DeviceCore;

    /// Register I/O ranges and reserve memory regions. Called once, after
    /// construction, before any vCPU runs.
    fn attach(&self, ctx: &mut AttachContext<'_>) -> Result<(), DeviceError> {
        let _ = ctx;
        Ok(())
    }

    /// Overlay serialized state onto this device.
    fn load(&self, state: serde_json::Value) -> Result<(), DeviceError> {
        let _ = state;
        Ok(())
    }

    /// Capture this device's state for serialization.
    fn save(&self) -> Result<serde_json::Value, DeviceError> {
        Ok(serde_json::Value::Null)
    }

    /// Assert this device's interrupt.
    fn interrupt(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Instance name.
    fn name(&self) -> &str {
        &self.core().name
    }

    /// Driver name.
    fn driver(&self) -> &str {
        &self.core().driver
    }

    /// Request quiescence; see [`PauseState::pause`].
    fn pause(&self, manual: bool) -> Result<(), PauseError> {
        self.core().pause.pause(manual)
    }

    /// Drop one pause request; see [`PauseState::unpause`].
    fn unpause(&self, manual: bool) -> Result<(), PauseError> {
        self.core().pause.unpause(manual)
    }

    /// Take shared access for one operation.
    fn acquire(&self) {
        self.core().pause.acquire()
    }

    /// Give back shared access.
    fn release(&self) {
        self.core().pause.release()
    }

    /// Whether debug logging is enabled for this instance.
    fn debugging(&self) -> bool {
        self.core().debug.load(Ordering::Relaxed)
    }

    /// Toggle debug logging for this instance.
    fn set_debugging(&self, on: bool) {
        self.core().debug.store(on, Ordering::Relaxed)
    }

    /// Log through the `log` facade when debugging is enabled.
    fn debug(&self, args: fmt::Arguments<'_>) {
        if self.debugging() {
            log::debug!("{}: {}", self.name(), args);
        }
    }
}

/// A driver constructor, as stored in the factory table.
pub type DriverFn = fn(&DeviceInfo) -> Result<Arc<dyn Device>, DeviceError>;

fn driver_table() -> &'static HashMap<&'static str, DriverFn> {
    static TABLE: OnceLock<HashMap<&'static str, DriverFn>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: HashMap<&'static str, DriverFn> = HashMap::new();
        table.insert("debug-port", debug_port::DebugPort::from_info);
        table
    })
}

/// Names of all registered drivers.
pub fn available_drivers() -> Vec<&'static str> {
    let mut names: Vec<_> = driver_table().keys().copied().collect();
    names.sort_unstable();
    names
}

/// Construct a device from its serialized descriptor.
///
/// Resolves the driver, overlays `info.data` onto the fresh instance, and
/// applies the debug flag.
pub fn create_device(info: &DeviceInfo) -> Result<Arc<dyn Device>, DeviceError> {
    let constructor = driver_table()
        .get(info.driver.as_str())
        .ok_or_else(|| DeviceError::UnknownDriver(info.driver.clone()))?;
    let device = constructor(info)?;
    if !info.data.is_null() {
        log::info!("loading state into {}...", device.name());
        device.load(info.data.clone())?;
    }
    device.set_debugging(info.debug);
    Ok(device)
}

/// Capture a device back into a serialized descriptor.
pub fn device_info(device: &Arc<dyn Device>) -> Result<DeviceInfo, DeviceError> {
    Ok(DeviceInfo {
        name: device.name().to_string(),
        driver: device.driver().to_string(),
        data: device.save()?,
        debug: device.debugging(),
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Inert device used by unit tests across the crate.
    #[derive(Debug)]
    pub(crate) struct ScratchDevice {
        core: DeviceCore,
    }

    impl Device for ScratchDevice {
        fn core(&self) -> &DeviceCore {
            &self.core
        }
    }

    pub(crate) fn scratch_device(name: &str) -> Arc<dyn Device> {
        Arc::new(ScratchDevice {
            core: DeviceCore::new(&DeviceInfo::new(name, "scratch")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_rejects_unknown_driver() {
        let info = DeviceInfo::new("nope", "no-such-driver");
        let err = create_device(&info).unwrap_err();
        assert!(matches!(err, DeviceError::UnknownDriver(name) if name == "no-such-driver"));
    }

    #[test]
    fn factory_builds_registered_driver() {
        let info = DeviceInfo::new("post0", "debug-port");
        let device = create_device(&info).unwrap();
        assert_eq!(device.name(), "post0");
        assert_eq!(device.driver(), "debug-port");
        assert!(!device.debugging());
    }

    #[test]
    fn factory_applies_debug_flag() {
        let mut info = DeviceInfo::new("post0", "debug-port");
        info.debug = true;
        let device = create_device(&info).unwrap();
        assert!(device.debugging());
    }

    #[test]
    fn driver_table_lists_builtins() {
        assert!(available_drivers().contains(&"debug-port"));
    }

    #[test]
    fn device_info_serde_round_trip() {
        let mut info = DeviceInfo::new("post0", "debug-port");
        info.data = serde_json::json!({"last": 7});
        let text = serde_json::to_string(&info).unwrap();
        let back: DeviceInfo = serde_json::from_str(&text).unwrap();
        assert_eq!(back.name, "post0");
        assert_eq!(back.driver, "debug-port");
        assert_eq!(back.data["last"], 7);
        assert!(!back.debug);
    }

    #[test]
    fn default_capabilities_are_inert() {
        let device = testing::scratch_device("inert");
        assert!(device.save().unwrap().is_null());
        device.interrupt().unwrap();
        device.pause(true).unwrap();
        device.unpause(true).unwrap();
    }
}
