//! The machine supervisor.
//!
//! [`Machine`] owns the KVM handles, the memory map, the attached devices
//! and the vCPU set, and ties the pieces together: device attach builds
//! the I/O handler tables, [`start`](Machine::start) freezes them into a
//! shared [`Model`] and spawns one executor thread per vCPU, and
//! [`wait`](Machine::wait) supervises until every vCPU has exited.
//!
//! Aggregate pause walks vCPUs first and devices second: a vCPU in the
//! middle of an I/O exit is not quiescent until the device operation
//! completes, so devices must still be able to make progress while the
//! vCPUs drain.

use std::sync::Arc;
use std::thread;

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::{Kvm, VmFd};
use log::{debug, info};
use thiserror::Error;
use vm_memory::{Address, GuestAddress, MmapRegion};
use vmm_sys_util::signal::Killable;

use crate::cache::{HandlerTable, IoCache, IoSpace};
use crate::devices::{self, Device, DeviceError, DeviceInfo};
use crate::io::{open_bus_value, IoError, IoOperations, IoHandler, WriteOutcome};
use crate::memory::{MemoryError, MemoryKind, MemoryMap, MemoryRegion, RegionMapper, PAGE_SIZE};
use crate::pause::PauseError;
use crate::state::MachineState;
use crate::vcpu::{kick_signal, RunState, Vcpu, VcpuError};

/// Errors fatal to machine construction or supervision.
#[derive(Error, Debug)]
pub enum MachineError {
    /// Opening `/dev/kvm` failed.
    #[error("failed to open /dev/kvm: {0}")]
    KvmOpen(#[source] kvm_ioctls::Error),

    /// Creating the kernel VM failed.
    #[error("failed to create VM: {0}")]
    VmCreate(#[source] kvm_ioctls::Error),

    /// `start` was called with no vCPUs configured.
    #[error("no vcpus")]
    NoVcpus,

    /// The operation requires a machine that has not started yet.
    #[error("machine is already running")]
    AlreadyRunning,

    /// The operation requires a started machine.
    #[error("machine is not running")]
    NotRunning,

    /// No vCPU with this id exists.
    #[error("unknown vcpu: {0}")]
    UnknownVcpu(usize),

    /// A vCPU loop died with an error.
    #[error("vcpu[{id}] failed: {source}")]
    Vcpu {
        /// Which vCPU.
        id: usize,
        #[source]
        source: VcpuError,
    },

    /// A vCPU worker thread panicked.
    #[error("vcpu[{0}] worker panicked")]
    VcpuPanic(usize),

    /// Spawning a vCPU worker thread failed.
    #[error("failed to spawn vcpu worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Pause(#[from] PauseError),
}

/// Hands out KVM memory slots. One per machine; never reused.
#[derive(Debug, Default)]
pub struct SlotAllocator {
    next: u32,
}

impl SlotAllocator {
    fn allocate(&mut self) -> u32 {
        let slot = self.next;
        self.next += 1;
        slot
    }

    /// Next slot that would be handed out.
    pub fn next_slot(&self) -> u32 {
        self.next
    }
}

/// [`RegionMapper`] over a live KVM VM.
struct KvmRegionMapper<'a> {
    vm: &'a VmFd,
    slots: &'a mut SlotAllocator,
}

impl RegionMapper for KvmRegionMapper<'_> {
    fn map_user(
        &mut self,
        start: GuestAddress,
        size: u64,
        backing: &MmapRegion,
    ) -> Result<(), MemoryError> {
        let region = kvm_userspace_memory_region {
            slot: self.slots.allocate(),
            flags: 0,
            guest_phys_addr: start.raw_value(),
            memory_size: size,
            userspace_addr: backing.as_ptr() as u64,
        };
        // Safe: the backing mapping outlives the VM fd (the memory map
        // holds it for the life of the machine).
        unsafe { self.vm.set_user_memory_region(region) }.map_err(MemoryError::Mapping)
    }

    fn map_reserved(&mut self, start: GuestAddress, size: u64) -> Result<(), MemoryError> {
        debug!(
            "reserved [{:#x},{:#x}) with no kernel mapping",
            start.raw_value(),
            start.raw_value() + size,
        );
        Ok(())
    }

    fn map_special(&mut self, start: GuestAddress) -> Result<(), MemoryError> {
        self.vm
            .set_identity_map_address(start.raw_value())
            .map_err(MemoryError::Mapping)?;
        self.vm
            .set_tss_address((start.raw_value() + PAGE_SIZE) as usize)
            .map_err(MemoryError::Mapping)
    }
}

/// Attach-time registration surface handed to [`Device::attach`].
pub struct AttachContext<'m> {
    device: Arc<dyn Device>,
    mapper: &'m mut dyn RegionMapper,
    memory: &'m mut MemoryMap,
    pio: &'m mut HandlerTable,
    mmio: &'m mut HandlerTable,
}

impl AttachContext<'_> {
    /// The device being attached.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Declare a port I/O range and its operations. Port ranges are not
    /// reserved in the memory map; on collisions, the earliest attached
    /// device wins lookup.
    pub fn register_pio(&mut self, region: MemoryRegion, operations: Box<dyn IoOperations>) {
        let handler = IoHandler::new(Arc::clone(&self.device), region.start, operations);
        self.pio.push((region, handler));
    }

    /// Declare an MMIO range and its operations.
    pub fn register_mmio(&mut self, region: MemoryRegion, operations: Box<dyn IoOperations>) {
        let handler = IoHandler::new(Arc::clone(&self.device), region.start, operations);
        self.mmio.push((region, handler));
    }

    /// Reserve a guest-physical region owned by this device.
    pub fn reserve(
        &mut self,
        kind: MemoryKind,
        start: GuestAddress,
        size: u64,
        backing: Option<Arc<MmapRegion>>,
    ) -> Result<(), DeviceError> {
        self.memory
            .reserve(self.mapper, &self.device, kind, start, size, backing)?;
        Ok(())
    }
}

/// The frozen dispatch state shared by every executor: the two I/O caches
/// and the VM handle for fast-path promotion.
pub struct Model {
    vm: Option<Arc<VmFd>>,
    pio: IoCache,
    mmio: IoCache,
}

impl Model {
    /// Build the dispatch model over the attached devices' range tables.
    pub fn new(vm: Arc<VmFd>, pio: Vec<HandlerTable>, mmio: Vec<HandlerTable>) -> Self {
        Self {
            vm: Some(vm),
            pio: IoCache::new(pio, IoSpace::Pio),
            mmio: IoCache::new(mmio, IoSpace::Mmio),
        }
    }

    /// Dispatch model with no kernel VM behind it; fast-path promotion is
    /// disabled. Unit tests drive dispatch through this.
    #[cfg(test)]
    pub(crate) fn detached(pio: Vec<HandlerTable>, mmio: Vec<HandlerTable>) -> Self {
        Self {
            vm: None,
            pio: IoCache::new(pio, IoSpace::Pio),
            mmio: IoCache::new(mmio, IoSpace::Mmio),
        }
    }

    /// Handle a port read exit.
    pub fn pio_read(&self, port: u64, data: &mut [u8]) -> Result<(), IoError> {
        self.handle_read(&self.pio, GuestAddress(port), data)
    }

    /// Handle a port write exit.
    pub fn pio_write(&self, port: u64, data: &[u8]) -> Result<(), IoError> {
        self.handle_write(&self.pio, GuestAddress(port), data)
    }

    /// Handle an MMIO read exit.
    pub fn mmio_read(&self, addr: u64, data: &mut [u8]) -> Result<(), IoError> {
        self.handle_read(&self.mmio, GuestAddress(addr), data)
    }

    /// Handle an MMIO write exit.
    pub fn mmio_write(&self, addr: u64, data: &[u8]) -> Result<(), IoError> {
        self.handle_write(&self.mmio, GuestAddress(addr), data)
    }

    fn handle_read(
        &self,
        cache: &IoCache,
        addr: GuestAddress,
        data: &mut [u8],
    ) -> Result<(), IoError> {
        let size = data.len().min(8) as u8;
        let value = match cache.lookup(addr) {
            Some(handler) => {
                let offset = addr.raw_value() - handler.base().raw_value();
                handler.read(offset, size)?
            }
            // Unassigned bus: reads float high.
            None => open_bus_value(size),
        };
        let bytes = value.to_le_bytes();
        let len = data.len().min(8);
        data[..len].copy_from_slice(&bytes[..len]);
        Ok(())
    }

    fn handle_write(&self, cache: &IoCache, addr: GuestAddress, data: &[u8]) -> Result<(), IoError> {
        let size = data.len().min(8) as u8;
        let mut raw = [0u8; 8];
        let len = data.len().min(8);
        raw[..len].copy_from_slice(&data[..len]);
        let value = u64::from_le_bytes(raw);

        match cache.lookup(addr) {
            Some(handler) => {
                let offset = addr.raw_value() - handler.base().raw_value();
                if handler.write(offset, size, value)? == WriteOutcome::Defer {
                    if let Some(vm) = &self.vm {
                        cache.promote(vm, &handler, addr, size, value, offset)?;
                    }
                }
                Ok(())
            }
            // Unassigned bus: writes are silently dropped.
            None => Ok(()),
        }
    }
}

struct VcpuSlot {
    id: usize,
    vcpu: Option<Vcpu>,
    state: Arc<RunState>,
    thread: Option<thread::JoinHandle<Result<(), VcpuError>>>,
}

impl VcpuSlot {
    /// Pause this vCPU, kicking its worker out of the kernel if needed.
    fn pause(&self, manual: bool) -> Result<(), PauseError> {
        self.state.pause(manual, || {
            if let Some(thread) = &self.thread {
                // Ignored on a worker that already exited.
                let _ = thread.kill(kick_signal());
            }
        })
    }
}

/// Machine-level configuration: the vCPU count and device roster.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Number of vCPUs to create.
    pub vcpus: usize,
    /// Devices to construct and attach, in order.
    pub devices: Vec<DeviceInfo>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            vcpus: 1,
            devices: Vec::new(),
        }
    }
}

/// A virtual machine: kernel handles, memory map, devices, vCPUs.
pub struct Machine {
    kvm: Kvm,
    vm: Arc<VmFd>,
    slots: SlotAllocator,
    memory: MemoryMap,
    devices: Vec<Arc<dyn Device>>,
    pio_tables: Vec<HandlerTable>,
    mmio_tables: Vec<HandlerTable>,
    model: Option<Arc<Model>>,
    vcpus: Vec<VcpuSlot>,
}

impl Machine {
    /// Open KVM and create an empty machine.
    pub fn new() -> Result<Self, MachineError> {
        let kvm = Kvm::new().map_err(MachineError::KvmOpen)?;
        let vm = kvm.create_vm().map_err(MachineError::VmCreate)?;
        Ok(Self {
            kvm,
            vm: Arc::new(vm),
            slots: SlotAllocator::default(),
            memory: MemoryMap::new(),
            devices: Vec::new(),
            pio_tables: Vec::new(),
            mmio_tables: Vec::new(),
            model: None,
            vcpus: Vec::new(),
        })
    }

    /// Build a machine from config: devices first, then vCPUs.
    pub fn from_config(config: &MachineConfig) -> Result<Self, MachineError> {
        let mut machine = Self::new()?;
        machine.create_devices(&config.devices)?;
        machine.create_vcpus(config.vcpus)?;
        Ok(machine)
    }

    /// Rebuild a machine from serialized state.
    pub fn from_state(state: &MachineState) -> Result<Self, MachineError> {
        let mut machine = Self::new()?;
        machine.create_devices(&state.devices)?;
        machine.create_vcpus(state.vcpus)?;
        Ok(machine)
    }

    /// The system KVM handle.
    pub fn kvm(&self) -> &Kvm {
        &self.kvm
    }

    /// The kernel VM handle.
    pub fn vm(&self) -> &Arc<VmFd> {
        &self.vm
    }

    /// The guest-physical memory map.
    pub fn memory(&self) -> &MemoryMap {
        &self.memory
    }

    /// Mutable memory map, for boot-loader placement before start.
    pub fn memory_mut(&mut self) -> &mut MemoryMap {
        &mut self.memory
    }

    /// Attached devices, in attach order.
    pub fn devices(&self) -> &[Arc<dyn Device>] {
        &self.devices
    }

    /// Reserve a guest-physical region on behalf of `device`.
    pub fn reserve(
        &mut self,
        device: &Arc<dyn Device>,
        kind: MemoryKind,
        start: GuestAddress,
        size: u64,
        backing: Option<Arc<MmapRegion>>,
    ) -> Result<(), MachineError> {
        let mut mapper = KvmRegionMapper {
            vm: &self.vm,
            slots: &mut self.slots,
        };
        self.memory
            .reserve(&mut mapper, device, kind, start, size, backing)?;
        Ok(())
    }

    /// Construct and attach every device in `specs`, in order.
    pub fn create_devices(&mut self, specs: &[DeviceInfo]) -> Result<(), MachineError> {
        for info in specs {
            let device = devices::create_device(info)?;
            self.attach_device(device)?;
        }
        Ok(())
    }

    /// Attach one device: run its registration and record its I/O tables.
    pub fn attach_device(&mut self, device: Arc<dyn Device>) -> Result<(), MachineError> {
        if self.model.is_some() {
            return Err(MachineError::AlreadyRunning);
        }
        info!("attaching {} ({})", device.name(), device.driver());

        let mut pio = HandlerTable::new();
        let mut mmio = HandlerTable::new();
        let mut mapper = KvmRegionMapper {
            vm: &self.vm,
            slots: &mut self.slots,
        };
        let mut ctx = AttachContext {
            device: Arc::clone(&device),
            mapper: &mut mapper,
            memory: &mut self.memory,
            pio: &mut pio,
            mmio: &mut mmio,
        };
        device.attach(&mut ctx)?;

        self.pio_tables.push(pio);
        self.mmio_tables.push(mmio);
        self.devices.push(device);
        Ok(())
    }

    /// Create `count` vCPUs, ids `0..count`.
    pub fn create_vcpus(&mut self, count: usize) -> Result<(), MachineError> {
        for _ in 0..count {
            let id = self.vcpus.len();
            let vcpu = Vcpu::new(&self.vm, id).map_err(|source| MachineError::Vcpu { id, source })?;
            self.vcpus.push(VcpuSlot {
                id,
                state: Arc::clone(vcpu.run_state()),
                vcpu: Some(vcpu),
                thread: None,
            });
        }
        Ok(())
    }

    /// Pre-start access to a vCPU, for register setup and stepping.
    pub fn vcpu_mut(&mut self, id: usize) -> Option<&mut Vcpu> {
        self.vcpus.get_mut(id).and_then(|slot| slot.vcpu.as_mut())
    }

    /// Spawn one executor worker per vCPU.
    ///
    /// Each worker owns its vCPU handle for the machine's lifetime; the
    /// blocking run call never migrates between threads.
    pub fn start(&mut self) -> Result<(), MachineError> {
        if self.vcpus.is_empty() {
            return Err(MachineError::NoVcpus);
        }
        if self.model.is_some() {
            return Err(MachineError::AlreadyRunning);
        }

        let model = Arc::new(Model::new(
            Arc::clone(&self.vm),
            std::mem::take(&mut self.pio_tables),
            std::mem::take(&mut self.mmio_tables),
        ));
        self.model = Some(Arc::clone(&model));

        for slot in &mut self.vcpus {
            let vcpu = slot.vcpu.take().ok_or(MachineError::AlreadyRunning)?;
            let model = Arc::clone(&model);
            let handle = thread::Builder::new()
                .name(format!("vcpu{}", slot.id))
                .spawn(move || vcpu.run_loop(model))
                .map_err(MachineError::Spawn)?;
            slot.thread = Some(handle);
        }
        Ok(())
    }

    /// Join every vCPU worker. Returns the first vCPU failure, if any;
    /// clean guest shutdown on all vCPUs is `Ok`.
    pub fn wait(&mut self) -> Result<(), MachineError> {
        if self.model.is_none() {
            return Err(MachineError::NotRunning);
        }
        let mut first_error = None;
        for slot in &mut self.vcpus {
            if let Some(thread) = slot.thread.take() {
                let outcome = match thread.join() {
                    Ok(Ok(())) => None,
                    Ok(Err(source)) => Some(MachineError::Vcpu {
                        id: slot.id,
                        source,
                    }),
                    Err(_) => Some(MachineError::VcpuPanic(slot.id)),
                };
                if let Some(err) = outcome {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Pause one vCPU; used by the debugger for interactive stepping.
    pub fn pause_vcpu(&self, id: usize, manual: bool) -> Result<(), MachineError> {
        let slot = self.vcpus.get(id).ok_or(MachineError::UnknownVcpu(id))?;
        slot.pause(manual)?;
        Ok(())
    }

    /// Resume one vCPU.
    pub fn unpause_vcpu(&self, id: usize, manual: bool) -> Result<(), MachineError> {
        let slot = self.vcpus.get(id).ok_or(MachineError::UnknownVcpu(id))?;
        slot.state.unpause(manual)?;
        Ok(())
    }

    /// Pause every vCPU. On failure, vCPUs already paused by this call are
    /// rolled back. A vCPU already manually paused (an attached debugger)
    /// is tolerated and left as it was.
    pub fn pause(&self, manual: bool) -> Result<(), MachineError> {
        for (i, slot) in self.vcpus.iter().enumerate() {
            match slot.pause(manual) {
                Ok(()) | Err(PauseError::AlreadyPaused) => {}
                Err(err) => {
                    for prev in self.vcpus[..i].iter().rev() {
                        let _ = prev.state.unpause(manual);
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Resume every vCPU, mirroring [`pause`](Self::pause).
    pub fn unpause(&self, manual: bool) -> Result<(), MachineError> {
        for (i, slot) in self.vcpus.iter().enumerate() {
            match slot.state.unpause(manual) {
                Ok(()) | Err(PauseError::NotPaused) => {}
                Err(err) => {
                    for prev in self.vcpus[..i].iter().rev() {
                        let _ = prev.pause(manual);
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Pause every device, with the same rollback discipline as
    /// [`pause`](Self::pause).
    pub fn pause_devices(&self, manual: bool) -> Result<(), MachineError> {
        for (i, device) in self.devices.iter().enumerate() {
            match device.pause(manual) {
                Ok(()) | Err(PauseError::AlreadyPaused) => {}
                Err(err) => {
                    for prev in self.devices[..i].iter().rev() {
                        let _ = prev.unpause(manual);
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Resume every device.
    pub fn unpause_devices(&self, manual: bool) -> Result<(), MachineError> {
        for (i, device) in self.devices.iter().enumerate() {
            match device.unpause(manual) {
                Ok(()) | Err(PauseError::NotPaused) => {}
                Err(err) => {
                    for prev in self.devices[..i].iter().rev() {
                        let _ = prev.pause(manual);
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Capture serialized machine state at a globally quiescent point.
    ///
    /// Brackets the collection in an automatic pause of every vCPU, then
    /// every device; state is read only after all of them have confirmed
    /// quiescence.
    pub fn save(&self) -> Result<MachineState, MachineError> {
        self.pause(false)?;
        self.pause_devices(false)?;

        let collected: Result<Vec<DeviceInfo>, DeviceError> =
            self.devices.iter().map(devices::device_info).collect();

        self.unpause_devices(false)?;
        self.unpause(false)?;

        Ok(MachineState {
            vcpus: self.vcpus.len(),
            devices: collected?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::testing::scratch_device;
    use crate::io::IoError;

    struct CountingOps {
        reads: u64,
        writes: u64,
        defer: bool,
    }

    impl IoOperations for CountingOps {
        fn read(&mut self, offset: u64, _size: u8) -> Result<u64, IoError> {
            self.reads += 1;
            Ok(0x1100 + offset)
        }

        fn write(&mut self, _offset: u64, _size: u8, _value: u64) -> Result<WriteOutcome, IoError> {
            self.writes += 1;
            if self.defer {
                Ok(WriteOutcome::Defer)
            } else {
                Ok(WriteOutcome::Handled)
            }
        }
    }

    fn model_with_port(base: u64, len: u64, defer: bool) -> Model {
        let handler = IoHandler::new(
            scratch_device("model-test"),
            GuestAddress(base),
            Box::new(CountingOps {
                reads: 0,
                writes: 0,
                defer,
            }),
        );
        let table = vec![(MemoryRegion::new(GuestAddress(base), len), handler)];
        Model::detached(vec![table], Vec::new())
    }

    #[test]
    fn mapped_port_read_reaches_device() {
        let model = model_with_port(0x3f8, 8, false);
        let mut data = [0u8; 2];
        model.pio_read(0x3fa, &mut data).unwrap();
        // Offset 2 within the range.
        assert_eq!(u16::from_le_bytes(data), 0x1102);
    }

    #[test]
    fn unmapped_reads_float_high_per_width() {
        let model = Model::detached(Vec::new(), Vec::new());

        let mut b1 = [0u8; 1];
        model.pio_read(0x400, &mut b1).unwrap();
        assert_eq!(b1, [0xff]);

        let mut b2 = [0u8; 2];
        model.pio_read(0x400, &mut b2).unwrap();
        assert_eq!(b2, [0xff, 0xff]);

        let mut b4 = [0u8; 4];
        model.mmio_read(0xdead_0000, &mut b4).unwrap();
        assert_eq!(b4, [0xff; 4]);

        let mut b8 = [0u8; 8];
        model.mmio_read(0xdead_0000, &mut b8).unwrap();
        assert_eq!(b8, [0xff; 8]);
    }

    #[test]
    fn unmapped_write_is_dropped() {
        let model = Model::detached(Vec::new(), Vec::new());
        model.pio_write(0x400, &[0x41]).unwrap();
        model.mmio_write(0xdead_0000, &[1, 2, 3, 4]).unwrap();
    }

    #[test]
    fn mapped_write_reaches_device() {
        let model = model_with_port(0x80, 1, false);
        model.pio_write(0x80, &[0x42]).unwrap();
        // A second write at the same port goes through the same handler.
        model.pio_write(0x80, &[0x43]).unwrap();
    }

    #[test]
    fn deferred_write_without_vm_stays_handled() {
        // In a detached model there is no kernel to bind an ioeventfd
        // against; the deferred write itself must still complete.
        let model = model_with_port(0x80, 1, true);
        model.pio_write(0x80, &[0x42]).unwrap();
    }

    #[test]
    fn attached_debug_port_round_trips_through_dispatch() {
        struct NoopMapper;

        impl RegionMapper for NoopMapper {
            fn map_user(
                &mut self,
                _start: GuestAddress,
                _size: u64,
                _backing: &MmapRegion,
            ) -> Result<(), MemoryError> {
                Ok(())
            }

            fn map_reserved(&mut self, _start: GuestAddress, _size: u64) -> Result<(), MemoryError> {
                Ok(())
            }

            fn map_special(&mut self, _start: GuestAddress) -> Result<(), MemoryError> {
                Ok(())
            }
        }

        let info = DeviceInfo::new("post0", "debug-port");
        let device = devices::create_device(&info).unwrap();

        let mut mapper = NoopMapper;
        let mut memory = MemoryMap::new();
        let mut pio = HandlerTable::new();
        let mut mmio = HandlerTable::new();
        let mut ctx = AttachContext {
            device: Arc::clone(&device),
            mapper: &mut mapper,
            memory: &mut memory,
            pio: &mut pio,
            mmio: &mut mmio,
        };
        device.attach(&mut ctx).unwrap();

        let model = Model::detached(vec![pio], vec![mmio]);
        model.pio_write(0x80, &[0x5a]).unwrap();
        let mut data = [0u8; 1];
        model.pio_read(0x80, &mut data).unwrap();
        assert_eq!(data, [0x5a]);

        // The write landed in the device itself, not just the handler.
        let saved = device.save().unwrap();
        assert_eq!(saved["last"], 0x5a);
    }

    #[test]
    fn slot_allocator_is_monotonic() {
        let mut slots = SlotAllocator::default();
        assert_eq!(slots.allocate(), 0);
        assert_eq!(slots.allocate(), 1);
        assert_eq!(slots.allocate(), 2);
        assert_eq!(slots.next_slot(), 3);
    }

    #[test]
    fn default_config_is_one_vcpu_no_devices() {
        let config = MachineConfig::default();
        assert_eq!(config.vcpus, 1);
        assert!(config.devices.is_empty());
    }
}
