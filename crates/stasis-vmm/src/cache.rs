//! Address→handler resolution with memoization and fast-path promotion.
//!
//! The [`IoCache`] maps guest addresses to the [`IoHandler`] responsible
//! for them. Misses scan every attached device's declared range table and
//! memoize the result, so steady-state lookups are O(1). A miss after the
//! full scan is not an error: unassigned address space behaves like an
//! open bus (see [`crate::io::open_bus_value`]).
//!
//! # Fast-path promotion
//!
//! When a device reports [`WriteOutcome::Defer`] for a write and the
//! address has accrued enough hits, the cache binds a kernel ioeventfd to
//! that exact address and value, so subsequent matching writes complete in
//! the kernel without a vCPU exit reaching this dispatch path at all. A
//! background waiter keeps re-submitting the memoized write to the device
//! after each kernel-side completion, until the device stops returning
//! `Defer`; then the binding is released. The hit threshold keeps
//! eventfds away from addresses that fire only a few times, like the
//! doorbell of an unused NIC.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use kvm_ioctls::{IoEventAddress, VmFd};
use log::{debug, warn};
use vm_memory::{Address, GuestAddress};
use vmm_sys_util::eventfd::EventFd;

use crate::io::{IoError, IoHandler, WriteOutcome};
use crate::memory::MemoryRegion;

/// Hits at one address before a deferred write is promoted to an
/// ioeventfd binding. Tunable; there is no decay or eviction.
pub const PROMOTE_HIT_THRESHOLD: u64 = 100;

/// Which guest I/O space a cache serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoSpace {
    /// Port I/O.
    Pio,
    /// Memory-mapped I/O.
    Mmio,
}

/// One device's declared ranges and their handlers.
pub type HandlerTable = Vec<(MemoryRegion, Arc<IoHandler>)>;

#[derive(Default)]
struct Memo {
    handlers: HashMap<u64, Arc<IoHandler>>,
    hits: HashMap<u64, u64>,
}

/// Derived address→handler map over the attached devices' range tables.
///
/// Safe to rebuild from the device list at any time, e.g. after attach.
pub struct IoCache {
    tables: Vec<HandlerTable>,
    space: IoSpace,
    memo: Mutex<Memo>,
}

impl IoCache {
    pub fn new(tables: Vec<HandlerTable>, space: IoSpace) -> Self {
        Self {
            tables,
            space,
            memo: Mutex::new(Memo::default()),
        }
    }

    /// The I/O space this cache serves.
    pub fn space(&self) -> IoSpace {
        self.space
    }

    /// Resolve `addr` to its handler, counting the hit.
    ///
    /// First resolution of an address scans every device's range table;
    /// repeats are served from the memo. `None` means unassigned address
    /// space.
    pub fn lookup(&self, addr: GuestAddress) -> Option<Arc<IoHandler>> {
        let key = addr.raw_value();
        let mut memo = self.memo.lock().expect("I/O cache poisoned");

        if let Some(handler) = memo.handlers.get(&key) {
            let handler = Arc::clone(handler);
            *memo.hits.entry(key).or_insert(0) += 1;
            return Some(handler);
        }

        for table in &self.tables {
            for (region, handler) in table {
                if region.contains(addr, 1) {
                    memo.handlers.insert(key, Arc::clone(handler));
                    *memo.hits.entry(key).or_insert(0) += 1;
                    return Some(Arc::clone(handler));
                }
            }
        }
        None
    }

    /// Lookup hits recorded for `addr`.
    pub fn hits(&self, addr: GuestAddress) -> u64 {
        self.memo
            .lock()
            .expect("I/O cache poisoned")
            .hits
            .get(&addr.raw_value())
            .copied()
            .unwrap_or(0)
    }

    fn should_promote(&self, addr: GuestAddress) -> bool {
        self.hits(addr) >= PROMOTE_HIT_THRESHOLD
    }

    /// Consider binding an ioeventfd for a deferred write of `value` at
    /// `addr`.
    ///
    /// Returns `Ok(true)` when a binding was installed and its re-arm
    /// waiter started. Below the hit threshold this is a no-op.
    pub fn promote(
        &self,
        vm: &Arc<VmFd>,
        handler: &Arc<IoHandler>,
        addr: GuestAddress,
        size: u8,
        value: u64,
        offset: u64,
    ) -> Result<bool, IoError> {
        if !self.should_promote(addr) {
            return Ok(false);
        }

        let event = EventFd::new(0).map_err(IoError::EventFd)?;
        let io_addr = match self.space {
            IoSpace::Pio => IoEventAddress::Pio(addr.raw_value()),
            IoSpace::Mmio => IoEventAddress::Mmio(addr.raw_value()),
        };
        bind_ioevent(vm, &event, &io_addr, size, value).map_err(IoError::BindEvent)?;
        debug!(
            "promoted write {:#x} (size {}) at {:#x} to ioeventfd",
            value,
            size,
            addr.raw_value(),
        );

        let vm = Arc::clone(vm);
        let handler = Arc::clone(handler);
        let waiter = thread::Builder::new()
            .name(format!("ioevent-{:x}", addr.raw_value()))
            .spawn(move || {
                loop {
                    if event.read().is_err() {
                        break;
                    }
                    // The kernel completed the guest's write; replay the
                    // memoized operation into the device. Keep the binding
                    // while the device keeps deferring.
                    match handler.write(offset, size, value) {
                        Ok(WriteOutcome::Defer) => continue,
                        _ => break,
                    }
                }
                if let Err(e) = unbind_ioevent(&vm, &event, &io_addr, size, value) {
                    warn!("failed to release ioeventfd at {:#x}: {}", io_addr_raw(&io_addr), e);
                }
            });

        match waiter {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("failed to spawn ioeventfd waiter: {}", e);
                Ok(false)
            }
        }
    }
}

fn io_addr_raw(addr: &IoEventAddress) -> u64 {
    match addr {
        IoEventAddress::Pio(a) | IoEventAddress::Mmio(a) => *a,
    }
}

/// Register the binding with a datamatch sized to the access width.
fn bind_ioevent(
    vm: &VmFd,
    event: &EventFd,
    addr: &IoEventAddress,
    size: u8,
    value: u64,
) -> std::result::Result<(), kvm_ioctls::Error> {
    match size {
        1 => vm.register_ioevent(event, addr, value as u8),
        2 => vm.register_ioevent(event, addr, value as u16),
        4 => vm.register_ioevent(event, addr, value as u32),
        _ => vm.register_ioevent(event, addr, value),
    }
}

fn unbind_ioevent(
    vm: &VmFd,
    event: &EventFd,
    addr: &IoEventAddress,
    size: u8,
    value: u64,
) -> std::result::Result<(), kvm_ioctls::Error> {
    match size {
        1 => vm.unregister_ioevent(event, addr, value as u8),
        2 => vm.unregister_ioevent(event, addr, value as u16),
        4 => vm.unregister_ioevent(event, addr, value as u32),
        _ => vm.unregister_ioevent(event, addr, value),
    }
}
