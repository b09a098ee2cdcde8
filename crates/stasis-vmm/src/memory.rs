//! Guest-physical memory region map.
//!
//! The [`MemoryMap`] is the authoritative description of the guest address
//! space: an ordered, non-overlapping sequence of [`TypedMemoryRegion`]s,
//! each owned by a device and optionally backed by host memory. It is built
//! during machine construction and device attach, and is read-only once
//! vCPUs start.
//!
//! Three operations cover every consumer:
//!
//! - [`reserve`](MemoryMap::reserve) — insert a new region and issue the
//!   kind-specific kernel mapping call through a [`RegionMapper`].
//! - [`allocate`](MemoryMap::allocate) — probe an address window for a free
//!   sub-range inside an existing region (used by the boot loader to place
//!   the kernel image, initrd, page tables and boot parameters).
//! - [`map`](MemoryMap::map) — resolve an address to its backing view,
//!   optionally claiming the sub-range in the region's allocation ledger.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use log::debug;
use thiserror::Error;
use vm_memory::{Address, Bytes, GuestAddress, MmapRegion, VolatileMemory, VolatileSlice};

use crate::devices::Device;

/// Guest page size. Region starts, region sizes and backing buffers must
/// all be multiples of this.
pub const PAGE_SIZE: u64 = 4096;

/// Ownership/purpose category of a guest-physical region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Address space claimed but not backed (PCI holes, legacy ranges).
    Reserved,
    /// RAM backed by host memory and registered with the kernel.
    User,
    /// ACPI tables: backed, but reported to the guest as reclaimable.
    Acpi,
    /// Kernel-internal structures (identity map, TSS pages).
    Special,
}

/// Errors from region map operations.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Region start, size, or backing buffer not page-aligned.
    #[error("memory not aligned")]
    Unaligned,

    /// The probe range collides with an existing region or sub-allocation.
    #[error("memory regions conflict")]
    Conflict,

    /// No region of the requested kind covers the requested range.
    #[error("memory region not found")]
    NotFound,

    /// A backed kind was reserved without a backing buffer.
    #[error("user-backed region requires a backing buffer")]
    MissingBacking,

    /// The backing buffer is smaller than the region.
    #[error("backing buffer smaller than region size")]
    BackingTooSmall,

    /// Anonymous backing allocation failed.
    #[error("failed to allocate backing memory of {size} bytes")]
    BackingAlloc {
        /// Requested allocation size.
        size: u64,
    },

    /// The backing view could not be produced.
    #[error("backing view at offset {offset:#x} unavailable")]
    BackingView {
        /// Offset within the region.
        offset: u64,
    },

    /// The kernel rejected the mapping call.
    #[error("kernel mapping call failed: {0}")]
    Mapping(#[source] kvm_ioctls::Error),
}

/// Issues the kind-specific kernel mapping calls on behalf of
/// [`MemoryMap::reserve`].
///
/// The production implementation registers KVM memory slots; tests use a
/// recording stub.
pub trait RegionMapper {
    /// Register a user-backed slot for `[start, start+size)`.
    fn map_user(
        &mut self,
        start: GuestAddress,
        size: u64,
        backing: &MmapRegion,
    ) -> Result<(), MemoryError>;

    /// Record a pure reservation. No kernel state is involved.
    fn map_reserved(&mut self, start: GuestAddress, size: u64) -> Result<(), MemoryError>;

    /// Set up identity-map/TSS pages at `start`.
    fn map_special(&mut self, start: GuestAddress) -> Result<(), MemoryError>;
}

/// Allocate an anonymous, page-aligned host buffer suitable as region
/// backing.
pub fn anon_backing(size: u64) -> Result<Arc<MmapRegion>, MemoryError> {
    let region = MmapRegion::new(size as usize).map_err(|_| MemoryError::BackingAlloc { size })?;
    Ok(Arc::new(region))
}

/// A bare guest-physical range. Half-open: covers `[start, start+size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// First address of the range.
    pub start: GuestAddress,
    /// Length in bytes.
    pub size: u64,
}

impl MemoryRegion {
    pub const fn new(start: GuestAddress, size: u64) -> Self {
        Self { start, size }
    }

    /// One past the last address of the range.
    pub fn end(&self) -> GuestAddress {
        GuestAddress(self.start.raw_value() + self.size)
    }

    /// Boundary-crossing test against the probe `[start, start+size)`.
    ///
    /// True when one of this region's endpoints falls inside the probe.
    /// A probe lying strictly inside the region reports no overlap; any
    /// probe that contains or straddles a region boundary does.
    pub fn overlaps(&self, start: GuestAddress, size: u64) -> bool {
        let probe_start = start.raw_value();
        let probe_end = probe_start + size;
        let region_start = self.start.raw_value();
        let region_end = region_start + self.size;

        (region_start >= probe_start && region_start < probe_end)
            || (region_end > probe_start && region_end <= probe_end)
    }

    /// Whether `[start, start+size)` lies entirely within this region.
    pub fn contains(&self, start: GuestAddress, size: u64) -> bool {
        self.start <= start && self.end().raw_value() >= start.raw_value() + size
    }
}

/// A region tagged with its kind, owner and backing.
pub struct TypedMemoryRegion {
    /// The covered range.
    pub region: MemoryRegion,
    /// Purpose category.
    pub kind: MemoryKind,
    /// Owning device, for lookup only. The map never controls device
    /// lifetime.
    owner: Weak<dyn Device>,
    /// Host backing, present for `User` and `Acpi` regions.
    backing: Option<Arc<MmapRegion>>,
    /// Claimed sub-ranges: offset → length. Entries never overlap.
    allocated: BTreeMap<u64, u64>,
}

impl TypedMemoryRegion {
    /// The owning device, if it is still attached.
    pub fn owner(&self) -> Option<Arc<dyn Device>> {
        self.owner.upgrade()
    }

    /// Claimed sub-ranges within this region.
    pub fn allocations(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.allocated.iter().map(|(&off, &len)| (off, len))
    }
}

impl std::fmt::Debug for TypedMemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedMemoryRegion")
            .field("region", &self.region)
            .field("kind", &self.kind)
            .field("backed", &self.backing.is_some())
            .field("allocated", &self.allocated)
            .finish()
    }
}

/// The ordered collection of all guest-physical regions.
///
/// Strictly sorted by start address; no two regions overlap. Mutated only
/// by [`reserve`](Self::reserve) and the sub-allocation ledger; never
/// shrinks during a session.
#[derive(Debug, Default)]
pub struct MemoryMap {
    regions: Vec<TypedMemoryRegion>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// All regions, sorted by start address.
    pub fn regions(&self) -> &[TypedMemoryRegion] {
        &self.regions
    }

    /// Highest mapped guest-physical address, or zero for an empty map.
    pub fn max(&self) -> GuestAddress {
        self.regions
            .last()
            .map(|r| r.region.end())
            .unwrap_or(GuestAddress(0))
    }

    /// Whether the probe range collides with any existing region.
    pub fn conflicts(&self, start: GuestAddress, size: u64) -> bool {
        self.regions.iter().any(|r| r.region.overlaps(start, size))
    }

    /// Insert a new region and issue its kernel mapping call.
    ///
    /// Rejects misaligned starts, sizes and backing buffers with
    /// [`MemoryError::Unaligned`], and collisions with
    /// [`MemoryError::Conflict`]. All-or-nothing: on any failure the map is
    /// left unchanged.
    pub fn reserve(
        &mut self,
        mapper: &mut dyn RegionMapper,
        device: &Arc<dyn Device>,
        kind: MemoryKind,
        start: GuestAddress,
        size: u64,
        backing: Option<Arc<MmapRegion>>,
    ) -> Result<(), MemoryError> {
        device.debug(format_args!(
            "reserving {:?} region of size {:#x} at [{:#x},{:#x}]",
            kind,
            size,
            start.raw_value(),
            start.raw_value() + size.saturating_sub(1),
        ));

        if start.raw_value() % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return Err(MemoryError::Unaligned);
        }
        if let Some(backing) = &backing {
            if (backing.as_ptr() as usize) % PAGE_SIZE as usize != 0 {
                return Err(MemoryError::Unaligned);
            }
            if (backing.size() as u64) < size {
                return Err(MemoryError::BackingTooSmall);
            }
        }
        if self.conflicts(start, size) {
            return Err(MemoryError::Conflict);
        }

        match (kind, &backing) {
            (MemoryKind::User | MemoryKind::Acpi, None) => return Err(MemoryError::MissingBacking),
            (MemoryKind::User | MemoryKind::Acpi, Some(b)) => mapper.map_user(start, size, b)?,
            (MemoryKind::Reserved, _) => mapper.map_reserved(start, size)?,
            (MemoryKind::Special, _) => mapper.map_special(start)?,
        }

        let region = TypedMemoryRegion {
            region: MemoryRegion::new(start, size),
            kind,
            owner: Arc::downgrade(device),
            backing,
            allocated: BTreeMap::new(),
        };
        let at = self
            .regions
            .partition_point(|r| r.region.start < region.region.start);
        self.regions.insert(at, region);
        Ok(())
    }

    /// Resolve `addr` to its backing view within a region of `kind`.
    ///
    /// With `allocate`, the sub-range is first claimed in the region's
    /// ledger; a second claim of an overlapping sub-range fails with
    /// [`MemoryError::Conflict`]. Without it, prior allocation state is
    /// ignored. Returns `None` for regions without backing.
    pub fn map(
        &mut self,
        kind: MemoryKind,
        addr: GuestAddress,
        size: u64,
        allocate: bool,
    ) -> Result<Option<VolatileSlice<'_>>, MemoryError> {
        if allocate {
            self.claim(kind, addr, size)?;
        }
        self.view(kind, addr, size)
    }

    /// Probe `[lo, hi]` page by page for a free sub-range of `size` bytes
    /// inside an existing region of `kind`, claiming and returning the
    /// first fit. `from_top` walks downward from `hi` instead of upward
    /// from `lo`.
    pub fn allocate(
        &mut self,
        kind: MemoryKind,
        lo: GuestAddress,
        hi: GuestAddress,
        size: u64,
        from_top: bool,
    ) -> Result<(GuestAddress, Option<VolatileSlice<'_>>), MemoryError> {
        let mut found = None;
        let mut addr = if from_top { hi.raw_value() } else { lo.raw_value() };
        loop {
            if self.claim(kind, GuestAddress(addr), size).is_ok() {
                found = Some(GuestAddress(addr));
                break;
            }
            if from_top {
                if addr < lo.raw_value() + PAGE_SIZE {
                    break;
                }
                addr -= PAGE_SIZE;
            } else {
                if addr + PAGE_SIZE > hi.raw_value() {
                    break;
                }
                addr += PAGE_SIZE;
            }
        }

        let addr = found.ok_or(MemoryError::NotFound)?;
        debug!(
            "allocated {:#x} bytes of {:?} memory at {:#x}",
            size,
            kind,
            addr.raw_value(),
        );
        let slice = self.view(kind, addr, size)?;
        Ok((addr, slice))
    }

    /// Allocate a user sub-range large enough for `data` within `[lo, hi]`
    /// and copy `data` into it. Returns the chosen address.
    ///
    /// This is the boot loader's entry point for placing the kernel image,
    /// initrd and boot parameter pages.
    pub fn load(
        &mut self,
        lo: GuestAddress,
        hi: GuestAddress,
        data: &[u8],
        from_top: bool,
    ) -> Result<GuestAddress, MemoryError> {
        let (addr, slice) = self.allocate(MemoryKind::User, lo, hi, data.len() as u64, from_top)?;
        let slice = slice.ok_or(MemoryError::MissingBacking)?;
        slice
            .write_slice(data, 0)
            .map_err(|_| MemoryError::BackingView { offset: 0 })?;
        Ok(addr)
    }

    /// Claim `[addr, addr+size)` in the ledger of the containing region.
    fn claim(&mut self, kind: MemoryKind, addr: GuestAddress, size: u64) -> Result<(), MemoryError> {
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.kind == kind && r.region.contains(addr, size))
            .ok_or(MemoryError::NotFound)?;

        let offset = addr.raw_value() - region.region.start.raw_value();
        for (&claimed_off, &claimed_len) in &region.allocated {
            if offset < claimed_off + claimed_len && claimed_off < offset + size {
                return Err(MemoryError::Conflict);
            }
        }
        region.allocated.insert(offset, size);
        Ok(())
    }

    /// Backing view of `[addr, addr+size)` within its containing region.
    fn view(
        &self,
        kind: MemoryKind,
        addr: GuestAddress,
        size: u64,
    ) -> Result<Option<VolatileSlice<'_>>, MemoryError> {
        let region = self
            .regions
            .iter()
            .find(|r| r.kind == kind && r.region.contains(addr, size))
            .ok_or(MemoryError::NotFound)?;

        let offset = addr.raw_value() - region.region.start.raw_value();
        match &region.backing {
            Some(backing) => {
                let slice = backing
                    .get_slice(offset as usize, size as usize)
                    .map_err(|_| MemoryError::BackingView { offset })?;
                Ok(Some(slice))
            }
            None => Ok(None),
        }
    }
}
