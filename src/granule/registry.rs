//! Sparse granule table, host-side allocator and content accessors.

use super::{AddrClass, Granule, GranuleState, MemoryMap};
use crate::types::{is_aligned, Pa, GRANULE_SIZE};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, trace};

/// Registry-level rejections. Commands map every variant to ERROR_INPUT.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Address {0:#x} is not granule aligned")]
    Unaligned(Pa),

    #[error("Address {0:#x} is outside permitted physical memory")]
    OutsidePermitted(Pa),

    #[error("Address {0:#x} is device memory")]
    DeviceMemory(Pa),

    #[error("Granule {pa:#x} is {actual}, expected {expected}")]
    WrongState {
        pa: Pa,
        expected: GranuleState,
        actual: GranuleState,
    },

    #[error("Transition {from} -> {to} is not a lifecycle edge")]
    IllegalTransition { from: GranuleState, to: GranuleState },

    #[error("Access of {len} bytes at offset {offset} overruns granule {pa:#x}")]
    OutOfBounds { pa: Pa, offset: usize, len: usize },
}

/// Granule table keyed by physical address.
///
/// Only granules that left the pristine state (UNDELEGATED, never written)
/// are stored; everything else is implied by the memory map.
#[derive(Debug)]
pub struct GranuleRegistry {
    map: MemoryMap,
    granules: BTreeMap<Pa, Granule>,
    allocated: BTreeSet<Pa>,
    released: Vec<Pa>,
    next_free: Pa,
}

impl GranuleRegistry {
    pub fn new(map: MemoryMap) -> Self {
        let next_free = map.dram.base;
        Self {
            map,
            granules: BTreeMap::new(),
            allocated: BTreeSet::new(),
            released: Vec::new(),
            next_free,
        }
    }

    pub fn memory_map(&self) -> &MemoryMap {
        &self.map
    }

    pub fn check_addr(&self, pa: Pa) -> AddrClass {
        if !is_aligned(pa, GRANULE_SIZE) {
            AddrClass::Unaligned
        } else if self.map.device.iter().any(|r| r.contains(pa)) {
            AddrClass::DeviceMemory
        } else if pa < self.map.pa_limit() && self.map.dram.contains(pa) {
            AddrClass::Dram
        } else {
            AddrClass::OutsidePermitted
        }
    }

    /// Checks that `pa` names a DRAM granule, whatever its state.
    pub fn check_granule_addr(&self, pa: Pa) -> Result<(), RegistryError> {
        match self.check_addr(pa) {
            AddrClass::Dram => Ok(()),
            AddrClass::Unaligned => Err(RegistryError::Unaligned(pa)),
            AddrClass::DeviceMemory => Err(RegistryError::DeviceMemory(pa)),
            AddrClass::OutsidePermitted => Err(RegistryError::OutsidePermitted(pa)),
        }
    }

    /// Checks that `pa` is a DRAM granule currently in `expected` state.
    pub fn expect_state(&self, pa: Pa, expected: GranuleState) -> Result<(), RegistryError> {
        self.check_granule_addr(pa)?;
        let actual = self.classify(pa);
        if actual != expected {
            return Err(RegistryError::WrongState {
                pa,
                expected,
                actual,
            });
        }
        Ok(())
    }

    pub fn classify(&self, pa: Pa) -> GranuleState {
        self.granules
            .get(&pa)
            .map(|g| g.state)
            .unwrap_or(GranuleState::Undelegated)
    }

    pub fn owner(&self, pa: Pa) -> Option<Pa> {
        self.granules.get(&pa).and_then(|g| g.owner)
    }

    pub fn delegate(&mut self, pa: Pa) -> Result<(), RegistryError> {
        self.expect_state(pa, GranuleState::Undelegated)?;
        let granule = self.granules.entry(pa).or_insert_with(Granule::undelegated);
        granule.state = GranuleState::Delegated;
        trace!(pa = format_args!("{:#x}", pa), "granule delegated");
        Ok(())
    }

    /// Returns a DELEGATED granule to the host, scrubbing its content.
    pub fn undelegate(&mut self, pa: Pa) -> Result<(), RegistryError> {
        self.expect_state(pa, GranuleState::Delegated)?;
        self.granules.remove(&pa);
        trace!(pa = format_args!("{:#x}", pa), "granule undelegated and scrubbed");
        Ok(())
    }

    /// The only mutation path for structural commands.
    pub fn transition(
        &mut self,
        pa: Pa,
        from: GranuleState,
        to: GranuleState,
        owner: Option<Pa>,
    ) -> Result<(), RegistryError> {
        if !from.can_transition_to(to) || to == GranuleState::Undelegated || from == GranuleState::Undelegated {
            return Err(RegistryError::IllegalTransition { from, to });
        }
        self.expect_state(pa, from)?;
        let granule = self.granules.entry(pa).or_insert_with(Granule::undelegated);
        granule.state = to;
        granule.owner = if to.is_typed() { owner } else { None };
        Ok(())
    }

    pub fn write(&mut self, pa: Pa, offset: usize, bytes: &[u8]) -> Result<(), RegistryError> {
        self.check_granule_addr(pa)?;
        Self::check_bounds(pa, offset, bytes.len())?;
        let granule = self.granules.entry(pa).or_insert_with(Granule::undelegated);
        let content = granule
            .content
            .get_or_insert_with(|| vec![0u8; GRANULE_SIZE as usize].into_boxed_slice());
        content[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn fill(&mut self, pa: Pa, byte: u8) -> Result<(), RegistryError> {
        self.write(pa, 0, &[byte; GRANULE_SIZE as usize])
    }

    /// Full 4 KiB content of the granule.
    pub fn read(&self, pa: Pa) -> Result<Vec<u8>, RegistryError> {
        self.check_granule_addr(pa)?;
        Ok(self
            .granules
            .get(&pa)
            .and_then(|g| g.content.as_deref())
            .map(<[u8]>::to_vec)
            .unwrap_or_else(|| vec![0u8; GRANULE_SIZE as usize]))
    }

    pub fn copy(&mut self, src: Pa, dst: Pa) -> Result<(), RegistryError> {
        let bytes = self.read(src)?;
        self.write(dst, 0, &bytes)
    }

    fn check_bounds(pa: Pa, offset: usize, len: usize) -> Result<(), RegistryError> {
        if offset.checked_add(len).map_or(true, |end| end > GRANULE_SIZE as usize) {
            return Err(RegistryError::OutOfBounds { pa, offset, len });
        }
        Ok(())
    }

    /// Hands out one fresh UNDELEGATED granule for host use.
    pub fn alloc(&mut self) -> Option<Pa> {
        while let Some(pa) = self.released.pop() {
            if self.classify(pa) == GranuleState::Undelegated {
                self.allocated.insert(pa);
                self.granules.remove(&pa);
                return Some(pa);
            }
        }
        self.alloc_contiguous(1, GRANULE_SIZE)
    }

    /// Hands out `count` contiguous fresh granules whose first address is aligned to `align`.
    pub fn alloc_contiguous(&mut self, count: usize, align: u64) -> Option<Pa> {
        if count == 0 || !align.is_power_of_two() || align < GRANULE_SIZE {
            return None;
        }
        let base = self.next_free.checked_add(align - 1)? & !(align - 1);
        let end = base.checked_add(count as u64 * GRANULE_SIZE)?;
        if end > self.map.dram.end() {
            return None;
        }
        for pa in (base..end).step_by(GRANULE_SIZE as usize) {
            self.allocated.insert(pa);
        }
        self.next_free = end;
        debug!(
            base = format_args!("{:#x}", base),
            count, "allocated host granules"
        );
        Some(base)
    }

    /// Returns a host allocation. Only UNDELEGATED granules go back to the pool.
    pub fn release(&mut self, pa: Pa) -> bool {
        if !self.allocated.contains(&pa) || self.classify(pa) != GranuleState::Undelegated {
            return false;
        }
        self.allocated.remove(&pa);
        self.released.push(pa);
        true
    }

    pub fn count(&self, state: GranuleState) -> usize {
        self.granules.values().filter(|g| g.state == state).count()
    }

    /// Drops records that carry no information beyond the defaults.
    pub fn compact(&mut self) {
        self.granules.retain(|_, g| !g.is_pristine());
    }
}
