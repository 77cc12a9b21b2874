//! Granule Registry
//!
//! Tracks the delegation state, owner and content of every 4 KiB physical
//! granule the model knows about. Realms and translation tables refer to
//! granules by address only; the registry is their single owner.

mod registry;

pub use registry::{GranuleRegistry, RegistryError};

use crate::types::Pa;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delegation / typed state of a granule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GranuleState {
    Undelegated,
    Delegated,
    Rd,
    Rec,
    RecAux,
    Data,
    Rtt,
}

impl GranuleState {
    /// States reachable from DELEGATED by a structural create command.
    pub fn is_typed(self) -> bool {
        !matches!(self, GranuleState::Undelegated | GranuleState::Delegated)
    }

    /// Whether `self -> to` is an edge of the lifecycle DAG.
    pub fn can_transition_to(self, to: GranuleState) -> bool {
        use GranuleState::*;
        match (self, to) {
            (Undelegated, Delegated) | (Delegated, Undelegated) => true,
            (Delegated, t) => t.is_typed(),
            (s, Delegated) => s.is_typed(),
            _ => false,
        }
    }
}

impl fmt::Display for GranuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GranuleState::Undelegated => "UNDELEGATED",
            GranuleState::Delegated => "DELEGATED",
            GranuleState::Rd => "RD",
            GranuleState::Rec => "REC",
            GranuleState::RecAux => "REC_AUX",
            GranuleState::Data => "DATA",
            GranuleState::Rtt => "RTT",
        };
        f.write_str(name)
    }
}

/// Result of checking a physical address against the platform memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrClass {
    Unaligned,
    OutsidePermitted,
    DeviceMemory,
    Dram,
}

/// A contiguous physical region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemRegion {
    pub base: Pa,
    pub size: u64,
}

impl MemRegion {
    pub fn contains(&self, pa: Pa) -> bool {
        pa >= self.base && pa - self.base < self.size
    }

    pub fn end(&self) -> Pa {
        self.base + self.size
    }
}

/// Platform physical memory map: one permitted DRAM window plus device regions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryMap {
    pub dram: MemRegion,
    pub device: Vec<MemRegion>,
    /// Physical address width; addresses at or above `1 << pa_width` are not permitted.
    pub pa_width: u8,
}

impl MemoryMap {
    /// Lowest address that lies outside the permitted physical range.
    pub fn pa_limit(&self) -> Pa {
        1u64 << self.pa_width
    }

    pub fn first_device_granule(&self) -> Option<Pa> {
        self.device.first().map(|r| r.base)
    }
}

/// Per-granule record. Absent entries in the registry are UNDELEGATED with zero content.
#[derive(Debug, Clone)]
pub struct Granule {
    pub state: GranuleState,
    /// Owning realm (RD address) for typed granules.
    pub owner: Option<Pa>,
    content: Option<Box<[u8]>>,
}

impl Granule {
    fn undelegated() -> Self {
        Self {
            state: GranuleState::Undelegated,
            owner: None,
            content: None,
        }
    }

    fn is_pristine(&self) -> bool {
        self.state == GranuleState::Undelegated && self.content.is_none()
    }
}
