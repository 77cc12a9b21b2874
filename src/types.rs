//! Shared primitive types: addresses, translation geometry and command status codes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical address of a granule.
pub type Pa = u64;

/// Intermediate (realm-visible) physical address.
pub type Ipa = u64;

/// Size of one granule in bytes.
pub const GRANULE_SIZE: u64 = 0x1000;

/// Entries per translation table.
pub const RTT_ENTRIES: usize = 512;

/// Leaf level of the translation tree.
pub const RTT_MAX_LEVEL: u8 = 3;

/// Lowest level at which a block (ASSIGNED entry above the leaf) may exist.
pub const RTT_MIN_BLOCK_LEVEL: u8 = 1;

const RTT_STRIDE: u32 = 9;

/// Bytes covered by one entry at `level`.
pub fn level_size(level: u8) -> u64 {
    debug_assert!(level <= RTT_MAX_LEVEL);
    GRANULE_SIZE << (RTT_STRIDE * u32::from(RTT_MAX_LEVEL - level))
}

/// Index of the entry covering `ipa` inside a table at `level`.
pub fn entry_index(ipa: Ipa, level: u8) -> usize {
    ((ipa / level_size(level)) % RTT_ENTRIES as u64) as usize
}

pub fn align_down(addr: u64, size: u64) -> u64 {
    addr & !(size - 1)
}

pub fn is_aligned(addr: u64, size: u64) -> bool {
    addr & (size - 1) == 0
}

/// Host command status (RMI return status).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum RmiStatus {
    Success = 0,
    ErrorInput = 1,
    ErrorRealm = 2,
    ErrorRec = 3,
    ErrorRtt = 4,
    ErrorNotSupported = 5,
    ErrorDevice = 6,
    ErrorRttAux = 7,
}

impl RmiStatus {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Success,
            1 => Self::ErrorInput,
            2 => Self::ErrorRealm,
            3 => Self::ErrorRec,
            4 => Self::ErrorRtt,
            5 => Self::ErrorNotSupported,
            6 => Self::ErrorDevice,
            7 => Self::ErrorRttAux,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::ErrorInput => "ERROR_INPUT",
            Self::ErrorRealm => "ERROR_REALM",
            Self::ErrorRec => "ERROR_REC",
            Self::ErrorRtt => "ERROR_RTT",
            Self::ErrorNotSupported => "ERROR_NOT_SUPPORTED",
            Self::ErrorDevice => "ERROR_DEVICE",
            Self::ErrorRttAux => "ERROR_RTT_AUX",
        }
    }
}

/// Packed (status, index) pair returned by every host command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReturnCode {
    pub status: RmiStatus,
    pub index: u8,
}

impl ReturnCode {
    pub const SUCCESS: ReturnCode = ReturnCode::new(RmiStatus::Success, 0);

    pub const fn new(status: RmiStatus, index: u8) -> Self {
        Self { status, index }
    }

    pub const fn input() -> Self {
        Self::new(RmiStatus::ErrorInput, 0)
    }

    pub const fn realm() -> Self {
        Self::new(RmiStatus::ErrorRealm, 0)
    }

    pub const fn rec() -> Self {
        Self::new(RmiStatus::ErrorRec, 0)
    }

    pub const fn rtt(level: u8) -> Self {
        Self::new(RmiStatus::ErrorRtt, level)
    }

    pub const fn rtt_aux(index: u8) -> Self {
        Self::new(RmiStatus::ErrorRttAux, index)
    }

    pub fn is_success(self) -> bool {
        self.status == RmiStatus::Success
    }

    /// Wire encoding: `status | index << 8`.
    pub fn packed(self) -> u64 {
        self.status as u64 | (u64::from(self.index) << 8)
    }

    pub fn unpack(raw: u64) -> Option<Self> {
        let status = RmiStatus::from_raw((raw & 0xff) as u8)?;
        if raw >> 16 != 0 {
            return None;
        }
        Some(Self::new(status, ((raw >> 8) & 0xff) as u8))
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.index == 0 {
            write!(f, "{} [{:#x}]", self.status.name(), self.packed())
        } else {
            write!(f, "{}({}) [{:#x}]", self.status.name(), self.index, self.packed())
        }
    }
}

/// Realm-side service call status (RSI return status).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RsiStatus {
    Success,
    ErrorInput,
    ErrorState,
    Incomplete,
}

/// Status a host reports back for a PSCI request it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PsciStatus {
    Success,
    NotSupported,
    InvalidParameters,
    Denied,
    AlreadyOn,
}

impl PsciStatus {
    pub fn raw(self) -> i64 {
        match self {
            Self::Success => 0,
            Self::NotSupported => -1,
            Self::InvalidParameters => -2,
            Self::Denied => -3,
            Self::AlreadyOn => -4,
        }
    }
}
