//! Realm Descriptor
//!
//! Creation parameters, their validation against platform features, and the
//! per-realm record the monitor keeps in its arena (keyed by RD address).

pub mod measurement;
pub mod rec;

pub use measurement::Measurement;
pub use rec::{
    mpidr_from_index, AccessKind, ExitReason, GuestStep, PsciRequest, Rec, RecEnter, RecExit,
    RecParams, RipasRequest, RsiEvent, S2apRequest,
};

use crate::rtt::RttSpace;
use crate::types::{level_size, Ipa, Pa, RTT_ENTRIES, RTT_MAX_LEVEL};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Smallest realm address space the model accepts.
pub const MIN_IPA_WIDTH: u8 = 32;

/// Upper bound on concatenated starting-level tables.
pub const MAX_START_RTTS: usize = 16;

/// Realm personalization value length.
pub const RPV_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgo {
    Sha256,
    Sha512,
}

impl HashAlgo {
    pub fn digest_len(self) -> usize {
        match self {
            HashAlgo::Sha256 => 32,
            HashAlgo::Sha512 => 64,
        }
    }

    pub fn id(self) -> u8 {
        match self {
            HashAlgo::Sha256 => 0,
            HashAlgo::Sha512 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RealmState {
    New,
    Active,
    SystemOff,
}

/// Platform capabilities realm parameters are validated against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformFeatures {
    pub max_ipa_width: u8,
    pub max_aux_planes: u8,
    pub planes: bool,
    pub rtt_tree_per_plane: bool,
    pub rtt_tree_single: bool,
    pub rec_aux_count: usize,
    pub hash_algos: Vec<HashAlgo>,
}

impl Default for PlatformFeatures {
    fn default() -> Self {
        Self {
            max_ipa_width: 48,
            max_aux_planes: 3,
            planes: true,
            rtt_tree_per_plane: true,
            rtt_tree_single: true,
            rec_aux_count: 2,
            hash_algos: vec![HashAlgo::Sha256, HashAlgo::Sha512],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealmParams {
    pub s2sz: u8,
    pub start_level: u8,
    pub num_start_rtts: usize,
    pub hash_algo: HashAlgo,
    pub rtt_tree_per_plane: bool,
    pub num_aux_planes: u8,
    pub vmid: u16,
    pub rpv: [u8; RPV_SIZE],
}

impl Default for RealmParams {
    fn default() -> Self {
        Self {
            s2sz: 40,
            start_level: 0,
            num_start_rtts: 1,
            hash_algo: HashAlgo::Sha256,
            rtt_tree_per_plane: false,
            num_aux_planes: 0,
            vmid: 1,
            rpv: [0u8; RPV_SIZE],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamsError {
    #[error("IPA width {s2sz} outside [{MIN_IPA_WIDTH}, {max}]")]
    IpaWidth { s2sz: u8, max: u8 },

    #[error("Start level {0} is not a valid translation level")]
    StartLevel(u8),

    #[error("IPA width {s2sz} cannot start at level {start_level}")]
    Geometry { s2sz: u8, start_level: u8 },

    #[error("Expected {required} starting RTT(s), got {given}")]
    StartRtts { required: usize, given: usize },

    #[error("{requested} auxiliary planes requested, platform supports {max}")]
    AuxPlanes { requested: u8, max: u8 },

    #[error("Per-plane RTT trees unavailable for this configuration")]
    TreePerPlane,

    #[error("Hash algorithm {0:?} not supported")]
    HashAlgo(HashAlgo),

    #[error("VMID {0} already in use")]
    VmidInUse(u16),
}

/// Number of concatenated starting-level tables needed for `2^s2sz` bytes of
/// address space, or `None` when the geometry is impossible.
pub fn required_start_rtts(s2sz: u8, start_level: u8) -> Option<usize> {
    if start_level > RTT_MAX_LEVEL || s2sz >= 64 {
        return None;
    }
    let space = 1u128 << s2sz;
    let entry = u128::from(level_size(start_level));
    if space <= entry {
        return None;
    }
    let table_span = entry * RTT_ENTRIES as u128;
    let count = (space / table_span).max(1);
    if count > MAX_START_RTTS as u128 {
        return None;
    }
    Some(count as usize)
}

impl RealmParams {
    pub fn validate(&self, features: &PlatformFeatures) -> Result<(), ParamsError> {
        if self.s2sz < MIN_IPA_WIDTH || self.s2sz > features.max_ipa_width {
            return Err(ParamsError::IpaWidth {
                s2sz: self.s2sz,
                max: features.max_ipa_width,
            });
        }
        if self.start_level > RTT_MAX_LEVEL {
            return Err(ParamsError::StartLevel(self.start_level));
        }
        let required = required_start_rtts(self.s2sz, self.start_level).ok_or(
            ParamsError::Geometry {
                s2sz: self.s2sz,
                start_level: self.start_level,
            },
        )?;
        if required != self.num_start_rtts {
            return Err(ParamsError::StartRtts {
                required,
                given: self.num_start_rtts,
            });
        }
        if (self.num_aux_planes > 0 && !features.planes)
            || self.num_aux_planes > features.max_aux_planes
        {
            return Err(ParamsError::AuxPlanes {
                requested: self.num_aux_planes,
                max: if features.planes { features.max_aux_planes } else { 0 },
            });
        }
        if self.rtt_tree_per_plane && (self.num_aux_planes == 0 || !features.rtt_tree_per_plane) {
            return Err(ParamsError::TreePerPlane);
        }
        if self.num_aux_planes > 0 && !self.rtt_tree_per_plane && !features.rtt_tree_single {
            return Err(ParamsError::TreePerPlane);
        }
        if !features.hash_algos.contains(&self.hash_algo) {
            return Err(ParamsError::HashAlgo(self.hash_algo));
        }
        Ok(())
    }

    /// First address of the unprotected half.
    pub fn unprotected_base(&self) -> Ipa {
        1u64 << (self.s2sz - 1)
    }

    /// One past the last valid IPA.
    pub fn ipa_limit(&self) -> Ipa {
        1u64 << self.s2sz
    }

    pub fn is_protected(&self, ipa: Ipa) -> bool {
        ipa < self.unprotected_base()
    }

    /// Number of translation trees: the primary plus one per auxiliary plane
    /// when per-plane trees are enabled.
    pub fn tree_count(&self) -> usize {
        if self.rtt_tree_per_plane {
            1 + usize::from(self.num_aux_planes)
        } else {
            1
        }
    }
}

/// Arena record for one realm.
#[derive(Debug)]
pub struct Realm {
    pub rd: Pa,
    pub params: RealmParams,
    pub state: RealmState,
    /// REC index -> REC granule.
    pub recs: BTreeMap<u64, Pa>,
    pub next_rec_index: u64,
    pub rtt: RttSpace,
    pub measurement: Measurement,
}

impl Realm {
    pub fn new(rd: Pa, params: RealmParams, roots: Vec<Vec<Pa>>) -> Self {
        let rtt = RttSpace::new(params.s2sz, params.start_level, roots);
        let measurement = Measurement::for_realm(&params);
        Self {
            rd,
            params,
            state: RealmState::New,
            recs: BTreeMap::new(),
            next_rec_index: 0,
            rtt,
            measurement,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_start_rtts() {
        assert_eq!(required_start_rtts(40, 0), Some(1));
        assert_eq!(required_start_rtts(40, 1), Some(2));
        assert_eq!(required_start_rtts(48, 0), Some(1));
        assert_eq!(required_start_rtts(40, 2), None);
        assert_eq!(required_start_rtts(32, 1), Some(1));
        assert_eq!(required_start_rtts(39, 0), None);
    }

    #[test]
    fn test_validate_params() {
        let features = PlatformFeatures::default();
        let mut params = RealmParams::default();
        assert!(params.validate(&features).is_ok());

        params.num_start_rtts = 2;
        assert_eq!(
            params.validate(&features),
            Err(ParamsError::StartRtts {
                required: 1,
                given: 2
            })
        );

        params.num_start_rtts = 1;
        params.s2sz = 31;
        assert!(matches!(
            params.validate(&features),
            Err(ParamsError::IpaWidth { .. })
        ));

        params.s2sz = 40;
        params.rtt_tree_per_plane = true;
        assert_eq!(params.validate(&features), Err(ParamsError::TreePerPlane));
        params.num_aux_planes = 1;
        assert!(params.validate(&features).is_ok());
        assert_eq!(params.tree_count(), 2);
    }

    #[test]
    fn test_address_halves() {
        let params = RealmParams::default();
        assert!(params.is_protected(0x1000));
        assert!(!params.is_protected(1 << 39));
        assert_eq!(params.ipa_limit(), 1 << 40);
    }
}
