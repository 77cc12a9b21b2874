//! Command surfaces and the in-memory reference monitor.
//!
//! `Rmi` is the host command surface, `Rsi` the realm-side one, and
//! `HostMemory` the normal-world view of physical memory (allocation and raw
//! content access). `ModelMonitor` implements all three over the granule
//! registry and the per-realm translation trees.

mod guest;
mod realm_ops;
mod rmi;
mod rsi;
mod rtt_ops;
mod shared;

pub use shared::SharedMonitor;

use crate::attestation::{TokenProgress, CHALLENGE_SIZE};
use crate::granule::{GranuleRegistry, GranuleState, MemRegion, MemoryMap, RegistryError};
use crate::realm::{
    HashAlgo, PlatformFeatures, Realm, RealmParams, Rec, RecEnter, RecExit, RecParams, RsiEvent,
};
use crate::rtt::{Ripas, RttEntryView, RttError, RttSpace, TopPolicy};
use crate::types::{Ipa, Pa, PsciStatus, ReturnCode, RsiStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Failed host command: packed status plus the `top` output when the command reports one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{code}")]
pub struct RmiError {
    pub code: ReturnCode,
    pub top: Option<Ipa>,
}

impl From<ReturnCode> for RmiError {
    fn from(code: ReturnCode) -> Self {
        Self { code, top: None }
    }
}

impl From<RttError> for RmiError {
    fn from(err: RttError) -> Self {
        Self {
            code: err.code(),
            top: None,
        }
    }
}

impl From<RegistryError> for RmiError {
    fn from(_: RegistryError) -> Self {
        ReturnCode::input().into()
    }
}

pub type RmiResult<T> = Result<T, RmiError>;

/// Packed status of a command result, SUCCESS for `Ok`.
pub fn outcome<T>(result: &RmiResult<T>) -> ReturnCode {
    match result {
        Ok(_) => ReturnCode::SUCCESS,
        Err(err) => err.code,
    }
}

/// Realm creation arguments: parameters plus the starting tables of every tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealmCreate {
    pub params: RealmParams,
    pub rtt_base: Pa,
    pub aux_rtt_base: Vec<Pa>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttDestroyed {
    pub rtt: Pa,
    pub top: Ipa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDestroyed {
    pub data: Pa,
    pub top: Ipa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealmConfig {
    pub ipa_width: u8,
    pub hash_algo: HashAlgo,
}

/// Descriptor layout for unprotected mappings: output address in bits
/// [47:12], attributes in bits [11:2].
pub const DESC_ADDR_MASK: u64 = 0x0000_ffff_ffff_f000;
pub const DESC_ATTR_MASK: u64 = 0x0000_0000_0000_0ffc;

pub fn unprotected_desc(addr: Pa, attr: u64) -> u64 {
    (addr & DESC_ADDR_MASK) | (attr & DESC_ATTR_MASK)
}

/// Argument checks of RIPAS/S2AP range commands whose precedence is configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeCheck {
    /// The REC belongs to another realm.
    RecOwner,
    /// The REC has no outstanding request of this kind.
    PendingRequest,
    /// `top <= base`.
    InvalidSize,
    /// `base` differs from the request's next address.
    BaseMismatch,
    /// `top` lies beyond the requested range.
    TopOutOfBound,
    /// `top` is not granule aligned.
    TopUnaligned,
}

impl RangeCheck {
    pub fn code(self) -> ReturnCode {
        match self {
            RangeCheck::RecOwner | RangeCheck::PendingRequest => ReturnCode::rec(),
            _ => ReturnCode::input(),
        }
    }

    pub fn default_precedence() -> Vec<RangeCheck> {
        vec![
            RangeCheck::RecOwner,
            RangeCheck::PendingRequest,
            RangeCheck::InvalidSize,
            RangeCheck::BaseMismatch,
            RangeCheck::TopOutOfBound,
            RangeCheck::TopUnaligned,
        ]
    }
}

/// First violated check in `precedence` order.
pub fn first_violation(
    precedence: &[RangeCheck],
    violated: impl Fn(RangeCheck) -> bool,
) -> Option<RangeCheck> {
    precedence.iter().copied().find(|check| violated(*check))
}

/// Host command surface.
pub trait Rmi {
    fn granule_delegate(&mut self, pa: Pa) -> RmiResult<()>;
    fn granule_undelegate(&mut self, pa: Pa) -> RmiResult<()>;

    fn realm_create(&mut self, rd: Pa, create: &RealmCreate) -> RmiResult<()>;
    fn realm_activate(&mut self, rd: Pa) -> RmiResult<()>;
    fn realm_destroy(&mut self, rd: Pa) -> RmiResult<()>;

    fn rec_aux_count(&self, rd: Pa) -> RmiResult<usize>;
    fn rec_create(&mut self, rd: Pa, rec: Pa, params: &RecParams) -> RmiResult<()>;
    fn rec_destroy(&mut self, rec: Pa) -> RmiResult<()>;
    fn rec_enter(&mut self, rec: Pa, enter: &RecEnter) -> RmiResult<RecExit>;
    fn psci_complete(&mut self, calling: Pa, target: Pa, status: PsciStatus) -> RmiResult<()>;

    fn rtt_create(&mut self, rd: Pa, rtt: Pa, ipa: Ipa, level: u8) -> RmiResult<()>;
    fn rtt_destroy(&mut self, rd: Pa, ipa: Ipa, level: u8) -> RmiResult<RttDestroyed>;
    fn rtt_fold(&mut self, rd: Pa, ipa: Ipa, level: u8) -> RmiResult<Pa>;
    fn rtt_read_entry(&self, rd: Pa, ipa: Ipa, level: u8) -> RmiResult<RttEntryView>;

    fn rtt_aux_create(&mut self, rd: Pa, rtt: Pa, ipa: Ipa, level: u8, index: usize) -> RmiResult<()>;
    fn rtt_aux_destroy(&mut self, rd: Pa, ipa: Ipa, level: u8, index: usize) -> RmiResult<RttDestroyed>;
    fn rtt_aux_map_protected(&mut self, rd: Pa, ipa: Ipa, index: usize) -> RmiResult<()>;
    fn rtt_aux_unmap_protected(&mut self, rd: Pa, ipa: Ipa, index: usize) -> RmiResult<()>;

    fn data_create(&mut self, rd: Pa, data: Pa, ipa: Ipa, src: Pa, measure: bool) -> RmiResult<()>;
    fn data_create_unknown(&mut self, rd: Pa, data: Pa, ipa: Ipa) -> RmiResult<()>;
    fn data_destroy(&mut self, rd: Pa, ipa: Ipa) -> RmiResult<DataDestroyed>;

    fn rtt_map_unprotected(&mut self, rd: Pa, ipa: Ipa, level: u8, desc: u64) -> RmiResult<()>;
    fn rtt_unmap_unprotected(&mut self, rd: Pa, ipa: Ipa, level: u8) -> RmiResult<Ipa>;

    fn rtt_init_ripas(&mut self, rd: Pa, base: Ipa, top: Ipa) -> RmiResult<Ipa>;
    fn rtt_set_ripas(&mut self, rd: Pa, rec: Pa, base: Ipa, top: Ipa) -> RmiResult<Ipa>;
    fn rtt_set_s2ap(&mut self, rd: Pa, rec: Pa, base: Ipa, top: Ipa) -> RmiResult<Ipa>;

    fn features(&self) -> PlatformFeatures;
}

/// Realm-side service surface, issued on behalf of a REC.
pub trait Rsi {
    fn rsi_realm_config(&self, rec: Pa) -> Result<RealmConfig, RsiStatus>;
    /// Queues a RIPAS change; it is reported to the host on the next entry.
    fn rsi_ipa_state_set(
        &mut self,
        rec: Pa,
        base: Ipa,
        top: Ipa,
        ripas: Ripas,
        change_destroyed: bool,
    ) -> Result<(), RsiStatus>;
    /// RIPAS of `base` and the end of the run of addresses sharing it.
    fn rsi_ipa_state_get(&self, rec: Pa, base: Ipa, top: Ipa) -> Result<(Ipa, Ripas), RsiStatus>;
    fn rsi_attestation_token_init(&mut self, rec: Pa, challenge: &[u8; CHALLENGE_SIZE]) -> Result<usize, RsiStatus>;
    fn rsi_attestation_token_continue(
        &mut self,
        rec: Pa,
        buf: &mut [u8],
        offset: usize,
        size: usize,
    ) -> Result<TokenProgress, RsiStatus>;
    /// Realm-side observations recorded so far.
    fn rsi_events(&self, rec: Pa) -> Result<Vec<RsiEvent>, RsiStatus>;
}

/// Normal-world view of physical memory.
pub trait HostMemory {
    fn alloc_granule(&mut self) -> Option<Pa>;
    fn alloc_granules(&mut self, count: usize, align: u64) -> Option<Pa>;
    fn release_granule(&mut self, pa: Pa) -> bool;
    fn write_granule(&mut self, pa: Pa, offset: usize, bytes: &[u8]) -> Result<(), RegistryError>;
    fn read_granule(&self, pa: Pa) -> Result<Vec<u8>, RegistryError>;
    fn granule_state(&self, pa: Pa) -> GranuleState;
    fn memory_map(&self) -> MemoryMap;
}

/// Everything fixtures and verifiers need from a platform.
pub trait Platform: Rmi + Rsi + HostMemory {}

impl<T: Rmi + Rsi + HostMemory> Platform for T {}

/// Monitor tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub memory: MemoryMap,
    pub features: PlatformFeatures,
    pub top_policy: TopPolicy,
    pub range_precedence: Vec<RangeCheck>,
    /// Upper bound on bytes copied by one token continue call.
    pub token_chunk_size: usize,
    pub platform_claims_len: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            memory: MemoryMap {
                dram: MemRegion {
                    base: 0x8000_0000,
                    size: 0x4000_0000,
                },
                device: vec![MemRegion {
                    base: 0x1c09_0000,
                    size: 0x1_0000,
                }],
                pa_width: 40,
            },
            features: PlatformFeatures::default(),
            top_policy: TopPolicy::EntryEnd,
            range_precedence: RangeCheck::default_precedence(),
            token_chunk_size: 1024,
            platform_claims_len: 6000,
        }
    }
}

/// In-memory reference monitor.
#[derive(Debug)]
pub struct ModelMonitor {
    config: MonitorConfig,
    registry: GranuleRegistry,
    realms: BTreeMap<Pa, Realm>,
    recs: BTreeMap<Pa, Rec>,
}

impl Default for ModelMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl ModelMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let registry = GranuleRegistry::new(config.memory.clone());
        Self {
            config,
            registry,
            realms: BTreeMap::new(),
            recs: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn registry(&self) -> &GranuleRegistry {
        &self.registry
    }

    pub fn realm_count(&self) -> usize {
        self.realms.len()
    }

    /// Read-only view of a realm's translation trees.
    pub fn rtt_space(&self, rd: Pa) -> Option<&RttSpace> {
        self.realms.get(&rd).map(|r| &r.rtt)
    }

    pub fn realm_measurement(&self, rd: Pa) -> Option<&[u8]> {
        self.realms.get(&rd).map(|r| r.measurement.value())
    }

    fn expect_granule(&self, pa: Pa, state: GranuleState) -> Result<(), RmiError> {
        self.registry.expect_state(pa, state)?;
        Ok(())
    }

    fn realm(&self, rd: Pa) -> Result<&Realm, RmiError> {
        self.expect_granule(rd, GranuleState::Rd)?;
        self.realms.get(&rd).ok_or_else(|| ReturnCode::input().into())
    }

    fn rec(&self, pa: Pa) -> Result<&Rec, RmiError> {
        self.expect_granule(pa, GranuleState::Rec)?;
        self.recs.get(&pa).ok_or_else(|| ReturnCode::input().into())
    }

    /// Attaches the `top` output to a failed translation-table operation.
    fn rtt_failure(&self, rd: Pa, tree: usize, ipa: Ipa, err: RttError) -> RmiError {
        let top = match err {
            RttError::Walk { .. } | RttError::State { .. } => self
                .realms
                .get(&rd)
                .and_then(|realm| realm.rtt.walk_top(tree, ipa, self.config.top_policy).ok()),
            _ => None,
        };
        RmiError {
            code: err.code(),
            top,
        }
    }
}

impl HostMemory for ModelMonitor {
    fn alloc_granule(&mut self) -> Option<Pa> {
        self.registry.alloc()
    }

    fn alloc_granules(&mut self, count: usize, align: u64) -> Option<Pa> {
        self.registry.alloc_contiguous(count, align)
    }

    fn release_granule(&mut self, pa: Pa) -> bool {
        self.registry.release(pa)
    }

    fn write_granule(&mut self, pa: Pa, offset: usize, bytes: &[u8]) -> Result<(), RegistryError> {
        self.registry.write(pa, offset, bytes)
    }

    fn read_granule(&self, pa: Pa) -> Result<Vec<u8>, RegistryError> {
        self.registry.read(pa)
    }

    fn granule_state(&self, pa: Pa) -> GranuleState {
        self.registry.classify(pa)
    }

    fn memory_map(&self) -> MemoryMap {
        self.registry.memory_map().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_violation_follows_precedence() {
        let violated = |c: RangeCheck| matches!(c, RangeCheck::TopOutOfBound | RangeCheck::RecOwner);
        assert_eq!(
            first_violation(&RangeCheck::default_precedence(), violated),
            Some(RangeCheck::RecOwner)
        );
        let reversed: Vec<_> = RangeCheck::default_precedence().into_iter().rev().collect();
        assert_eq!(first_violation(&reversed, violated), Some(RangeCheck::TopOutOfBound));
        assert_eq!(RangeCheck::RecOwner.code(), ReturnCode::rec());
        assert_eq!(RangeCheck::TopOutOfBound.code(), ReturnCode::input());
    }

    #[test]
    fn test_unprotected_desc_layout() {
        let desc = unprotected_desc(0x8020_0000, 0x4);
        assert_eq!(desc & DESC_ADDR_MASK, 0x8020_0000);
        assert_eq!(desc & DESC_ATTR_MASK, 0x4);
    }

    #[test]
    fn test_outcome_of_results() {
        let ok: RmiResult<()> = Ok(());
        let err: RmiResult<()> = Err(ReturnCode::rtt(2).into());
        assert_eq!(outcome(&ok), ReturnCode::SUCCESS);
        assert_eq!(outcome(&err), ReturnCode::rtt(2));
    }
}
