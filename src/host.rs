//! Host-side helpers
//!
//! Realm construction, mapping helpers and teardown built purely from the
//! command surface, plus `RealmScope`, which records every realm and host
//! granule a test creates and releases them on every exit path.

use crate::error::PrepError;
use crate::granule::GranuleState;
use crate::monitor::{unprotected_desc, Platform, RealmCreate, RmiResult};
use crate::realm::{mpidr_from_index, ExitReason, GuestStep, RealmParams, RecEnter, RecParams};
use crate::rtt::RttState;
use crate::types::{
    align_down, level_size, Ipa, Pa, PsciStatus, RmiStatus, GRANULE_SIZE, RTT_ENTRIES,
    RTT_MAX_LEVEL,
};
use tracing::{debug, trace, warn};

/// Converts a command result into a preparation result for `step`.
pub fn expect_ok<T>(step: &'static str, result: RmiResult<T>) -> Result<T, PrepError> {
    result.map_err(|err| PrepError::command(step, err.code))
}

/// Host bookkeeping for one realm.
#[derive(Debug, Clone)]
pub struct RealmHandle {
    pub rd: Pa,
    pub params: RealmParams,
    pub rtt_base: Pa,
    pub aux_rtt_base: Vec<Pa>,
    pub recs: Vec<Pa>,
    rec_aux: Vec<Vec<Pa>>,
    next_rec_index: u64,
    /// Auxiliary tables created through the helpers: (ipa, level, tree).
    aux_tables: Vec<(Ipa, u8, usize)>,
    /// Auxiliary aliases created through the helpers: (ipa, tree).
    aux_maps: Vec<(Ipa, usize)>,
}

impl RealmHandle {
    pub fn unprotected_base(&self) -> Ipa {
        self.params.unprotected_base()
    }

    pub fn rec(&self, index: usize) -> Option<Pa> {
        self.recs.get(index).copied()
    }

    pub fn rec_aux(&self, index: usize) -> Option<&[Pa]> {
        self.rec_aux.get(index).map(Vec::as_slice)
    }

    pub fn has_aux_trees(&self) -> bool {
        self.params.tree_count() > 1
    }

    fn tree_for_plane(&self, plane: usize) -> usize {
        if plane > 0 && self.params.rtt_tree_per_plane {
            plane
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecSpec {
    pub runnable: bool,
    pub pc: u64,
    pub script: Vec<GuestStep>,
}

impl RecSpec {
    pub fn runnable(script: Vec<GuestStep>) -> Self {
        Self {
            runnable: true,
            pc: 0,
            script,
        }
    }

    pub fn parked() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RealmSpec {
    pub params: RealmParams,
    pub recs: Vec<RecSpec>,
    pub activate: bool,
}

pub fn delegated_granule<M: Platform>(m: &mut M) -> Result<Pa, PrepError> {
    let pa = m.alloc_granule().ok_or(PrepError::PoolExhausted { count: 1 })?;
    expect_ok("delegate granule", m.granule_delegate(pa))?;
    Ok(pa)
}

/// Allocates and delegates `count` contiguous granules aligned to `align`.
pub fn delegated_granules<M: Platform>(m: &mut M, count: usize, align: u64) -> Result<Pa, PrepError> {
    let base = m
        .alloc_granules(count, align)
        .ok_or(PrepError::PoolExhausted { count })?;
    for i in 0..count as u64 {
        expect_ok("delegate granule", m.granule_delegate(base + i * GRANULE_SIZE))?;
    }
    Ok(base)
}

pub fn undelegated_granule<M: Platform>(m: &mut M) -> Result<Pa, PrepError> {
    m.alloc_granule().ok_or(PrepError::PoolExhausted { count: 1 })
}

/// Returns a host granule to the pool, undelegating it first when needed.
pub fn reclaim_granule<M: Platform>(m: &mut M, pa: Pa) -> bool {
    if m.granule_state(pa) == GranuleState::Delegated && m.granule_undelegate(pa).is_err() {
        return false;
    }
    m.granule_state(pa) == GranuleState::Undelegated && m.release_granule(pa)
}

pub fn create_realm<M: Platform>(m: &mut M, params: &RealmParams) -> Result<RealmHandle, PrepError> {
    let count = params.num_start_rtts;
    let align = GRANULE_SIZE * count.next_power_of_two() as u64;
    let rd = delegated_granule(m)?;
    let rtt_base = delegated_granules(m, count, align)?;
    let mut aux_rtt_base = Vec::new();
    for _ in 1..params.tree_count() {
        aux_rtt_base.push(delegated_granules(m, count, align)?);
    }
    let create = RealmCreate {
        params: params.clone(),
        rtt_base,
        aux_rtt_base: aux_rtt_base.clone(),
    };
    if let Err(err) = m.realm_create(rd, &create) {
        let tables = std::iter::once(rtt_base).chain(aux_rtt_base.iter().copied());
        for base in tables {
            for i in 0..count as u64 {
                reclaim_granule(m, base + i * GRANULE_SIZE);
            }
        }
        reclaim_granule(m, rd);
        return Err(PrepError::command("realm create", err.code));
    }
    debug!(rd = format_args!("{:#x}", rd), s2sz = params.s2sz, "realm created");
    Ok(RealmHandle {
        rd,
        params: params.clone(),
        rtt_base,
        aux_rtt_base,
        recs: Vec::new(),
        rec_aux: Vec::new(),
        next_rec_index: 0,
        aux_tables: Vec::new(),
        aux_maps: Vec::new(),
    })
}

pub fn add_rec<M: Platform>(m: &mut M, realm: &mut RealmHandle, spec: &RecSpec) -> Result<Pa, PrepError> {
    let aux_count = expect_ok("rec aux count", m.rec_aux_count(realm.rd))?;
    let rec = delegated_granule(m)?;
    let mut aux = Vec::with_capacity(aux_count);
    for _ in 0..aux_count {
        aux.push(delegated_granule(m)?);
    }
    let params = RecParams {
        mpidr: mpidr_from_index(realm.next_rec_index),
        pc: spec.pc,
        runnable: spec.runnable,
        aux: aux.clone(),
        script: spec.script.clone(),
    };
    expect_ok("rec create", m.rec_create(realm.rd, rec, &params))?;
    realm.next_rec_index += 1;
    realm.recs.push(rec);
    realm.rec_aux.push(aux);
    Ok(rec)
}

/// Creates a realm with its RECs, optionally activating it.
pub fn realm_setup<M: Platform>(m: &mut M, spec: &RealmSpec) -> Result<RealmHandle, PrepError> {
    let mut realm = create_realm(m, &spec.params)?;
    for rec in &spec.recs {
        add_rec(m, &mut realm, rec)?;
    }
    if spec.activate {
        expect_ok("realm activate", m.realm_activate(realm.rd))?;
    }
    Ok(realm)
}

/// Creates any missing tables so that `ipa` is covered down to `level` in
/// the tree of `plane`. Unprotected addresses are given relative to the
/// start of the unprotected half.
pub fn create_mapping_at<M: Platform>(
    m: &mut M,
    realm: &mut RealmHandle,
    ipa: Ipa,
    protected: bool,
    plane: usize,
    level: u8,
) -> Result<Ipa, PrepError> {
    let ipa = if protected {
        ipa
    } else {
        ipa | realm.unprotected_base()
    };
    let tree = realm.tree_for_plane(plane);
    for target in realm.params.start_level + 1..=level {
        let table_ipa = align_down(ipa, level_size(target - 1));
        if tree == 0 {
            let entry = expect_ok("read entry", m.rtt_read_entry(realm.rd, table_ipa, target - 1))?;
            if entry.walk_level == target - 1 && entry.state == RttState::Table {
                continue;
            }
        }
        let rtt = delegated_granule(m)?;
        let result = if tree == 0 {
            m.rtt_create(realm.rd, rtt, table_ipa, target)
        } else {
            m.rtt_aux_create(realm.rd, rtt, table_ipa, target, tree)
        };
        match result {
            Ok(()) => {
                if tree > 0 {
                    realm.aux_tables.push((table_ipa, target, tree));
                }
                trace!(ipa = format_args!("{:#x}", table_ipa), level = target, tree, "table created");
            }
            Err(err) if err.code.status == RmiStatus::ErrorRttAux && err.code.index == target - 1 => {
                // Auxiliary table already present.
                reclaim_granule(m, rtt);
            }
            Err(err) => {
                reclaim_granule(m, rtt);
                return Err(PrepError::command("rtt create", err.code));
            }
        }
    }
    Ok(ipa)
}

pub fn create_mapping<M: Platform>(
    m: &mut M,
    realm: &mut RealmHandle,
    ipa: Ipa,
    protected: bool,
    plane: usize,
) -> Result<Ipa, PrepError> {
    create_mapping_at(m, realm, ipa, protected, plane, RTT_MAX_LEVEL)
}

/// Maps one protected data granule at `ipa`, copying `content` into it.
pub fn map_protected_data<M: Platform>(
    m: &mut M,
    realm: &mut RealmHandle,
    ipa: Ipa,
    content: Option<&[u8]>,
) -> Result<Pa, PrepError> {
    create_mapping(m, realm, ipa, true, 0)?;
    let src = undelegated_granule(m)?;
    if let Some(bytes) = content {
        m.write_granule(src, 0, bytes)
            .map_err(|e| PrepError::step("write source", e.to_string()))?;
    }
    let data = delegated_granule(m)?;
    let result = m.data_create(realm.rd, data, ipa, src, content.is_some());
    m.release_granule(src);
    if let Err(err) = result {
        reclaim_granule(m, data);
        return Err(PrepError::command("data create", err.code));
    }
    Ok(data)
}

/// Maps `[base, base + size)` of the unprotected half, page by page, onto
/// host memory starting at `pa`. `base` is relative to the unprotected half.
pub fn map_unprotected_range<M: Platform>(
    m: &mut M,
    realm: &mut RealmHandle,
    base: Ipa,
    size: u64,
    pa: Pa,
    attr: u64,
) -> Result<Ipa, PrepError> {
    let pages = size / GRANULE_SIZE;
    let mut first = None;
    for page in 0..pages {
        let offset = page * GRANULE_SIZE;
        let ipa = create_mapping(m, realm, base + offset, false, 0)?;
        first.get_or_insert(ipa);
        expect_ok(
            "map unprotected",
            m.rtt_map_unprotected(realm.rd, ipa, RTT_MAX_LEVEL, unprotected_desc(pa + offset, attr)),
        )?;
    }
    first.ok_or_else(|| PrepError::step("map unprotected", "empty range"))
}

/// Re-creates tables over a block entry from `from_level + 1` down to `to_level`.
pub fn unfold<M: Platform>(m: &mut M, realm: &RealmHandle, ipa: Ipa, from_level: u8, to_level: u8) -> Result<Vec<Pa>, PrepError> {
    let mut created = Vec::new();
    for level in from_level + 1..=to_level {
        let rtt = delegated_granule(m)?;
        if let Err(err) = m.rtt_create(realm.rd, rtt, align_down(ipa, level_size(level - 1)), level) {
            reclaim_granule(m, rtt);
            return Err(PrepError::command("unfold", err.code));
        }
        created.push(rtt);
    }
    Ok(created)
}

/// Aliases the protected mapping at `ipa` into auxiliary plane `plane`.
pub fn aux_map<M: Platform>(m: &mut M, realm: &mut RealmHandle, ipa: Ipa, plane: usize) -> Result<(), PrepError> {
    create_mapping(m, realm, ipa, true, plane)?;
    expect_ok("aux map protected", m.rtt_aux_map_protected(realm.rd, ipa, plane))?;
    realm.aux_maps.push((ipa, plane));
    Ok(())
}

/// Empties the primary-tree table at `level` covering `base`, recursing into
/// child tables and releasing every granule it frees.
fn clear_table<M: Platform>(m: &mut M, realm: &RealmHandle, base: Ipa, level: u8, entries: usize) -> Result<(), PrepError> {
    let size = level_size(level);
    for i in 0..entries as u64 {
        let ipa = base + i * size;
        let mut entry = expect_ok("read entry", m.rtt_read_entry(realm.rd, ipa, level))?;
        if entry.state == RttState::Assigned && level < RTT_MAX_LEVEL {
            unfold(m, realm, ipa, level, level + 1)?;
            entry = expect_ok("read entry", m.rtt_read_entry(realm.rd, ipa, level))?;
        }
        match entry.state {
            RttState::Table => {
                clear_table(m, realm, ipa, level + 1, RTT_ENTRIES)?;
                let destroyed = expect_ok("rtt destroy", m.rtt_destroy(realm.rd, ipa, level + 1))?;
                reclaim_granule(m, destroyed.rtt);
            }
            RttState::Assigned => {
                let destroyed = expect_ok("data destroy", m.data_destroy(realm.rd, ipa))?;
                reclaim_granule(m, destroyed.data);
            }
            RttState::AssignedNs => {
                expect_ok("unmap unprotected", m.rtt_unmap_unprotected(realm.rd, ipa, level))?;
            }
            RttState::Unassigned | RttState::Destroyed => {}
        }
    }
    Ok(())
}

/// Entries granted to each REC while driving an active realm to SYSTEM_OFF.
const QUIESCE_ENTRIES: usize = 16;

/// Answers a pending PSCI request of `calling` with a refusal, trying each
/// other REC of the realm as the target.
fn refuse_pending_psci<M: Platform>(m: &mut M, realm: &RealmHandle, calling: Pa) -> bool {
    realm.recs.iter().filter(|target| **target != calling).any(|target| {
        [PsciStatus::Denied, PsciStatus::AlreadyOn]
            .into_iter()
            .any(|status| m.psci_complete(calling, *target, status).is_ok())
    })
}

/// Runs the realm's RECs until the guest powers the system off, so that no
/// REC is live any more. Gives up after a bounded number of entries.
fn quiesce<M: Platform>(m: &mut M, realm: &RealmHandle) {
    for (index, rec) in realm.recs.iter().enumerate() {
        for _ in 0..QUIESCE_ENTRIES {
            if m.granule_state(*rec) != GranuleState::Rec {
                break;
            }
            match m.rec_enter(*rec, &RecEnter::default()) {
                Ok(exit) if exit.reason == ExitReason::SystemOff => {
                    trace!(rd = format_args!("{:#x}", realm.rd), rec = index, "realm powered off");
                    return;
                }
                Ok(exit) if exit.reason == ExitReason::Psci => {
                    refuse_pending_psci(m, realm, *rec);
                }
                Ok(_) => {}
                // Realm not active: nothing is live.
                Err(err) if err.code.status == RmiStatus::ErrorRealm => return,
                Err(err) if err.code.status == RmiStatus::ErrorRec => {
                    if !refuse_pending_psci(m, realm, *rec) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    }
}

/// Tears a realm down through the command surface and reclaims its granules.
pub fn teardown<M: Platform>(m: &mut M, realm: RealmHandle) -> Result<(), PrepError> {
    for (ipa, plane) in realm.aux_maps.iter().rev() {
        // Already removed aliases are fine.
        let _ = m.rtt_aux_unmap_protected(realm.rd, *ipa, *plane);
    }
    quiesce(m, &realm);
    for (rec, aux) in realm.recs.iter().zip(&realm.rec_aux) {
        if m.granule_state(*rec) == GranuleState::Rec {
            expect_ok("rec destroy", m.rec_destroy(*rec))?;
        }
        reclaim_granule(m, *rec);
        for pa in aux {
            reclaim_granule(m, *pa);
        }
    }
    for (ipa, level, tree) in realm.aux_tables.iter().rev() {
        let destroyed = expect_ok("aux rtt destroy", m.rtt_aux_destroy(realm.rd, *ipa, *level, *tree))?;
        reclaim_granule(m, destroyed.rtt);
    }

    let start = realm.params.start_level;
    let root_entries = (realm.params.ipa_limit() / level_size(start))
        .min((RTT_ENTRIES * realm.params.num_start_rtts) as u64) as usize;
    clear_table(m, &realm, 0, start, root_entries)?;

    expect_ok("realm destroy", m.realm_destroy(realm.rd))?;
    reclaim_granule(m, realm.rd);
    let roots = std::iter::once(realm.rtt_base).chain(realm.aux_rtt_base.iter().copied());
    for base in roots {
        for i in 0..realm.params.num_start_rtts as u64 {
            reclaim_granule(m, base + i * GRANULE_SIZE);
        }
    }
    debug!(rd = format_args!("{:#x}", realm.rd), "realm torn down");
    Ok(())
}

/// Identifier of a realm recorded in a `RealmScope`.
pub type RealmId = usize;

/// Records realms and host granules for release when the scope ends.
#[derive(Debug, Default)]
pub struct RealmScope {
    realms: Vec<Option<RealmHandle>>,
    granules: Vec<Pa>,
}

impl RealmScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adopt(&mut self, realm: RealmHandle) -> RealmId {
        self.realms.push(Some(realm));
        self.realms.len() - 1
    }

    pub fn realm(&self, id: RealmId) -> Option<&RealmHandle> {
        self.realms.get(id).and_then(Option::as_ref)
    }

    pub fn realm_mut(&mut self, id: RealmId) -> Option<&mut RealmHandle> {
        self.realms.get_mut(id).and_then(Option::as_mut)
    }

    /// Removes a realm the caller tears down itself.
    pub fn forget(&mut self, id: RealmId) -> Option<RealmHandle> {
        self.realms.get_mut(id).and_then(Option::take)
    }

    pub fn track_granule(&mut self, pa: Pa) {
        self.granules.push(pa);
    }

    /// Releases everything recorded, newest first. Returns the number of
    /// realms or granules that could not be reclaimed.
    pub fn release<M: Platform>(&mut self, m: &mut M) -> usize {
        let mut leaked = 0;
        while let Some(slot) = self.realms.pop() {
            if let Some(realm) = slot {
                let rd = realm.rd;
                if let Err(err) = teardown(m, realm) {
                    warn!(rd = format_args!("{:#x}", rd), error = %err, "realm teardown failed");
                    leaked += 1;
                }
            }
        }
        while let Some(pa) = self.granules.pop() {
            let state = m.granule_state(pa);
            if state.is_typed() {
                warn!(pa = format_args!("{:#x}", pa), %state, "granule still in use at scope end");
                leaked += 1;
            } else if !reclaim_granule(m, pa) && m.granule_state(pa) != GranuleState::Undelegated {
                leaked += 1;
            }
        }
        leaked
    }
}

/// Runs `f` with a fresh scope and releases it afterwards, whatever `f` returned.
pub fn scoped<M: Platform, R>(m: &mut M, f: impl FnOnce(&mut M, &mut RealmScope) -> R) -> R {
    let mut scope = RealmScope::new();
    let result = f(m, &mut scope);
    let leaked = scope.release(m);
    if leaked > 0 {
        warn!(leaked, "scope released with leaks");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{ModelMonitor, Rmi};

    #[test]
    fn test_realm_setup_and_teardown_reclaims_everything() {
        let mut m = ModelMonitor::default();
        let spec = RealmSpec {
            recs: vec![RecSpec::parked()],
            ..RealmSpec::default()
        };
        let mut realm = realm_setup(&mut m, &spec).unwrap();
        map_protected_data(&mut m, &mut realm, 0x1000, Some(&[0xaa; 16])).unwrap();
        map_unprotected_range(&mut m, &mut realm, 0, 2 * GRANULE_SIZE, 0x8800_0000, 0).unwrap();

        teardown(&mut m, realm).unwrap();
        assert_eq!(m.realm_count(), 0);
        for state in [
            GranuleState::Delegated,
            GranuleState::Rd,
            GranuleState::Rtt,
            GranuleState::Data,
            GranuleState::Rec,
            GranuleState::RecAux,
        ] {
            assert_eq!(m.registry().count(state), 0, "{state} left behind");
        }
    }

    #[test]
    fn test_teardown_powers_off_active_realm() {
        let mut m = ModelMonitor::default();
        let spec = RealmSpec {
            recs: vec![
                RecSpec::runnable(vec![
                    GuestStep::PsciCpuOn {
                        target_mpidr: mpidr_from_index(1),
                        entry: 0,
                    },
                    GuestStep::PsciSystemOff,
                ]),
                RecSpec::parked(),
            ],
            activate: true,
            ..RealmSpec::default()
        };
        let realm = realm_setup(&mut m, &spec).unwrap();
        let rec = realm.rec(0).unwrap();
        assert_eq!(m.rec_destroy(rec).unwrap_err().code, crate::types::ReturnCode::rec());

        teardown(&mut m, realm).unwrap();
        assert_eq!(m.realm_count(), 0);
        assert_eq!(m.registry().count(GranuleState::Rec), 0);
    }

    #[test]
    fn test_create_mapping_reaches_leaf() {
        let mut m = ModelMonitor::default();
        let mut realm = create_realm(&mut m, &RealmParams::default()).unwrap();
        create_mapping(&mut m, &mut realm, 0x3000, true, 0).unwrap();
        let entry = m.rtt_read_entry(realm.rd, 0x3000, 3).unwrap();
        assert_eq!(entry.walk_level, 3);
        // Second call creates nothing new.
        let before = m.registry().count(GranuleState::Rtt);
        create_mapping(&mut m, &mut realm, 0x4000, true, 0).unwrap();
        assert_eq!(m.registry().count(GranuleState::Rtt), before);
    }

    #[test]
    fn test_scoped_releases_on_early_return() {
        let mut m = ModelMonitor::default();
        let result: Result<(), PrepError> = scoped(&mut m, |m, scope| {
            let realm = create_realm(m, &RealmParams::default())?;
            scope.adopt(realm);
            Err(PrepError::step("test", "bail out"))
        });
        assert!(result.is_err());
        assert_eq!(m.realm_count(), 0);
    }
}
