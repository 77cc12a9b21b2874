//! Construction functions, one per intent variant.

use super::intent::{IpaContext, IpaFixture, RangeArgs, RangeContext, RecArgs, RecContext};
use super::{PrepResult, Prepared, Sequencer};
use crate::error::PrepError;
use crate::host::{self, RealmId, RealmSpec, RecSpec};
use crate::monitor::Platform;
use crate::realm::{ExitReason, RealmParams, RecEnter};
use crate::types::{level_size, Ipa, Pa, PsciStatus, GRANULE_SIZE};
use crate::verifier::expected_top;
use tracing::trace;

fn ready<T>(value: T) -> PrepResult<T> {
    Ok(Prepared::Ready(value))
}

pub fn unaligned_granule(valid: Pa) -> PrepResult<Pa> {
    ready(valid + GRANULE_SIZE / 2)
}

pub fn dev_mem_granule<M: Platform>(seq: &mut Sequencer<'_, M>) -> PrepResult<Pa> {
    match seq.platform_ref().memory_map().first_device_granule() {
        Some(pa) => ready(pa),
        None => Ok(Prepared::Skip("platform declares no device memory".into())),
    }
}

pub fn outside_permitted_granule<M: Platform>(seq: &mut Sequencer<'_, M>) -> PrepResult<Pa> {
    ready(seq.platform_ref().memory_map().pa_limit())
}

pub fn undelegated_granule<M: Platform>(seq: &mut Sequencer<'_, M>) -> PrepResult<Pa> {
    seq.undelegated().map(Prepared::Ready)
}

pub fn delegated_granule<M: Platform>(seq: &mut Sequencer<'_, M>) -> PrepResult<Pa> {
    seq.delegated().map(Prepared::Ready)
}

pub fn rd_granule<M: Platform>(seq: &mut Sequencer<'_, M>, realm: RealmId) -> PrepResult<Pa> {
    seq.rd(realm).map(Prepared::Ready)
}

/// A fresh, parked REC in `realm`, which must still be NEW.
pub fn rec_granule<M: Platform>(seq: &mut Sequencer<'_, M>, realm: RealmId) -> PrepResult<Pa> {
    seq.with_realm(realm, |m, handle| host::add_rec(m, handle, &RecSpec::parked()))
        .map(Prepared::Ready)
}

pub fn rec_aux_granule<M: Platform>(seq: &mut Sequencer<'_, M>, realm: RealmId) -> PrepResult<Pa> {
    let rec = seq.with_realm(realm, |m, handle| host::add_rec(m, handle, &RecSpec::parked()))?;
    let handle = seq.handle(realm)?;
    let aux = handle
        .recs
        .iter()
        .position(|&pa| pa == rec)
        .and_then(|index| handle.rec_aux(index))
        .and_then(|aux| aux.first().copied());
    Ok(match aux {
        Some(pa) => Prepared::Ready(pa),
        None => Prepared::Skip("RECs need no auxiliary granules".into()),
    })
}

pub fn rtt_granule<M: Platform>(seq: &mut Sequencer<'_, M>, realm: RealmId) -> PrepResult<Pa> {
    Ok(Prepared::Ready(seq.handle(realm)?.rtt_base))
}

pub fn data_granule<M: Platform>(seq: &mut Sequencer<'_, M>, realm: RealmId, ipa: Ipa) -> PrepResult<Pa> {
    seq.map_data(realm, ipa, None).map(Prepared::Ready)
}

fn with_top<M: Platform>(seq: &mut Sequencer<'_, M>, rd: Pa, ipa: Ipa) -> PrepResult<IpaFixture> {
    let policy = seq.checks().top_policy;
    let top = expected_top(seq.platform_ref(), rd, ipa, policy)?;
    trace!(ipa = format_args!("{:#x}", ipa), top = format_args!("{:#x}", top), "walk top");
    ready(IpaFixture {
        rd,
        ipa,
        walk_top: Some(top),
    })
}

fn plain(rd: Pa, ipa: Ipa) -> PrepResult<IpaFixture> {
    ready(IpaFixture {
        rd,
        ipa,
        walk_top: None,
    })
}

pub fn unaligned_ipa<M: Platform>(seq: &mut Sequencer<'_, M>, ctx: &IpaContext) -> PrepResult<IpaFixture> {
    plain(seq.rd(ctx.realm)?, ctx.valid + GRANULE_SIZE / 2)
}

/// Unprotected IPA whose leaf table exists.
pub fn unprotected_ipa<M: Platform>(seq: &mut Sequencer<'_, M>, ctx: &IpaContext) -> PrepResult<IpaFixture> {
    let ipa = seq.create_mapping(ctx.realm, 0, false, 0)?;
    plain(seq.rd(ctx.realm)?, ipa)
}

pub fn outside_permitted_ipa<M: Platform>(seq: &mut Sequencer<'_, M>, ctx: &IpaContext) -> PrepResult<IpaFixture> {
    let handle = seq.handle(ctx.realm)?;
    plain(handle.rd, handle.params.ipa_limit())
}

/// Protected IPA under a level 1 entry that was never expanded.
pub fn not_mapped_ipa<M: Platform>(seq: &mut Sequencer<'_, M>, ctx: &IpaContext) -> PrepResult<IpaFixture> {
    let rd = seq.rd(ctx.realm)?;
    with_top(seq, rd, level_size(1))
}

pub fn unassigned_ipa<M: Platform>(seq: &mut Sequencer<'_, M>, ctx: &IpaContext) -> PrepResult<IpaFixture> {
    let ipa = seq.create_mapping(ctx.realm, ctx.free, true, 0)?;
    let rd = seq.rd(ctx.realm)?;
    with_top(seq, rd, ipa)
}

pub fn unprotected_not_mapped_ipa<M: Platform>(seq: &mut Sequencer<'_, M>, ctx: &IpaContext) -> PrepResult<IpaFixture> {
    let handle = seq.handle(ctx.realm)?;
    let (rd, ipa) = (handle.rd, handle.unprotected_base() + level_size(1));
    with_top(seq, rd, ipa)
}

pub fn unprotected_unassigned_ipa<M: Platform>(seq: &mut Sequencer<'_, M>, ctx: &IpaContext) -> PrepResult<IpaFixture> {
    let ipa = seq.create_mapping(ctx.realm, GRANULE_SIZE, false, 0)?;
    let rd = seq.rd(ctx.realm)?;
    with_top(seq, rd, ipa)
}

/// Protected leaf at `ctx.valid` of a new per-plane-tree realm, aliased by plane 1.
pub fn aux_live_ipa<M: Platform>(seq: &mut Sequencer<'_, M>, ctx: &IpaContext) -> PrepResult<IpaFixture> {
    let features = seq.platform_ref().features();
    if !features.planes || !features.rtt_tree_per_plane {
        return Ok(Prepared::Skip("no support for RTT tree per plane".into()));
    }
    let realm = seq.realm(RealmSpec {
        params: RealmParams {
            num_aux_planes: 1,
            rtt_tree_per_plane: true,
            ..RealmParams::default()
        },
        recs: vec![RecSpec::parked()],
        activate: false,
    })?;
    seq.map_data(realm, ctx.valid, None)?;
    seq.with_realm(realm, |m, handle| host::aux_map(m, handle, ctx.valid, 1))?;
    plain(seq.rd(realm)?, ctx.valid)
}

pub fn other_owner_rec<M: Platform>(seq: &mut Sequencer<'_, M>, ctx: &RecContext) -> PrepResult<RecArgs> {
    let other = seq.realm(RealmSpec {
        recs: vec![RecSpec::runnable(Vec::new()), RecSpec::parked()],
        ..RealmSpec::default()
    })?;
    ready(RecArgs {
        calling: ctx.calling,
        target: seq.rec(other, 1)?,
        status: ctx.status,
    })
}

pub fn alias_rec(ctx: &RecContext) -> PrepResult<RecArgs> {
    ready(RecArgs {
        calling: ctx.target,
        target: ctx.target,
        status: ctx.status,
    })
}

pub fn no_request_rec(ctx: &RecContext) -> PrepResult<RecArgs> {
    ready(RecArgs {
        calling: ctx.idle,
        target: ctx.target,
        status: ctx.status,
    })
}

pub fn other_mpidr_rec(ctx: &RecContext) -> PrepResult<RecArgs> {
    ready(RecArgs {
        calling: ctx.calling,
        target: ctx.idle,
        status: ctx.status,
    })
}

pub fn status_not_permitted(ctx: &RecContext) -> PrepResult<RecArgs> {
    ready(RecArgs {
        calling: ctx.calling,
        target: ctx.target,
        status: PsciStatus::NotSupported,
    })
}

fn range(rec: Pa, base: Ipa, top: Ipa) -> PrepResult<RangeArgs> {
    ready(RangeArgs { rec, base, top })
}

pub fn empty_range(ctx: &RangeContext) -> PrepResult<RangeArgs> {
    range(ctx.rec, ctx.base, ctx.base)
}

pub fn mismatched_base(ctx: &RangeContext) -> PrepResult<RangeArgs> {
    range(ctx.rec, ctx.base + GRANULE_SIZE, ctx.top)
}

pub fn top_out_of_bound(ctx: &RangeContext) -> PrepResult<RangeArgs> {
    range(ctx.rec, ctx.base, ctx.top + GRANULE_SIZE)
}

pub fn unaligned_top(ctx: &RangeContext) -> PrepResult<RangeArgs> {
    range(ctx.rec, ctx.base, ctx.top - GRANULE_SIZE / 2)
}

fn second_request<M: Platform>(seq: &mut Sequencer<'_, M>, ctx: &RangeContext) -> Result<(Ipa, Ipa), PrepError> {
    let exit = seq.enter_expecting(ctx.second, &RecEnter::default(), ExitReason::S2apChange)?;
    Ok((exit.s2ap_base, exit.s2ap_top))
}

/// Enters the second REC so it asks for a range starting inside a primary block.
pub fn primary_unaligned_base<M: Platform>(seq: &mut Sequencer<'_, M>, ctx: &RangeContext) -> PrepResult<RangeArgs> {
    let (base, top) = second_request(seq, ctx)?;
    range(ctx.second, base, top)
}

/// As above, but with the primary tree expanded to leaves so only an
/// auxiliary tree is left unaligned.
pub fn auxiliary_unaligned_base<M: Platform>(seq: &mut Sequencer<'_, M>, ctx: &RangeContext) -> PrepResult<RangeArgs> {
    if !seq.handle(ctx.realm)?.has_aux_trees() {
        return Ok(Prepared::Skip("realm has a single RTT tree".into()));
    }
    let (base, top) = second_request(seq, ctx)?;
    let pages = (top - base) / GRANULE_SIZE;
    for page in 0..pages {
        seq.create_mapping(ctx.realm, base + page * GRANULE_SIZE, true, 0)?;
    }
    range(ctx.second, base, top)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::granule::GranuleState;
    use crate::monitor::{HostMemory, ModelMonitor, MonitorConfig};
    use crate::rtt::RttState;
    use crate::monitor::Rmi;

    #[test]
    fn test_granule_fixtures_have_requested_state() {
        let mut m = ModelMonitor::default();
        let mut seq = Sequencer::new(&mut m);
        let realm = seq.realm(RealmSpec::default()).unwrap();
        let rec = rec_granule(&mut seq, realm).unwrap().ready().unwrap();
        let aux = rec_aux_granule(&mut seq, realm).unwrap().ready().unwrap();
        let data = data_granule(&mut seq, realm, 0x5000).unwrap().ready().unwrap();
        let m = seq.platform_ref();
        assert_eq!(m.granule_state(rec), GranuleState::Rec);
        assert_eq!(m.granule_state(aux), GranuleState::RecAux);
        assert_eq!(m.granule_state(data), GranuleState::Data);
    }

    #[test]
    fn test_dev_mem_skips_without_device_region() {
        let mut config = MonitorConfig::default();
        config.memory.device.clear();
        let mut m = ModelMonitor::new(config);
        let mut seq = Sequencer::new(&mut m);
        assert!(matches!(dev_mem_granule(&mut seq), Ok(Prepared::Skip(_))));
    }

    #[test]
    fn test_not_mapped_ipa_reports_short_walk_top() {
        let mut m = ModelMonitor::default();
        let mut seq = Sequencer::new(&mut m);
        let realm = seq.realm(RealmSpec::default()).unwrap();
        seq.create_mapping(realm, 0x1000, true, 0).unwrap();
        let ctx = IpaContext {
            realm,
            valid: 0x1000,
            free: 0x2000,
        };
        let fixture = not_mapped_ipa(&mut seq, &ctx).unwrap().ready().unwrap();
        assert_eq!(fixture.walk_top, Some(2 * level_size(1)));
        let entry = seq
            .platform_ref()
            .rtt_read_entry(fixture.rd, fixture.ipa, 3)
            .unwrap();
        assert_eq!(entry.walk_level, 1);
        assert_eq!(entry.state, RttState::Unassigned);
    }

    #[test]
    fn test_aux_live_skips_without_per_plane_trees() {
        let mut config = MonitorConfig::default();
        config.features.rtt_tree_per_plane = false;
        let mut m = ModelMonitor::new(config);
        let mut seq = Sequencer::new(&mut m);
        let realm = seq.realm(RealmSpec::default()).unwrap();
        let ctx = IpaContext {
            realm,
            valid: 0x1000,
            free: 0x2000,
        };
        assert!(matches!(aux_live_ipa(&mut seq, &ctx), Ok(Prepared::Skip(_))));
    }

    #[test]
    fn test_rec_aux_granule_belongs_to_the_new_rec() {
        let mut m = ModelMonitor::default();
        let mut seq = Sequencer::new(&mut m);
        let realm = seq.realm(RealmSpec::default()).unwrap();
        let first = rec_aux_granule(&mut seq, realm).unwrap().ready().unwrap();
        let second = rec_aux_granule(&mut seq, realm).unwrap().ready().unwrap();
        assert_ne!(first, second);
        let handle = seq.handle(realm).unwrap();
        let last = handle.recs.len() - 1;
        assert_eq!(handle.rec_aux(last).and_then(|aux| aux.first().copied()), Some(second));
        assert_eq!(seq.platform_ref().granule_state(second), GranuleState::RecAux);
    }
}
