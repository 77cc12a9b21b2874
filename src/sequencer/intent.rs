//! Test intents and their dispatch to construction functions.

use super::fixtures;
use super::{PrepResult, Sequencer};
use crate::host::RealmId;
use crate::monitor::{Platform, RangeCheck};
use crate::types::{Ipa, Pa, PsciStatus};
use serde::Serialize;

/// Shape of a granule argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GranuleIntent {
    Unaligned,
    DevMem,
    OutsideOfPermittedPa,
    Undelegated,
    Delegated,
    Rd,
    Rec,
    RecAux,
    Rtt,
    Data,
}

/// What granule fixtures may reuse from the suite's valid fixture.
#[derive(Debug, Clone, Copy)]
pub struct GranuleContext {
    /// Realm in the NEW state the typed granules are created in.
    pub realm: RealmId,
    /// A valid granule argument, offset for the unaligned case.
    pub valid: Pa,
    /// Protected IPA free for a data granule.
    pub data_ipa: Ipa,
}

impl GranuleIntent {
    pub fn prepare<M: Platform>(self, seq: &mut Sequencer<'_, M>, ctx: &GranuleContext) -> PrepResult<Pa> {
        match self {
            GranuleIntent::Unaligned => fixtures::unaligned_granule(ctx.valid),
            GranuleIntent::DevMem => fixtures::dev_mem_granule(seq),
            GranuleIntent::OutsideOfPermittedPa => fixtures::outside_permitted_granule(seq),
            GranuleIntent::Undelegated => fixtures::undelegated_granule(seq),
            GranuleIntent::Delegated => fixtures::delegated_granule(seq),
            GranuleIntent::Rd => fixtures::rd_granule(seq, ctx.realm),
            GranuleIntent::Rec => fixtures::rec_granule(seq, ctx.realm),
            GranuleIntent::RecAux => fixtures::rec_aux_granule(seq, ctx.realm),
            GranuleIntent::Rtt => fixtures::rtt_granule(seq, ctx.realm),
            GranuleIntent::Data => fixtures::data_granule(seq, ctx.realm, ctx.data_ipa),
        }
    }
}

/// Shape of an IPA argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IpaIntent {
    Unaligned,
    Unprotected,
    OutsideOfPermittedIpa,
    NotMapped,
    RtteUnassigned,
    UnprotectedNotMapped,
    UnprotectedRtteUnassigned,
    AuxLive,
}

#[derive(Debug, Clone, Copy)]
pub struct IpaContext {
    pub realm: RealmId,
    /// The IPA the positive path uses.
    pub valid: Ipa,
    /// Protected IPA, inside an existing level 2 table, free for a new leaf.
    pub free: Ipa,
}

/// An (rd, ipa) pair plus the `top` a failing walk is expected to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpaFixture {
    pub rd: Pa,
    pub ipa: Ipa,
    pub walk_top: Option<Ipa>,
}

impl IpaIntent {
    pub fn prepare<M: Platform>(self, seq: &mut Sequencer<'_, M>, ctx: &IpaContext) -> PrepResult<IpaFixture> {
        match self {
            IpaIntent::Unaligned => fixtures::unaligned_ipa(seq, ctx),
            IpaIntent::Unprotected => fixtures::unprotected_ipa(seq, ctx),
            IpaIntent::OutsideOfPermittedIpa => fixtures::outside_permitted_ipa(seq, ctx),
            IpaIntent::NotMapped => fixtures::not_mapped_ipa(seq, ctx),
            IpaIntent::RtteUnassigned => fixtures::unassigned_ipa(seq, ctx),
            IpaIntent::UnprotectedNotMapped => fixtures::unprotected_not_mapped_ipa(seq, ctx),
            IpaIntent::UnprotectedRtteUnassigned => fixtures::unprotected_unassigned_ipa(seq, ctx),
            IpaIntent::AuxLive => fixtures::aux_live_ipa(seq, ctx),
        }
    }
}

/// Relationship between a calling and a target REC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecIntent {
    /// Target belongs to another realm.
    OtherOwner,
    /// Calling and target are the same REC.
    Alias,
    /// Calling REC has no pending request.
    NoRequest,
    /// Target MPIDR differs from the one requested.
    OtherMpidr,
    StatusNotPermitted,
}

#[derive(Debug, Clone, Copy)]
pub struct RecContext {
    pub realm: RealmId,
    pub calling: Pa,
    pub target: Pa,
    /// REC of the same realm with no pending request and an unrequested MPIDR.
    pub idle: Pa,
    pub status: PsciStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecArgs {
    pub calling: Pa,
    pub target: Pa,
    pub status: PsciStatus,
}

impl RecIntent {
    pub fn prepare<M: Platform>(self, seq: &mut Sequencer<'_, M>, ctx: &RecContext) -> PrepResult<RecArgs> {
        match self {
            RecIntent::OtherOwner => fixtures::other_owner_rec(seq, ctx),
            RecIntent::Alias => fixtures::alias_rec(ctx),
            RecIntent::NoRequest => fixtures::no_request_rec(ctx),
            RecIntent::OtherMpidr => fixtures::other_mpidr_rec(ctx),
            RecIntent::StatusNotPermitted => fixtures::status_not_permitted(ctx),
        }
    }

    /// The REC a single-REC command should receive for this intent.
    pub fn subject(self, args: &RecArgs) -> Pa {
        match self {
            RecIntent::OtherOwner | RecIntent::OtherMpidr => args.target,
            _ => args.calling,
        }
    }
}

/// Shape of a `[base, top)` range answering a pending realm request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeIntent {
    InvalidSize,
    BaseMismatch,
    TopOutOfBound,
    TopUnaligned,
    /// Base not aligned to the primary tree's entry at that address.
    BasePrimaryUnaligned,
    /// Base not aligned to an auxiliary tree's entry at that address.
    BaseAuxiliaryUnaligned,
}

#[derive(Debug, Clone, Copy)]
pub struct RangeContext {
    pub realm: RealmId,
    pub rec: Pa,
    pub base: Ipa,
    pub top: Ipa,
    /// Runnable REC whose script asks for a range its trees cannot take whole.
    pub second: Pa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeArgs {
    pub rec: Pa,
    pub base: Ipa,
    pub top: Ipa,
}

impl RangeIntent {
    pub fn prepare<M: Platform>(self, seq: &mut Sequencer<'_, M>, ctx: &RangeContext) -> PrepResult<RangeArgs> {
        match self {
            RangeIntent::InvalidSize => fixtures::empty_range(ctx),
            RangeIntent::BaseMismatch => fixtures::mismatched_base(ctx),
            RangeIntent::TopOutOfBound => fixtures::top_out_of_bound(ctx),
            RangeIntent::TopUnaligned => fixtures::unaligned_top(ctx),
            RangeIntent::BasePrimaryUnaligned => fixtures::primary_unaligned_base(seq, ctx),
            RangeIntent::BaseAuxiliaryUnaligned => fixtures::auxiliary_unaligned_base(seq, ctx),
        }
    }

    /// Range check this intent violates, when it is one of the ordered checks.
    pub fn violation(self) -> Option<RangeCheck> {
        match self {
            RangeIntent::InvalidSize => Some(RangeCheck::InvalidSize),
            RangeIntent::BaseMismatch => Some(RangeCheck::BaseMismatch),
            RangeIntent::TopOutOfBound => Some(RangeCheck::TopOutOfBound),
            RangeIntent::TopUnaligned => Some(RangeCheck::TopUnaligned),
            RangeIntent::BasePrimaryUnaligned | RangeIntent::BaseAuxiliaryUnaligned => None,
        }
    }
}
