//! Realm Execution Contexts (RECs), their scripted guest behaviour and exit records.

use crate::attestation::TokenSession;
use crate::rtt::Ripas;
use crate::types::{Ipa, Pa, PsciStatus};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Number of general purpose registers carried through entry and exit.
pub const REC_GPRS: usize = 8;

pub const PSCI_CPU_ON: u64 = 0xc400_0003;
pub const PSCI_SYSTEM_OFF: u64 = 0x8400_0008;
pub const PSCI_SYSTEM_RESET: u64 = 0x8400_0009;

const ESR_EC_SHIFT: u64 = 26;
const ESR_EC_IABT_LOWER: u64 = 0x20;
const ESR_EC_DABT_LOWER: u64 = 0x24;
const ESR_IL: u64 = 1 << 25;
/// Fault status: translation fault, level 3.
const ESR_FSC_TRANSLATION_L3: u64 = 0x07;

/// MPIDR for the REC at `index`: Aff0 holds the low 4 bits, Aff1 the rest.
pub fn mpidr_from_index(index: u64) -> u64 {
    (index & 0xf) | ((index >> 4) << 8)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Data,
    Instruction,
}

/// One step of a REC's scripted guest program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestStep {
    /// Exit to the host with a host call; `gprs` are reported in the exit.
    HostCall { imm: u16, gprs: Vec<u64> },
    /// Host call whose registers carry the realm personalization value.
    ReportRpv,
    PsciCpuOn { target_mpidr: u64, entry: u64 },
    PsciSystemOff,
    /// Exits with a PSCI exit; the realm is off until the host rebuilds it.
    PsciSystemReset,
    RipasChange {
        base: Ipa,
        top: Ipa,
        ripas: Ripas,
        change_destroyed: bool,
    },
    S2apChange { base: Ipa, top: Ipa, index: u8 },
    Access { ipa: Ipa, kind: AccessKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Sync,
    Irq,
    Psci,
    RipasChange,
    HostCall,
    S2apChange,
    SystemOff,
}

/// Host-visible record produced by every REC entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecExit {
    pub reason: ExitReason,
    pub esr: u64,
    pub far: u64,
    pub hpfar: u64,
    pub gprs: [u64; REC_GPRS],
    pub imm: u16,
    pub ripas_base: Ipa,
    pub ripas_top: Ipa,
    pub ripas_value: Option<Ripas>,
    pub s2ap_base: Ipa,
    pub s2ap_top: Ipa,
}

impl RecExit {
    pub fn new(reason: ExitReason) -> Self {
        Self {
            reason,
            esr: 0,
            far: 0,
            hpfar: 0,
            gprs: [0; REC_GPRS],
            imm: 0,
            ripas_base: 0,
            ripas_top: 0,
            ripas_value: None,
            s2ap_base: 0,
            s2ap_top: 0,
        }
    }

    /// Stage-2 abort taken to the host for `ipa`.
    pub fn abort(ipa: Ipa, kind: AccessKind) -> Self {
        let ec = match kind {
            AccessKind::Data => ESR_EC_DABT_LOWER,
            AccessKind::Instruction => ESR_EC_IABT_LOWER,
        };
        let mut exit = Self::new(ExitReason::Sync);
        exit.esr = (ec << ESR_EC_SHIFT) | ESR_IL | ESR_FSC_TRANSLATION_L3;
        exit.hpfar = hpfar_for(ipa);
        exit
    }

    pub fn exception_class(&self) -> u64 {
        self.esr >> ESR_EC_SHIFT
    }

    pub fn is_instruction_abort(&self) -> bool {
        self.reason == ExitReason::Sync && self.exception_class() == ESR_EC_IABT_LOWER
    }

    pub fn is_data_abort(&self) -> bool {
        self.reason == ExitReason::Sync && self.exception_class() == ESR_EC_DABT_LOWER
    }

    /// Faulting IPA page recovered from HPFAR.
    pub fn fault_ipa(&self) -> Ipa {
        (self.hpfar >> 4) << 12
    }
}

/// HPFAR_EL2.FIPA holds IPA[47:12] at bit 4.
pub fn hpfar_for(ipa: Ipa) -> u64 {
    (ipa >> 12) << 4
}

/// Host-provided arguments for REC entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecEnter {
    /// Refuse the RIPAS change the previous exit asked for.
    pub reject_ripas: bool,
    pub gprs: [u64; REC_GPRS],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsciRequest {
    pub function: u64,
    pub target_mpidr: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RipasRequest {
    pub base: Ipa,
    pub top: Ipa,
    pub next: Ipa,
    pub ripas: Ripas,
    pub change_destroyed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S2apRequest {
    pub base: Ipa,
    pub top: Ipa,
    pub next: Ipa,
    pub index: u8,
}

/// Realm-side observations recorded on the REC for tests to inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RsiEvent {
    IpaStateSet {
        base: Ipa,
        top: Ipa,
        next: Ipa,
        accepted: bool,
    },
    S2apSet {
        base: Ipa,
        top: Ipa,
        next: Ipa,
    },
    InjectedAbort {
        ipa: Ipa,
        kind: AccessKind,
    },
    PsciResult {
        function: u64,
        status: PsciStatus,
    },
}

#[derive(Debug)]
pub struct Rec {
    pub pa: Pa,
    pub rd: Pa,
    pub index: u64,
    pub mpidr: u64,
    pub pc: u64,
    pub runnable: bool,
    pub aux: Vec<Pa>,
    pub gprs: [u64; REC_GPRS],
    pub pending_psci: Option<PsciRequest>,
    pub pending_ripas: Option<RipasRequest>,
    pub pending_s2ap: Option<S2apRequest>,
    pub script: VecDeque<GuestStep>,
    pub events: Vec<RsiEvent>,
    pub token: Option<TokenSession>,
}

impl Rec {
    pub fn new(pa: Pa, rd: Pa, index: u64, params: &RecParams) -> Self {
        Self {
            pa,
            rd,
            index,
            mpidr: params.mpidr,
            pc: params.pc,
            runnable: params.runnable,
            aux: params.aux.clone(),
            gprs: [0; REC_GPRS],
            pending_psci: None,
            pending_ripas: None,
            pending_s2ap: None,
            script: params.script.iter().cloned().collect(),
            events: Vec::new(),
            token: None,
        }
    }

    /// A pending request the host still has to resolve blocks entry.
    pub fn has_blocking_request(&self) -> bool {
        self.pending_psci.is_some()
    }
}

/// REC creation parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecParams {
    pub mpidr: u64,
    pub pc: u64,
    pub runnable: bool,
    pub aux: Vec<Pa>,
    pub script: Vec<GuestStep>,
}
