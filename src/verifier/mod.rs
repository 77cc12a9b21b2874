//! Postcondition verifier
//!
//! Re-reads granule and RTT state through the command surface after a
//! command ran and turns any deviation into a `CheckError`.

pub mod snapshot;

pub use snapshot::FoldSnapshot;

use crate::attestation::CHALLENGE_SIZE;
use crate::error::{CheckError, PrepError};
use crate::granule::GranuleState;
use crate::host::expect_ok;
use crate::monitor::{HostMemory, Rmi, Rsi};
use crate::rtt::{Ripas, RttEntryView, RttState, TopPolicy};
use crate::types::{align_down, level_size, Ipa, Pa, ReturnCode, RTT_ENTRIES, RTT_MAX_LEVEL};
use tracing::debug;

pub fn expect_outcome(actual: ReturnCode, expected: ReturnCode) -> Result<(), CheckError> {
    if actual.packed() != expected.packed() {
        return Err(CheckError::OutcomeMismatch { actual, expected });
    }
    Ok(())
}

pub fn expect_top(actual: Ipa, expected: Ipa) -> Result<(), CheckError> {
    if actual != expected {
        return Err(CheckError::TopMismatch { actual, expected });
    }
    Ok(())
}

/// The `top` a walk of `ipa` that stops short should report, derived from
/// `read_entry` alone.
pub fn expected_top<M: Rmi + ?Sized>(m: &M, rd: Pa, ipa: Ipa, policy: TopPolicy) -> Result<Ipa, PrepError> {
    let entry = expect_ok("read entry", m.rtt_read_entry(rd, ipa, RTT_MAX_LEVEL))?;
    let size = level_size(entry.walk_level);
    let mut top = align_down(ipa, size) + size;
    if policy == TopPolicy::SkipNonLive {
        let table_end = align_down(ipa, size * RTT_ENTRIES as u64) + size * RTT_ENTRIES as u64;
        while top < table_end {
            match m.rtt_read_entry(rd, top, entry.walk_level) {
                Ok(next) if next.walk_level == entry.walk_level && !next.state.is_live() => top += size,
                _ => break,
            }
        }
    }
    Ok(top)
}

pub fn expect_entry(
    ipa: Ipa,
    read: &RttEntryView,
    state: RttState,
    ripas: Option<Ripas>,
) -> Result<(), CheckError> {
    if read.state != state || read.ripas != ripas {
        return Err(CheckError::EntryMismatch {
            ipa,
            detail: format!(
                "found {:?}/{:?}, expected {:?}/{:?}",
                read.state, read.ripas, state, ripas
            ),
        });
    }
    Ok(())
}

/// Reads the entry at `ipa` and checks it reached `level` with the given states.
pub fn expect_leaf<M: Rmi + ?Sized>(
    m: &M,
    rd: Pa,
    ipa: Ipa,
    level: u8,
    state: RttState,
    ripas: Option<Ripas>,
) -> Result<RttEntryView, CheckError> {
    let read = m.rtt_read_entry(rd, ipa, level).map_err(|err| CheckError::EntryMismatch {
        ipa,
        detail: format!("read entry failed with {}", err.code),
    })?;
    if read.walk_level != level {
        return Err(CheckError::EntryMismatch {
            ipa,
            detail: format!("walk stopped at level {}, expected {}", read.walk_level, level),
        });
    }
    expect_entry(ipa, &read, state, ripas)?;
    Ok(read)
}

pub fn expect_granule<M: HostMemory + ?Sized>(m: &M, pa: Pa, expected: GranuleState) -> Result<(), CheckError> {
    let actual = m.granule_state(pa);
    if actual != expected {
        return Err(CheckError::GranuleMismatch { pa, actual, expected });
    }
    Ok(())
}

/// Fails if `pa` still starts with `pattern`.
pub fn expect_wiped<M: HostMemory + ?Sized>(m: &M, pa: Pa, pattern: &[u8]) -> Result<(), CheckError> {
    let content = m
        .read_granule(pa)
        .map_err(|err| CheckError::ReadFailed {
            pa,
            reason: err.to_string(),
        })?;
    if !pattern.is_empty() && content.starts_with(pattern) {
        return Err(CheckError::NotWiped { pa });
    }
    Ok(())
}

/// Retrieves the whole attestation token for `rec` one `page`-sized buffer
/// at a time. Retrieval must finish within `ceil(len / page)` buffers and
/// the chunk lengths must add up to the length reported by init.
pub fn assemble_token<M: Rsi + ?Sized>(
    m: &mut M,
    rec: Pa,
    challenge: &[u8; CHALLENGE_SIZE],
    page: usize,
) -> Result<Vec<u8>, CheckError> {
    let len = m
        .rsi_attestation_token_init(rec, challenge)
        .map_err(|status| CheckError::TokenMismatch(format!("token init failed: {status:?}")))?;
    let pages = len.div_ceil(page);
    let mut token = Vec::with_capacity(len);
    let mut complete = false;

    for _ in 0..pages {
        let mut buf = vec![0u8; page];
        let mut offset = 0;
        while offset < page && !complete {
            let progress = m
                .rsi_attestation_token_continue(rec, &mut buf, offset, page - offset)
                .map_err(|status| CheckError::TokenMismatch(format!("token continue failed: {status:?}")))?;
            if progress.len == 0 && !progress.complete {
                return Err(CheckError::TokenMismatch(format!("no progress at offset {offset}")));
            }
            offset += progress.len;
            complete = progress.complete;
        }
        token.extend_from_slice(&buf[..offset]);
        if complete {
            break;
        }
    }

    if !complete {
        return Err(CheckError::TokenMismatch(format!(
            "token of {len} bytes not complete within {pages} buffer(s)"
        )));
    }
    if token.len() != len {
        return Err(CheckError::TokenMismatch(format!(
            "chunks add up to {} bytes, init reported {len}",
            token.len()
        )));
    }
    debug!(rec = format_args!("{:#x}", rec), len, pages, "token assembled");
    Ok(token)
}
