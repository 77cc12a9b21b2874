use super::{Recorder, SuiteResult};
use crate::attestation::{has_token_header, CHALLENGE_SIZE};
use crate::error::CheckError;
use crate::host::{RealmSpec, RecSpec};
use crate::monitor::Platform;
use crate::realm::rec::REC_GPRS;
use crate::realm::{ExitReason, GuestStep, RealmParams, RecEnter, RPV_SIZE};
use crate::sequencer::{Prepared, Sequencer};
use crate::types::{RsiStatus, GRANULE_SIZE};
use crate::verifier::assemble_token;

const PAGE: usize = GRANULE_SIZE as usize;

fn challenge(seed: u8) -> [u8; CHALLENGE_SIZE] {
    std::array::from_fn(|i| seed.wrapping_add(i as u8))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

fn expect_status<T: std::fmt::Debug>(result: Result<T, RsiStatus>, expected: RsiStatus) -> Result<(), CheckError> {
    match result {
        Err(status) if status == expected => Ok(()),
        other => Err(CheckError::TokenMismatch(format!("got {other:?}, expected {expected:?}"))),
    }
}

pub fn attestation_token<M: Platform>(seq: &mut Sequencer<'_, M>, rec: &mut Recorder) -> SuiteResult {
    let (active, inactive) = rec.prepare("setup", 1, || {
        let realm = seq.realm(RealmSpec {
            recs: vec![RecSpec::runnable(vec![GuestStep::PsciSystemOff])],
            activate: true,
            ..RealmSpec::default()
        })?;
        let new = seq.realm(RealmSpec {
            recs: vec![RecSpec::parked()],
            ..RealmSpec::default()
        })?;
        Ok((seq.rec(realm, 0)?, seq.rec(new, 0)?))
    })?;

    let mut first = Vec::new();
    rec.check("token: retrieved one page at a time", 2, || {
        let nonce = challenge(0x11);
        let token = assemble_token(seq.platform(), active, &nonce, PAGE)?;
        if !has_token_header(&token) {
            return Err(CheckError::TokenMismatch("missing token header".into()));
        }
        if !contains(&token, &nonce) {
            return Err(CheckError::TokenMismatch("challenge not bound into the token".into()));
        }
        first = token;
        Ok(Prepared::Ready(()))
    })?;

    rec.check("token: a new challenge yields a new token", 3, || {
        let token = assemble_token(seq.platform(), active, &challenge(0x22), PAGE)?;
        if token == first {
            return Err(CheckError::TokenMismatch("token unchanged by the challenge".into()));
        }
        Ok(Prepared::Ready(()))
    })?;

    rec.check("token: realm that is not active is refused", 4, || {
        expect_status(
            seq.platform().rsi_attestation_token_init(inactive, &challenge(0x33)),
            RsiStatus::ErrorState,
        )?;
        Ok(Prepared::Ready(()))
    })?;

    rec.check("token: continue without init is refused", 5, || {
        let mut buf = vec![0u8; PAGE];
        expect_status(
            seq.platform().rsi_attestation_token_continue(active, &mut buf, 0, PAGE),
            RsiStatus::ErrorState,
        )?;
        Ok(Prepared::Ready(()))
    })?;

    rec.check("token: realm runs on after attestation", 6, || {
        seq.enter_expecting(active, &RecEnter::default(), ExitReason::SystemOff)?;
        Ok(Prepared::Ready(()))
    })
}

fn personalization() -> [u8; RPV_SIZE] {
    std::array::from_fn(|i| (i % 16) as u8 + 1)
}

fn rpv_words(rpv: &[u8; RPV_SIZE]) -> [u64; REC_GPRS] {
    std::array::from_fn(|i| {
        let mut word = [0u8; 8];
        word.copy_from_slice(&rpv[i * 8..i * 8 + 8]);
        u64::from_le_bytes(word)
    })
}

pub fn attestation_rpv<M: Platform>(seq: &mut Sequencer<'_, M>, rec: &mut Recorder) -> SuiteResult {
    let rpv = personalization();
    let rec0 = rec.prepare("setup", 1, || {
        let realm = seq.realm(RealmSpec {
            params: RealmParams {
                rpv,
                ..RealmParams::default()
            },
            recs: vec![RecSpec::runnable(vec![
                GuestStep::ReportRpv,
                GuestStep::PsciSystemOff,
            ])],
            activate: true,
        })?;
        seq.rec(realm, 0)
    })?;

    rec.check("rpv: realm reads back its personalization value", 2, || {
        let exit = seq.enter_expecting(rec0, &RecEnter::default(), ExitReason::HostCall)?;
        let expected = rpv_words(&rpv);
        if exit.gprs != expected {
            return Err(CheckError::UnexpectedExit(format!(
                "registers {:x?}, expected {expected:x?}",
                exit.gprs
            )));
        }
        Ok(Prepared::Ready(()))
    })?;

    rec.check("rpv: token carries the personalization value", 3, || {
        let token = assemble_token(seq.platform(), rec0, &challenge(0x44), PAGE)?;
        if !contains(&token, &rpv) {
            return Err(CheckError::TokenMismatch("personalization value missing".into()));
        }
        seq.enter_expecting(rec0, &RecEnter::default(), ExitReason::SystemOff)?;
        Ok(Prepared::Ready(()))
    })
}
