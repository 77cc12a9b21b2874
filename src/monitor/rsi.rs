//! `Rsi` for the reference monitor.

use super::{ModelMonitor, RealmConfig, Rsi};
use crate::attestation::{build_token, TokenProgress, TokenSession, CHALLENGE_SIZE};
use crate::realm::{GuestStep, Realm, RealmState, Rec, RsiEvent};
use crate::rtt::{Ripas, RttState};
use crate::types::{is_aligned, level_size, Ipa, Pa, RsiStatus, GRANULE_SIZE, RTT_MAX_LEVEL};
use tracing::debug;

impl ModelMonitor {
    fn rsi_rec(&self, rec: Pa) -> Result<(&Rec, &Realm), RsiStatus> {
        let rec = self.recs.get(&rec).ok_or(RsiStatus::ErrorInput)?;
        let realm = self.realms.get(&rec.rd).ok_or(RsiStatus::ErrorInput)?;
        Ok((rec, realm))
    }

    fn check_rsi_range(realm: &Realm, base: Ipa, top: Ipa) -> Result<(), RsiStatus> {
        if !is_aligned(base, GRANULE_SIZE)
            || !is_aligned(top, GRANULE_SIZE)
            || top <= base
            || top > realm.params.unprotected_base()
        {
            return Err(RsiStatus::ErrorInput);
        }
        Ok(())
    }
}

impl Rsi for ModelMonitor {
    fn rsi_realm_config(&self, rec: Pa) -> Result<RealmConfig, RsiStatus> {
        let (_, realm) = self.rsi_rec(rec)?;
        Ok(RealmConfig {
            ipa_width: realm.params.s2sz,
            hash_algo: realm.params.hash_algo,
        })
    }

    fn rsi_ipa_state_set(
        &mut self,
        rec: Pa,
        base: Ipa,
        top: Ipa,
        ripas: Ripas,
        change_destroyed: bool,
    ) -> Result<(), RsiStatus> {
        let (_, realm) = self.rsi_rec(rec)?;
        Self::check_rsi_range(realm, base, top)?;
        if ripas == Ripas::Destroyed {
            return Err(RsiStatus::ErrorInput);
        }
        let rec = self.recs.get_mut(&rec).ok_or(RsiStatus::ErrorInput)?;
        rec.script.push_front(GuestStep::RipasChange {
            base,
            top,
            ripas,
            change_destroyed,
        });
        Ok(())
    }

    fn rsi_ipa_state_get(&self, rec: Pa, base: Ipa, top: Ipa) -> Result<(Ipa, Ripas), RsiStatus> {
        let (_, realm) = self.rsi_rec(rec)?;
        Self::check_rsi_range(realm, base, top)?;
        let ripas_at = |ipa: Ipa| -> Result<(Ripas, u64), RsiStatus> {
            let walk = realm
                .rtt
                .walk(0, ipa, RTT_MAX_LEVEL)
                .map_err(|_| RsiStatus::ErrorInput)?;
            let ripas = match (walk.entry.state, walk.entry.ripas) {
                (RttState::Destroyed, _) => Ripas::Destroyed,
                (_, Some(ripas)) => ripas,
                (_, None) => Ripas::Empty,
            };
            let size = level_size(walk.level);
            Ok((ripas, ipa - ipa % size + size))
        };
        let (first, mut cursor) = ripas_at(base)?;
        while cursor < top {
            let (ripas, end) = ripas_at(cursor)?;
            if ripas != first {
                break;
            }
            cursor = end;
        }
        Ok((cursor.min(top), first))
    }

    fn rsi_attestation_token_init(&mut self, rec: Pa, challenge: &[u8; CHALLENGE_SIZE]) -> Result<usize, RsiStatus> {
        let (_, realm) = self.rsi_rec(rec)?;
        if realm.state != RealmState::Active {
            return Err(RsiStatus::ErrorState);
        }
        let token = build_token(realm, challenge, self.config.platform_claims_len);
        let len = token.len();
        let rec = self.recs.get_mut(&rec).ok_or(RsiStatus::ErrorInput)?;
        rec.token = Some(TokenSession::new(token));
        debug!(rec = format_args!("{:#x}", rec.pa), len, "attestation token prepared");
        Ok(len)
    }

    fn rsi_attestation_token_continue(
        &mut self,
        rec: Pa,
        buf: &mut [u8],
        offset: usize,
        size: usize,
    ) -> Result<TokenProgress, RsiStatus> {
        let chunk = self.config.token_chunk_size;
        let rec = self.recs.get_mut(&rec).ok_or(RsiStatus::ErrorInput)?;
        let session = rec.token.as_mut().ok_or(RsiStatus::ErrorState)?;
        let progress = session.continue_into(buf, offset, size, chunk)?;
        if progress.complete {
            rec.token = None;
        }
        Ok(progress)
    }

    fn rsi_events(&self, rec: Pa) -> Result<Vec<RsiEvent>, RsiStatus> {
        let (rec, _) = self.rsi_rec(rec)?;
        Ok(rec.events.clone())
    }
}
