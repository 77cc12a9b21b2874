//! Attestation token generation and chunked retrieval.
//!
//! The token is a flat tag-length-value blob: challenge, personalization
//! value, initial measurement, hash algorithm, platform claims, and a BLAKE3
//! digest over everything before it. Realms fetch it granule by granule
//! through `token_continue`, which copies at most one chunk per call.

use crate::realm::Realm;
use crate::types::{RsiStatus, GRANULE_SIZE};
use blake3::Hasher;

pub const CHALLENGE_SIZE: usize = 64;

const TOKEN_MAGIC: &[u8; 4] = b"RTKN";
const TOKEN_VERSION: u16 = 1;

const TAG_CHALLENGE: u8 = 1;
const TAG_PERSONALIZATION: u8 = 2;
const TAG_RIM: u8 = 3;
const TAG_HASH_ALGO: u8 = 4;
const TAG_PLATFORM: u8 = 5;
const TAG_SIGNATURE: u8 = 6;

fn push_field(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
}

/// Builds the token for `realm` answering `challenge`.
pub fn build_token(realm: &Realm, challenge: &[u8; CHALLENGE_SIZE], platform_claims_len: usize) -> Vec<u8> {
    let rim = realm.measurement.value();

    let mut platform = vec![0u8; platform_claims_len];
    let mut hasher = Hasher::new();
    hasher.update(b"platform");
    hasher.update(&(rim.len() as u64).to_be_bytes());
    hasher.update(rim);
    hasher.finalize_xof().fill(&mut platform);

    let mut token = Vec::with_capacity(platform_claims_len + 256);
    token.extend_from_slice(TOKEN_MAGIC);
    token.extend_from_slice(&TOKEN_VERSION.to_be_bytes());
    push_field(&mut token, TAG_CHALLENGE, challenge);
    push_field(&mut token, TAG_PERSONALIZATION, &realm.params.rpv);
    push_field(&mut token, TAG_RIM, rim);
    push_field(&mut token, TAG_HASH_ALGO, &[realm.params.hash_algo.id()]);
    push_field(&mut token, TAG_PLATFORM, &platform);
    let signature = *blake3::hash(&token).as_bytes();
    push_field(&mut token, TAG_SIGNATURE, &signature);
    token
}

pub fn has_token_header(bytes: &[u8]) -> bool {
    bytes.len() >= 6 && &bytes[..4] == TOKEN_MAGIC && bytes[4..6] == TOKEN_VERSION.to_be_bytes()
}

/// Progress of one `token_continue` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenProgress {
    pub len: usize,
    pub complete: bool,
}

/// Token retrieval state held by the REC between init and the final continue.
#[derive(Debug, Clone)]
pub struct TokenSession {
    token: Vec<u8>,
    copied: usize,
}

impl TokenSession {
    pub fn new(token: Vec<u8>) -> Self {
        Self { token, copied: 0 }
    }

    pub fn len(&self) -> usize {
        self.token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.token.len() - self.copied
    }

    /// Copies up to `min(size, chunk_limit)` bytes of the token into
    /// `buf[offset..]`.
    pub fn continue_into(
        &mut self,
        buf: &mut [u8],
        offset: usize,
        size: usize,
        chunk_limit: usize,
    ) -> Result<TokenProgress, RsiStatus> {
        let end = offset.checked_add(size).ok_or(RsiStatus::ErrorInput)?;
        if end > buf.len() || end > GRANULE_SIZE as usize || size == 0 {
            return Err(RsiStatus::ErrorInput);
        }
        let len = size.min(chunk_limit.max(1)).min(self.remaining());
        buf[offset..offset + len].copy_from_slice(&self.token[self.copied..self.copied + len]);
        self.copied += len;
        Ok(TokenProgress {
            len,
            complete: self.remaining() == 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realm::{Realm, RealmParams};

    fn realm() -> Realm {
        let mut params = RealmParams::default();
        params.rpv[0] = 0x5a;
        Realm::new(0x8000_0000, params, vec![vec![0x8000_1000]])
    }

    #[test]
    fn test_token_layout() {
        let realm = realm();
        let token = build_token(&realm, &[7u8; CHALLENGE_SIZE], 100);
        assert!(has_token_header(&token));
        // header + six fields (5 byte prefix each) + payloads
        let expected = 6 + 6 * 5 + CHALLENGE_SIZE + 64 + 32 + 1 + 100 + 32;
        assert_eq!(token.len(), expected);
        assert_eq!(build_token(&realm, &[7u8; CHALLENGE_SIZE], 100), token);
        assert_ne!(build_token(&realm, &[8u8; CHALLENGE_SIZE], 100), token);
    }

    #[test]
    fn test_continue_respects_chunk_limit() {
        let mut session = TokenSession::new(vec![0xab; 3000]);
        let mut buf = vec![0u8; GRANULE_SIZE as usize];
        let first = session.continue_into(&mut buf, 0, 4096, 1024).unwrap();
        assert_eq!(first, TokenProgress { len: 1024, complete: false });
        let mut offset = first.len;
        let mut total = first.len;
        loop {
            let p = session
                .continue_into(&mut buf, offset, 4096 - offset, 1024)
                .unwrap();
            offset += p.len;
            total += p.len;
            if p.complete {
                break;
            }
        }
        assert_eq!(total, 3000);
        assert!(buf[..3000].iter().all(|b| *b == 0xab));
    }

    #[test]
    fn test_continue_rejects_overrun() {
        let mut session = TokenSession::new(vec![1; 10]);
        let mut buf = vec![0u8; GRANULE_SIZE as usize];
        assert_eq!(
            session.continue_into(&mut buf, 4000, 200, 1024),
            Err(RsiStatus::ErrorInput)
        );
    }
}
