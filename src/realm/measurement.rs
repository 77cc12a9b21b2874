//! Realm Initial Measurement (RIM) using BLAKE3
//!
//! Every extension hashes a type discriminator, the previous measurement and
//! the length-prefixed fields of the measured event. The digest length follows
//! the realm's selected hash algorithm; longer digests come from the XOF.

use super::{HashAlgo, RealmParams};
use crate::types::Ipa;
use blake3::Hasher;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Measurement {
    algo: HashAlgo,
    value: Vec<u8>,
}

impl Measurement {
    /// RIM = hash("realm" || params) at realm creation.
    pub fn for_realm(params: &RealmParams) -> Self {
        let mut m = Self {
            algo: params.hash_algo,
            value: vec![0u8; params.hash_algo.digest_len()],
        };
        m.extend(
            b"realm",
            &[
                &[params.s2sz],
                &[params.start_level],
                &(params.num_start_rtts as u64).to_be_bytes(),
                &[params.hash_algo.id()],
                &[params.num_aux_planes],
                &[u8::from(params.rtt_tree_per_plane)],
            ],
        );
        m
    }

    /// RIM = hash("rec" || RIM || pc || flags).
    pub fn extend_rec(&mut self, pc: u64, runnable: bool) {
        self.extend(b"rec", &[&pc.to_be_bytes(), &[u8::from(runnable)]]);
    }

    /// RIM = hash("ripas" || RIM || base || top).
    pub fn extend_ripas(&mut self, base: Ipa, top: Ipa) {
        self.extend(b"ripas", &[&base.to_be_bytes(), &top.to_be_bytes()]);
    }

    /// RIM = hash("data" || RIM || ipa || content?) for measured data creation.
    pub fn extend_data(&mut self, ipa: Ipa, content: Option<&[u8]>) {
        let content_hash = content.map(|c| *blake3::hash(c).as_bytes());
        match content_hash {
            Some(hash) => self.extend(b"data", &[&ipa.to_be_bytes(), &hash]),
            None => self.extend(b"data", &[&ipa.to_be_bytes()]),
        }
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn algo(&self) -> HashAlgo {
        self.algo
    }

    fn extend(&mut self, discriminator: &[u8], fields: &[&[u8]]) {
        let mut hasher = Hasher::new();
        hasher.update(discriminator);
        hasher.update(&(self.value.len() as u64).to_be_bytes());
        hasher.update(&self.value);
        for field in fields {
            hasher.update(&(field.len() as u64).to_be_bytes());
            hasher.update(field);
        }
        let mut out = vec![0u8; self.algo.digest_len()];
        hasher.finalize_xof().fill(&mut out);
        self.value = out;
        trace!(
            event = %String::from_utf8_lossy(discriminator),
            rim = %hex::encode(&self.value),
            "measurement extended"
        );
    }

    /// Lower-case hex of the current value.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_is_deterministic() {
        let params = RealmParams::default();
        let mut a = Measurement::for_realm(&params);
        let mut b = Measurement::for_realm(&params);
        assert_eq!(a, b);
        a.extend_data(0x1000, Some(&[1, 2, 3]));
        b.extend_data(0x1000, Some(&[1, 2, 3]));
        assert_eq!(a.value(), b.value());
        b.extend_ripas(0, 0x1000);
        assert_ne!(a.value(), b.value());
    }

    #[test]
    fn test_digest_length_follows_algorithm() {
        let mut params = RealmParams::default();
        params.hash_algo = HashAlgo::Sha512;
        let m = Measurement::for_realm(&params);
        assert_eq!(m.value().len(), 64);
        params.hash_algo = HashAlgo::Sha256;
        assert_eq!(Measurement::for_realm(&params).value().len(), 32);
    }
}
