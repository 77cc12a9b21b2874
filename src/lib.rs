//! realm-model: granule and stage-2 translation table model
//!
//! An in-memory reference monitor for the realm management interface:
//! granule ownership, realm descriptors and RECs, the per-realm translation
//! tables with fold/unfold, RIPAS and S2AP range updates, and attestation
//! token retrieval. On top of it sit the fixture sequencer, the
//! postcondition verifier and the conformance suites that drive them.

pub mod attestation;
pub mod cli;
pub mod config;
pub mod error;
pub mod granule;
pub mod host;
pub mod logging;
pub mod monitor;
pub mod realm;
pub mod rtt;
pub mod scenario;
pub mod sequencer;
pub mod suite;
pub mod types;
pub mod verifier;
