//! Error types for the realm memory model.

use crate::granule::GranuleState;
use crate::types::{Ipa, Pa, ReturnCode};
use thiserror::Error;

/// Fixture construction failures.
///
/// A preparation error aborts the check that asked for the fixture. It is
/// distinct from an expected command failure (which is the point of a
/// negative check) and from a skip (which is a value, not an error).
#[derive(Debug, Error)]
pub enum PrepError {
    #[error("Preparation step '{step}' failed with {code}")]
    Command { step: &'static str, code: ReturnCode },

    #[error("Preparation step '{step}' failed: {reason}")]
    Step { step: &'static str, reason: String },

    #[error("Granule pool exhausted while allocating {count} granule(s)")]
    PoolExhausted { count: usize },

    #[error("Unexpected REC exit during '{step}': {detail}")]
    UnexpectedExit { step: &'static str, detail: String },
}

impl PrepError {
    pub fn command(step: &'static str, code: ReturnCode) -> Self {
        PrepError::Command { step, code }
    }

    pub fn step(step: &'static str, reason: impl Into<String>) -> Self {
        PrepError::Step {
            step,
            reason: reason.into(),
        }
    }
}

/// Postcondition failures detected by the verifier.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("Command returned {actual}, expected {expected}")]
    OutcomeMismatch {
        actual: ReturnCode,
        expected: ReturnCode,
    },

    #[error("Reported top {actual:#x}, expected {expected:#x}")]
    TopMismatch { actual: Ipa, expected: Ipa },

    #[error("RTT entry at {ipa:#x} mismatch: {detail}")]
    EntryMismatch { ipa: Ipa, detail: String },

    #[error("Granule {pa:#x} is {actual:?}, expected {expected:?}")]
    GranuleMismatch {
        pa: Pa,
        actual: GranuleState,
        expected: GranuleState,
    },

    #[error("Granule {pa:#x} still holds the pattern written while delegated")]
    NotWiped { pa: Pa },

    #[error("Cannot read granule {pa:#x}: {reason}")]
    ReadFailed { pa: Pa, reason: String },

    #[error("Fold mismatch at {ipa:#x}: {detail}")]
    FoldMismatch { ipa: Ipa, detail: String },

    #[error("Attestation token mismatch: {0}")]
    TokenMismatch(String),

    #[error("Unexpected REC exit: {0}")]
    UnexpectedExit(String),

    #[error("Positive path preparation failed: {0}")]
    Prep(#[from] PrepError),
}

/// Failures at the binary boundary: configuration, I/O and lookup of suites.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown suite: {0}")]
    UnknownSuite(String),

    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),

    #[error("Scenario '{name}' failed: {source}")]
    ScenarioFailed {
        name: String,
        #[source]
        source: CheckError,
    },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<config::ConfigError> for ModelError {
    fn from(err: config::ConfigError) -> Self {
        ModelError::ConfigError(err.to_string())
    }
}
