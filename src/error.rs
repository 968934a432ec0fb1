//! Shared error taxonomy for the core pipeline.
//!
//! `ManifestMissing` and `DeletionFailed` from spec §7 are deliberately
//! absent here: they never abort a run, so they are represented as data
//! (a `Finding`'s `problems`, or an eviction log line) rather than as an
//! error variant.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("registry {host} is not reachable or is not API v2: {reason}")]
    RegistryUnavailable {
        host: String,
        reason: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("registry request to {url} failed with status {status}")]
    RegistryError { url: String, status: u16 },

    #[error("inventory collection failed for context {context}: {reason}")]
    InventoryFatal { context: String, reason: String },

    #[error("keep-rule configuration is invalid: {0}")]
    KeepRuleError(String),

    #[error("run was cancelled")]
    Cancelled,
}

pub type CoreResult<T> = Result<T, CoreError>;
