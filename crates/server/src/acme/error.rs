//! ACME error types

use thiserror::Error;

use pendingdns_store::StoreError;

#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("No valid domain names provided")]
    NoValidDomains,

    #[error("Failed to create or load ACME account: {0}")]
    Account(String),

    #[error("Failed to create order: {0}")]
    Order(String),

    #[error("No DNS-01 challenge offered for domain '{0}'")]
    NoDns01Challenge(String),

    #[error("Challenge validation failed for '{domain}': {message}")]
    ChallengeValidation { domain: String, message: String },

    #[error("Challenge record for '{domain}' did not propagate within {elapsed_secs}s")]
    Propagation { domain: String, elapsed_secs: u64 },

    #[error("Failed to finalize order: {0}")]
    Finalization(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Failed to parse certificate: {0}")]
    CertificateParse(String),

    #[error("Issuance for this domain set is cooling down after a failure")]
    Cooldown,

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),
}
