//! Error types for ensemble-dns.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EnsembleError>;

/// Errors that can occur while coordinating signers.
#[derive(Debug, Error)]
pub enum EnsembleError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// DNS message construction or parsing error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// HTTP client error (provider API transport)
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Network-level failure talking to a signer (connect, timeout, channel)
    #[error("transport error: {0}")]
    Transport(String),

    /// TSIG credential missing or malformed, or signing failed
    #[error("TSIG error: {0}")]
    Tsig(String),

    /// A signer answered with a non-success RCODE
    #[error("{op} failed, RCODE = {rcode}")]
    Rcode {
        /// The operation that failed (e.g. "update", "fetch of DNSKEY RRset").
        op: String,
        /// Symbolic RCODE name from the response.
        rcode: String,
    },

    /// A provider API answered with a non-2xx status
    #[error("provider API returned {status}: {detail}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body detail, if any.
        detail: String,
    },

    /// A referenced zone, signer, or signer group does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// The operation is not supported by the signer's update method
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl EnsembleError {
    /// Shorthand for [`EnsembleError::NotFound`] over a named entity.
    pub fn not_found(kind: &str, name: &str) -> Self {
        EnsembleError::NotFound(format!("{kind} {name}"))
    }
}
