//! Certificate authority for TLS interception.
//!
//! A persistent root authority and on-demand, SNI-keyed leaf issuance
//! with an expiring cache.

mod authority;
mod cache;
mod leaf;
mod serial;

use std::path::PathBuf;

pub use authority::{RootAuthority, RootSubject};
pub use cache::{CacheStats, LeafCache};
pub use leaf::{LeafCredential, LeafHost, LeafIssuer, LeafPolicy};
pub use serial::{DEFAULT_SERIAL_BITS, SerialGenerator, key_id};

/// The result type for CA operations.
pub type CaResult<T> = Result<T, CaError>;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("only half of the CA material exists, missing {}", .0.display())]
    Incomplete(PathBuf),
    #[error("invalid CA key type: {0}")]
    InvalidKeyType(String),
    #[error("failed to parse CA certificate: {0}")]
    Parse(String),
    #[error("CA certificate expired at {0}")]
    Expired(time::OffsetDateTime),
    #[error("CA certificate does not match its private key")]
    KeyMismatch,
    #[error("failed to generate key pair: {0}")]
    KeyGeneration(#[source] rcgen::Error),
    #[error("failed to sign certificate: {0}")]
    Signing(#[source] rcgen::Error),
    #[error("failed to create signing key: {0}")]
    SigningKey(#[source] rustls::Error),
    #[error("system random source failed")]
    Random,
    #[error("invalid DNS name: {0}")]
    InvalidDnsName(String),
    #[error("handshake aborted: no server name")]
    HandshakeAborted,
}
