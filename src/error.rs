//! Error types for the SSL bootstrap.
//!
//! Every error is fatal to the bootstrap attempt that raised it; nothing is
//! retried internally. Application code wraps these in `anyhow` with context.

use std::fmt;
use std::io;
use std::path::PathBuf;

use openssl::error::ErrorStack;
use thiserror::Error;

/// Failures of the OpenSSL primitives used to create key material.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unable to allocate space for the {what}: {source}")]
    Allocation {
        what: &'static str,
        #[source]
        source: ErrorStack,
    },

    #[error("unable to prepare exponent for RSA algorithm: {0}")]
    ExponentSetup(#[source] ErrorStack),

    #[error("unable to generate RSA key: {0}")]
    KeyGeneration(#[source] ErrorStack),

    #[error("unable to assign RSA key to use as private key: {0}")]
    KeyAssign(#[source] ErrorStack),

    #[error("unable to {step} for the x509 certificate: {source}")]
    Signing {
        step: &'static str,
        #[source]
        source: ErrorStack,
    },
}

/// Which of the two credential files an I/O failure concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    PrivateKey,
    Certificate,
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::PrivateKey => f.write_str("private key"),
            FileKind::Certificate => f.write_str("certificate"),
        }
    }
}

/// Failures while persisting credentials to disk.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unable to open {kind} file '{}' for writing: {source}", .path.display())]
    Open {
        kind: FileKind,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to store {kind} in '{}': {source}", .path.display())]
    Write {
        kind: FileKind,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to lock credential files via '{}': {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    /// The credential file the error refers to, if any.
    pub fn kind(&self) -> Option<FileKind> {
        match self {
            StorageError::Open { kind, .. } | StorageError::Write { kind, .. } => Some(*kind),
            StorageError::Lock { .. } => None,
        }
    }
}

/// Failures of the host configuration collaborator.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to read host settings '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse host settings '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize host settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write host settings '{}': {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid value for setting \"{name}\": {value}")]
    InvalidSetting { name: String, value: String },
}

/// Error reported by a failed bootstrap run.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Host(#[from] HostError),
}
