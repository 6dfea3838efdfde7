//! Certificate authority errors.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("storage path {} is unusable: {source}", .path.display())]
    Path {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("CA material at {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("cannot read CA material at {}: {source}", .path.display())]
    Access {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Broad failure category, for callers that only need to decide between
/// "fix permissions", "delete and regenerate" and "retry".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Path,
    Corruption,
    Access,
    Crypto,
    Config,
}

impl CaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Path { .. } => ErrorKind::Path,
            Self::Corrupt { .. } => ErrorKind::Corruption,
            Self::Access { .. } => ErrorKind::Access,
            Self::Crypto(_) => ErrorKind::Crypto,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// True when the underlying OS error is a permission failure.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Path { source, .. } | Self::Access { source, .. } => {
                source.kind() == io::ErrorKind::PermissionDenied
            }
            _ => false,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Key generation, signing or randomness failure.
///
/// Cloneable so that every caller coalesced onto one issuance observes the
/// same error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cryptographic operation failed: {0}")]
pub struct CryptoError(String);

impl CryptoError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<rcgen::Error> for CryptoError {
    fn from(e: rcgen::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<rcgen::Error> for CaError {
    fn from(e: rcgen::Error) -> Self {
        Self::Crypto(e.into())
    }
}
