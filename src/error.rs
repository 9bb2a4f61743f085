//! Error types for fbekeyd

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for fbekeyd
#[derive(Error, Debug)]
pub enum Error {
    // Parameter / precondition errors: detected before any I/O or
    // hardware call, no partial side effects.
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Key already initialized")]
    KeyAlreadyInitialized,

    #[error("Invalid blob size: expected {expected}, got {got}")]
    InvalidBlobSize { expected: usize, got: usize },

    #[error("Blob too large: {size} bytes exceeds limit of {limit} bytes")]
    BlobTooLarge { size: usize, limit: usize },

    // Crypto errors: always fail closed, no partial plaintext.
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Random generation failed")]
    RandomFailed,

    // Hardware key store (HDI) errors.
    #[error("HUKS error in {op}: code {code}")]
    Hdi { op: &'static str, code: i32 },

    #[error("HUKS retry exhausted in {op}: code {code}")]
    HdiRetryExhausted { op: &'static str, code: i32 },

    // Authentication errors: the caller should prompt for credentials
    // again; never merged into the generic key-operation failure.
    #[error("Authentication failed")]
    AuthFailed,

    #[error("Authentication token expired")]
    AuthTimeout,

    // Key lifecycle / storage layout errors.
    #[error("Key file missing: {0}")]
    KeyFileMissing(String),

    #[error("No candidate key generation found")]
    NoCandidate,

    #[error("Restore key failed: no generation decrypted")]
    RestoreKeyFailed,

    #[error("Fscrypt version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("Unsupported fscrypt version: {0}")]
    UnsupportedVersion(u8),

    // Kernel-facing errors.
    #[error("Kernel key install failed: {0}")]
    KernelInstall(String),

    #[error("Kernel key remove failed: {0}")]
    KernelRemove(String),

    #[error("FBEX error: {0}")]
    Fbex(String),

    #[error("Recovery key error: {0}")]
    Recovery(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures the caller should answer with a credential
    /// re-prompt instead of a generic "key operation failed".
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Error::AuthFailed | Error::AuthTimeout)
    }

    /// Convert to libc errno for the daemon IPC surface
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Error::InvalidParam(_)
            | Error::InvalidBlobSize { .. }
            | Error::BlobTooLarge { .. } => libc::EINVAL,
            Error::KeyAlreadyInitialized => libc::EEXIST,
            Error::AuthFailed | Error::AuthTimeout => libc::EACCES,
            Error::KeyFileMissing(_) | Error::NoCandidate => libc::ENOENT,
            Error::Fbex(_) => libc::ENOTSUP,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
