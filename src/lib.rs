//! fbekeyd - per-user file-based encryption key management
//!
//! This library manages the lifecycle of fscrypt keys on a mobile
//! storage daemon: generation, hardware-backed wrapping ("shielding"),
//! versioned persistence, authenticated restore, and installation into
//! the kernel and the vendor inline-crypto engine.

pub mod config;
pub mod crypto;
pub mod error;
pub mod huks;
pub mod kernel;
pub mod key;
pub mod recovery;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::key::{KeyLevel, KeyManager, UserAuth};
}
