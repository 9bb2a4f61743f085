//! Key lifecycle module for fbekeyd
//!
//! `BaseKey` owns one (user, encryption-level) key's life: generation,
//! shielded persistence across numbered generations, authenticated
//! restore, and kernel installation. `KeyManager` sits on top as the
//! per-user registry.

pub(crate) mod base;
mod delay;
mod install;
mod manager;
mod v1_ext;

pub use base::BaseKey;
pub use delay::DelayHandler;
pub use manager::{KeyManager, GLOBAL_USER_ID};
pub use v1_ext::{FbexExt, DEFAULT_SINGLE_FIRST_USER_ID, USER_ID_DIFF};

use crate::crypto::KeyBlob;
use crate::error::{Error, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// On-disk file names inside one generation directory
pub const PATH_SHIELD: &str = "shield";
pub const PATH_SECDISC: &str = "sec_discard";
pub const PATH_ENCRYPTED: &str = "encrypted";
pub const PATH_KEY_ID: &str = "key_id";
pub const PATH_KEY_DESC: &str = "key_desc";
pub const PATH_KEY_HASH: &str = "key_hash";
/// Siblings of the generation directories
pub const PATH_FSCRYPT_VERSION: &str = "fscrypt_version";
pub const PATH_NEED_RESTORE: &str = "need_restore";
pub const PATH_LATEST: &str = "latest";
pub const PATH_LATEST_BAK: &str = "latest_bak";
pub const VERSION_PREFIX: &str = "version_";

/// fscrypt kernel ABI version, parsed from the on-disk one-byte
/// indicator ('1' or '2')
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FscryptVersion {
    V1,
    V2,
}

impl FscryptVersion {
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            b'1' => Ok(FscryptVersion::V1),
            b'2' => Ok(FscryptVersion::V2),
            other => Err(Error::UnsupportedVersion(other)),
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            FscryptVersion::V1 => b'1',
            FscryptVersion::V2 => b'2',
        }
    }
}

/// Per-user encryption levels (key domains)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyLevel {
    /// Device-boot-available
    El1,
    /// User-credential-available (CE)
    El2,
    /// Screen-locked-still-available (ECE)
    El3,
    /// Screen-locked-unavailable (SECE)
    El4,
    /// App-locked, hardware-backed (UECE)
    El5,
}

impl KeyLevel {
    pub fn dir_name(self) -> &'static str {
        match self {
            KeyLevel::El1 => "el1",
            KeyLevel::El2 => "el2",
            KeyLevel::El3 => "el3",
            KeyLevel::El4 => "el4",
            KeyLevel::El5 => "el5",
        }
    }

    /// Levels created for every user account
    pub fn user_levels() -> [KeyLevel; 4] {
        [KeyLevel::El2, KeyLevel::El3, KeyLevel::El4, KeyLevel::El5]
    }
}

/// One persisted key generation's in-memory state.
///
/// `key` holds the raw fscrypt key only transiently; it is cleared
/// immediately after installation into the kernel.
#[derive(Default, Debug)]
pub struct KeyInfo {
    pub version: Option<FscryptVersion>,
    pub key: KeyBlob,
    /// Kernel key handle, fscrypt v1 (8-byte descriptor)
    pub key_desc: KeyBlob,
    /// Kernel key handle, fscrypt v2 (16-byte identifier)
    pub key_id: KeyBlob,
    /// Salted hash of the raw key; detects mismatch without exposing it
    pub key_hash: KeyBlob,
}

impl KeyInfo {
    pub fn clear(&mut self) {
        self.key.clear();
        self.key_desc.clear();
        self.key_id.clear();
        self.key_hash.clear();
    }
}

/// Ephemeral authentication material for one operation.
///
/// When both `token` and `secret` are non-empty the shield carries a
/// secure-access policy binding decrypts to a live token; when empty the
/// key is accessible without re-authentication (boot-time global keys).
#[derive(Default, Clone, Debug)]
pub struct UserAuth {
    /// IAM challenge-response token: secure uid (8 LE) || issue time (8 LE)
    pub token: KeyBlob,
    /// User PIN / biometric-derived secret
    pub secret: KeyBlob,
    pub secure_uid: u64,
}

impl UserAuth {
    pub fn new(token: KeyBlob, secret: KeyBlob, secure_uid: u64) -> Self {
        UserAuth {
            token,
            secret,
            secure_uid,
        }
    }

    /// Auth with a freshly issued token for `secure_uid`
    pub fn with_credentials(secret: &[u8], secure_uid: u64) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        UserAuth {
            token: token_bytes(secure_uid, now),
            secret: KeyBlob::from(secret),
            secure_uid,
        }
    }

    /// Auth whose token expired an hour ago
    #[cfg(test)]
    pub fn with_stale_token(secret: &[u8], secure_uid: u64) -> Self {
        let issued = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(3600)
            - 3600;
        UserAuth {
            token: token_bytes(secure_uid, issued),
            secret: KeyBlob::from(secret),
            secure_uid,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.token.is_empty() && self.secret.is_empty()
    }
}

fn token_bytes(secure_uid: u64, issued_secs: u64) -> KeyBlob {
    let mut token = vec![0u8; 16];
    token[..8].copy_from_slice(&secure_uid.to_le_bytes());
    token[8..].copy_from_slice(&issued_secs.to_le_bytes());
    KeyBlob::from(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fscrypt_version_tags() {
        assert_eq!(FscryptVersion::from_tag(b'1').unwrap(), FscryptVersion::V1);
        assert_eq!(FscryptVersion::from_tag(b'2').unwrap(), FscryptVersion::V2);
        assert!(FscryptVersion::from_tag(b'3').is_err());
        assert_eq!(FscryptVersion::V2.tag(), b'2');
    }

    #[test]
    fn test_user_auth_empty() {
        assert!(UserAuth::default().is_empty());
        assert!(!UserAuth::with_credentials(b"1234", 1).is_empty());
    }

    #[test]
    fn test_token_carries_uid() {
        let auth = UserAuth::with_credentials(b"1234", 0xdead_beef);
        assert_eq!(
            u64::from_le_bytes(auth.token.as_slice()[..8].try_into().unwrap()),
            0xdead_beef
        );
    }
}
