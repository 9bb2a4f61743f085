//! KeyBlob - owned key-material buffer
//!
//! The fundamental currency type for raw keys, ciphertexts, nonces and
//! tags. The backing storage is zeroed on clear and on drop so secrets
//! never survive in memory, and capacity is bounded so a corrupt length
//! field on disk cannot drive an unbounded allocation.

use crate::crypto::MAX_KEY_BLOB_SIZE;
use crate::error::{Error, Result};
use rand::RngCore;
use zeroize::Zeroize;

/// Owned, bounded byte buffer holding key material.
///
/// Invariant: `is_empty() == true` iff there is no backing storage.
/// Moving a blob out (`std::mem::take`) leaves the source empty;
/// cloning deep-copies.
#[derive(Default)]
pub struct KeyBlob {
    data: Vec<u8>,
}

impl KeyBlob {
    /// Create an empty blob with no backing storage
    pub fn new() -> Self {
        KeyBlob { data: Vec::new() }
    }

    /// Allocate a zero-filled blob of `size` bytes
    pub fn alloc(size: usize) -> Result<Self> {
        if size > MAX_KEY_BLOB_SIZE {
            return Err(Error::BlobTooLarge {
                size,
                limit: MAX_KEY_BLOB_SIZE,
            });
        }
        Ok(KeyBlob {
            data: vec![0u8; size],
        })
    }

    /// Allocate a blob filled with OS randomness.
    ///
    /// Returns an empty blob on RNG failure; callers must check
    /// `is_empty()` before trusting the result.
    pub fn random(size: usize) -> Self {
        if size == 0 || size > MAX_KEY_BLOB_SIZE {
            return KeyBlob::new();
        }
        let mut data = vec![0u8; size];
        if rand::rngs::OsRng.try_fill_bytes(&mut data).is_err() {
            data.zeroize();
            return KeyBlob::new();
        }
        KeyBlob { data }
    }

    /// Zero and release the backing storage
    pub fn clear(&mut self) {
        self.data.zeroize();
        self.data = Vec::new();
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Clone for KeyBlob {
    fn clone(&self) -> Self {
        KeyBlob {
            data: self.data.clone(),
        }
    }
}

impl Drop for KeyBlob {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

impl From<&[u8]> for KeyBlob {
    fn from(bytes: &[u8]) -> Self {
        KeyBlob {
            data: bytes.to_vec(),
        }
    }
}

impl From<Vec<u8>> for KeyBlob {
    fn from(data: Vec<u8>) -> Self {
        KeyBlob { data }
    }
}

impl AsRef<[u8]> for KeyBlob {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for KeyBlob {
    // Never print key material, only the length.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyBlob({} bytes)", self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_clear() {
        let mut blob = KeyBlob::alloc(32).unwrap();
        assert_eq!(blob.len(), 32);
        assert!(!blob.is_empty());

        blob.clear();
        assert!(blob.is_empty());
        assert_eq!(blob.len(), 0);
    }

    #[test]
    fn test_alloc_over_limit_fails() {
        assert!(KeyBlob::alloc(MAX_KEY_BLOB_SIZE).is_ok());
        assert!(KeyBlob::alloc(MAX_KEY_BLOB_SIZE + 1).is_err());
    }

    #[test]
    fn test_random_nonzero() {
        let blob = KeyBlob::random(32);
        assert_eq!(blob.len(), 32);
        // 32 random bytes are never all zero in practice
        assert!(blob.as_slice().iter().any(|&b| b != 0));
    }

    #[test]
    fn test_random_zero_len_is_empty() {
        assert!(KeyBlob::random(0).is_empty());
        assert!(KeyBlob::random(MAX_KEY_BLOB_SIZE + 1).is_empty());
    }

    #[test]
    fn test_clone_is_deep() {
        let blob = KeyBlob::from(&b"secret key material"[..]);
        let mut copy = blob.clone();
        copy.as_mut_slice()[0] ^= 0xff;
        assert_ne!(blob.as_slice()[0], copy.as_slice()[0]);
    }

    #[test]
    fn test_take_leaves_source_empty() {
        let mut blob = KeyBlob::from(&b"move me"[..]);
        let taken = std::mem::take(&mut blob);
        assert!(blob.is_empty());
        assert_eq!(taken.as_slice(), b"move me");
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut blob = KeyBlob::from(&b"twice"[..]);
        blob.clear();
        blob.clear();
        assert!(blob.is_empty());
    }
}
