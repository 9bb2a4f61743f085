//! Cryptography module for fbekeyd
//!
//! Provides the key-material buffer type, the AES-256-GCM shield
//! primitive, and the on-disk key-context composition formats.
//! Every size constant below is a wire or kernel ABI contract shared
//! with already-encrypted user data; changing one bricks devices.

mod blob;
mod context;
mod shield;

pub use blob::KeyBlob;
pub use context::{
    comb_key_blob, comb_key_ctx, split_key_blob, split_key_ctx, KeyContext,
};
pub use shield::{aes_decrypt, aes_encrypt, hash_with_prefix};

/// Size of AES-256 key in bytes
pub const AES_256_HASH_RANDOM_SIZE: usize = 32;

/// Size of GCM nonce in bytes
pub const GCM_NONCE_BYTES: usize = 12;

/// Size of GCM authentication tag in bytes
pub const GCM_MAC_BYTES: usize = 16;

/// Raw fscrypt AES-256-XTS key size
pub const CRYPTO_AES_256_XTS_KEY_SIZE: usize = 64;

/// Allocation size for the encrypted raw-key buffer
pub const CRYPTO_AES_256_KEY_ENCRYPTED_SIZE: usize = 80;

/// Size of the secure-discardable salt file
pub const CRYPTO_KEY_SECDISC_SIZE: usize = 16384;

/// Upper bound on any single key-material buffer
pub const MAX_KEY_BLOB_SIZE: usize = 16384;

/// fscrypt v1 kernel key descriptor size
pub const FSCRYPT_KEY_DESCRIPTOR_SIZE: usize = 8;

/// fscrypt v2 kernel key identifier size
pub const FSCRYPT_KEY_IDENTIFIER_SIZE: usize = 16;

/// Domain-separation prefixes for hash_with_prefix. Distinct per purpose
/// so the same sec_discard salt never derives colliding material.
pub const HASH_PREFIX_SHIELD: &[u8] = b"fbekeyd shield aes key sha512:";
pub const HASH_PREFIX_NONCE: &[u8] = b"fbekeyd nonce sha512:";
pub const HASH_PREFIX_AAD: &[u8] = b"fbekeyd aad sha512:";
pub const HASH_PREFIX_KEY_HASH: &[u8] = b"fbekeyd key hash sha512:";
