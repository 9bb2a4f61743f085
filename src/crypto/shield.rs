//! AES-256-GCM shield primitive
//!
//! Local re-encryption of the raw fscrypt key under a key derived from
//! the HUKS-unwrapped shield and the secure-discardable salt. Deleting
//! the salt file irrecoverably severs the shield-to-raw-key link
//! ("crypto discard"), which is what makes fast user wipe possible.

use crate::crypto::{
    KeyBlob, AES_256_HASH_RANDOM_SIZE, GCM_MAC_BYTES, GCM_NONCE_BYTES,
    HASH_PREFIX_SHIELD,
};
use crate::error::{Error, Result};
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::digest;
use zeroize::Zeroizing;

/// SHA-512(prefix || payload), viewed as `len` bytes.
///
/// `len` beyond the digest size is zero-padded; every caller in this
/// crate stays within the 64-byte digest.
pub fn hash_with_prefix(prefix: &[u8], payload: &[u8], len: usize) -> Result<KeyBlob> {
    if len == 0 {
        return Err(Error::InvalidParam("hash length is zero".to_string()));
    }
    let mut ctx = digest::Context::new(&digest::SHA512);
    ctx.update(prefix);
    ctx.update(payload);
    let digest = ctx.finish();

    let mut out = KeyBlob::alloc(len)?;
    let n = len.min(digest.as_ref().len());
    out.as_mut_slice()[..n].copy_from_slice(&digest.as_ref()[..n]);
    Ok(out)
}

/// Derive the actual AES key: SHA-512(prefix || pre_key || sec_discard)
/// truncated to 32 bytes.
fn derive_shield_key(pre_key: &KeyBlob, sec_discard: &KeyBlob) -> Result<Zeroizing<[u8; 32]>> {
    let mut ctx = digest::Context::new(&digest::SHA512);
    ctx.update(HASH_PREFIX_SHIELD);
    ctx.update(pre_key.as_slice());
    ctx.update(sec_discard.as_slice());
    let digest = ctx.finish();

    let mut key = Zeroizing::new([0u8; AES_256_HASH_RANDOM_SIZE]);
    key.copy_from_slice(&digest.as_ref()[..AES_256_HASH_RANDOM_SIZE]);
    Ok(key)
}

/// Encrypt `plain` under the derived shield key.
///
/// Output layout: `nonce(12) || ciphertext || tag(16)` in one buffer.
/// Nothing is written to the output on any failure path.
pub fn aes_encrypt(pre_key: &KeyBlob, sec_discard: &KeyBlob, plain: &KeyBlob) -> Result<KeyBlob> {
    if pre_key.is_empty() || plain.is_empty() {
        return Err(Error::InvalidParam("empty key or plaintext".to_string()));
    }

    let derived = derive_shield_key(pre_key, sec_discard)?;
    let unbound = UnboundKey::new(&AES_256_GCM, derived.as_ref())
        .map_err(|_| Error::Encryption("failed to create shield key".to_string()))?;
    let sealing_key = LessSafeKey::new(unbound);

    let mut nonce_bytes = [0u8; GCM_NONCE_BYTES];
    rand::rngs::OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .map_err(|_| Error::RandomFailed)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = plain.as_slice().to_vec();
    sealing_key
        .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| Error::Encryption("shield encryption failed".to_string()))?;

    let mut out = KeyBlob::alloc(GCM_NONCE_BYTES + in_out.len())?;
    out.as_mut_slice()[..GCM_NONCE_BYTES].copy_from_slice(&nonce_bytes);
    out.as_mut_slice()[GCM_NONCE_BYTES..].copy_from_slice(&in_out);
    Ok(out)
}

/// Decrypt a `nonce || ciphertext || tag` buffer produced by
/// [`aes_encrypt`]. Fails closed: tag mismatch or short input returns an
/// error and never partial plaintext.
pub fn aes_decrypt(pre_key: &KeyBlob, sec_discard: &KeyBlob, rnd_enc: &KeyBlob) -> Result<KeyBlob> {
    if pre_key.is_empty() {
        return Err(Error::InvalidParam("empty shield key".to_string()));
    }
    if rnd_enc.len() < GCM_NONCE_BYTES + GCM_MAC_BYTES {
        return Err(Error::Decryption(format!(
            "encrypted blob too short: {}",
            rnd_enc.len()
        )));
    }

    let derived = derive_shield_key(pre_key, sec_discard)?;
    let unbound = UnboundKey::new(&AES_256_GCM, derived.as_ref())
        .map_err(|_| Error::Decryption("failed to create shield key".to_string()))?;
    let opening_key = LessSafeKey::new(unbound);

    let mut nonce_bytes = [0u8; GCM_NONCE_BYTES];
    nonce_bytes.copy_from_slice(&rnd_enc.as_slice()[..GCM_NONCE_BYTES]);
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = rnd_enc.as_slice()[GCM_NONCE_BYTES..].to_vec();
    let plain_len = opening_key
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| Error::Decryption("tag verification failed".to_string()))?
        .len();

    let out = KeyBlob::from(&in_out[..plain_len]);
    in_out.iter_mut().for_each(|b| *b = 0);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{HASH_PREFIX_AAD, HASH_PREFIX_NONCE};

    fn salt() -> KeyBlob {
        KeyBlob::random(128)
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let pre_key = KeyBlob::random(32);
        let sec_discard = salt();
        let plain = KeyBlob::random(32);

        let enc = aes_encrypt(&pre_key, &sec_discard, &plain).unwrap();
        assert_eq!(enc.len(), GCM_NONCE_BYTES + 32 + GCM_MAC_BYTES);

        let dec = aes_decrypt(&pre_key, &sec_discard, &enc).unwrap();
        assert_eq!(dec.as_slice(), plain.as_slice());
    }

    #[test]
    fn test_wrong_pre_key_fails() {
        let sec_discard = salt();
        let plain = KeyBlob::random(32);
        let enc = aes_encrypt(&KeyBlob::random(32), &sec_discard, &plain).unwrap();
        assert!(aes_decrypt(&KeyBlob::random(32), &sec_discard, &enc).is_err());
    }

    #[test]
    fn test_wrong_salt_fails() {
        let pre_key = KeyBlob::random(32);
        let plain = KeyBlob::random(32);
        let enc = aes_encrypt(&pre_key, &salt(), &plain).unwrap();
        assert!(aes_decrypt(&pre_key, &salt(), &enc).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let pre_key = KeyBlob::random(32);
        let sec_discard = salt();
        let plain = KeyBlob::random(32);

        let mut enc = aes_encrypt(&pre_key, &sec_discard, &plain).unwrap();
        let last = enc.len() - 1;
        enc.as_mut_slice()[last] ^= 0xff;
        assert!(aes_decrypt(&pre_key, &sec_discard, &enc).is_err());
    }

    #[test]
    fn test_truncated_input_fails() {
        let pre_key = KeyBlob::random(32);
        let short = KeyBlob::alloc(GCM_NONCE_BYTES + GCM_MAC_BYTES - 1).unwrap();
        assert!(aes_decrypt(&pre_key, &salt(), &short).is_err());
    }

    #[test]
    fn test_empty_inputs_rejected() {
        let pre_key = KeyBlob::random(32);
        let sec_discard = salt();
        assert!(aes_encrypt(&KeyBlob::new(), &sec_discard, &pre_key).is_err());
        assert!(aes_encrypt(&pre_key, &sec_discard, &KeyBlob::new()).is_err());
    }

    #[test]
    fn test_hash_with_prefix_domain_separation() {
        let payload = b"same payload";
        let a = hash_with_prefix(HASH_PREFIX_NONCE, payload, 16).unwrap();
        let b = hash_with_prefix(HASH_PREFIX_AAD, payload, 16).unwrap();
        assert_ne!(a.as_slice(), b.as_slice());
    }

    #[test]
    fn test_hash_with_prefix_deterministic() {
        let a = hash_with_prefix(HASH_PREFIX_NONCE, b"salt", 12).unwrap();
        let b = hash_with_prefix(HASH_PREFIX_NONCE, b"salt", 12).unwrap();
        assert_eq!(a.as_slice(), b.as_slice());
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn test_hash_zero_len_rejected() {
        assert!(hash_with_prefix(HASH_PREFIX_NONCE, b"x", 0).is_err());
    }
}
