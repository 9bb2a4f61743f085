//! KeyContext and on-disk composition formats
//!
//! Two bit-exact layouts are shared with every device already in the
//! field:
//!  - composed (`comb_key_ctx`/`split_key_ctx`): the `encrypted` file is
//!    `nonce(12) || rnd_enc || aad(16)`; the concatenation order is part
//!    of the contract.
//!  - simple (`comb_key_blob`/`split_key_blob`): two-part concatenation
//!    with a caller-supplied split offset.

use crate::crypto::{KeyBlob, GCM_MAC_BYTES, GCM_NONCE_BYTES};
use crate::error::{Error, Result};

/// The wire/disk state of one shielded key generation.
///
/// `rnd_enc` is only meaningful together with `shield` (the unwrap key),
/// `nonce`/`aad` (operation inputs) and `sec_discard` (derivation salt);
/// none may be used alone.
#[derive(Default, Debug)]
pub struct KeyContext {
    /// Secure-discardable salt; deleting it is a cryptographic erase
    pub sec_discard: KeyBlob,
    /// HUKS-wrapped working key, opaque outside HuksMaster
    pub shield: KeyBlob,
    /// GCM ciphertext of the raw fscrypt key
    pub rnd_enc: KeyBlob,
    /// 12-byte GCM IV for the hardware stage
    pub nonce: KeyBlob,
    /// 16-byte associated data for the hardware stage
    pub aad: KeyBlob,
}

impl KeyContext {
    /// Zero all fields
    pub fn clear(&mut self) {
        self.sec_discard.clear();
        self.shield.clear();
        self.rnd_enc.clear();
        self.nonce.clear();
        self.aad.clear();
    }
}

/// Compose the `encrypted` file contents: `nonce || rnd_enc || aad`.
///
/// Fails when any part is empty; an empty part on the encrypt path means
/// an earlier step was skipped and the output would be undecryptable.
pub fn comb_key_ctx(nonce: &KeyBlob, rnd_enc: &KeyBlob, aad: &KeyBlob) -> Result<KeyBlob> {
    if nonce.is_empty() || rnd_enc.is_empty() || aad.is_empty() {
        return Err(Error::InvalidParam(
            "empty nonce, ciphertext or aad".to_string(),
        ));
    }
    let mut out = KeyBlob::alloc(nonce.len() + rnd_enc.len() + aad.len())?;
    let buf = out.as_mut_slice();
    buf[..nonce.len()].copy_from_slice(nonce.as_slice());
    buf[nonce.len()..nonce.len() + rnd_enc.len()].copy_from_slice(rnd_enc.as_slice());
    buf[nonce.len() + rnd_enc.len()..].copy_from_slice(aad.as_slice());
    Ok(out)
}

/// Split the `encrypted` file by fixed offsets: first `GCM_NONCE_BYTES`
/// are the nonce, last `GCM_MAC_BYTES` the aad, the middle is `rnd_enc`.
pub fn split_key_ctx(encrypted: &KeyBlob, ctx: &mut KeyContext) -> Result<()> {
    if encrypted.len() <= GCM_NONCE_BYTES + GCM_MAC_BYTES {
        return Err(Error::InvalidBlobSize {
            expected: GCM_NONCE_BYTES + GCM_MAC_BYTES + 1,
            got: encrypted.len(),
        });
    }
    let buf = encrypted.as_slice();
    let enc_len = buf.len() - GCM_NONCE_BYTES - GCM_MAC_BYTES;
    ctx.nonce = KeyBlob::from(&buf[..GCM_NONCE_BYTES]);
    ctx.rnd_enc = KeyBlob::from(&buf[GCM_NONCE_BYTES..GCM_NONCE_BYTES + enc_len]);
    ctx.aad = KeyBlob::from(&buf[GCM_NONCE_BYTES + enc_len..]);
    Ok(())
}

/// Two-part concatenation with a caller-defined boundary
pub fn comb_key_blob(enc_aad: &KeyBlob, end: &KeyBlob) -> Result<KeyBlob> {
    if enc_aad.is_empty() || end.is_empty() {
        return Err(Error::InvalidParam("empty blob part".to_string()));
    }
    let mut out = KeyBlob::alloc(enc_aad.len() + end.len())?;
    out.as_mut_slice()[..enc_aad.len()].copy_from_slice(enc_aad.as_slice());
    out.as_mut_slice()[enc_aad.len()..].copy_from_slice(end.as_slice());
    Ok(out)
}

/// Inverse of [`comb_key_blob`] with the split offset supplied by the
/// caller
pub fn split_key_blob(blob: &KeyBlob, offset: usize) -> Result<(KeyBlob, KeyBlob)> {
    if offset == 0 || offset >= blob.len() {
        return Err(Error::InvalidBlobSize {
            expected: offset + 1,
            got: blob.len(),
        });
    }
    let buf = blob.as_slice();
    Ok((KeyBlob::from(&buf[..offset]), KeyBlob::from(&buf[offset..])))
}
