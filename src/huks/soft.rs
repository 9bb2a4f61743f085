//! Software HDI backend
//!
//! Implements the [`HuksHdi`] contract in software: wrapped key blobs
//! are AES-256-GCM sealed under a root key held in a file (or in memory
//! for tests). Used when the vendor HDI service is absent and by every
//! crypto test in this crate. The blob format carries a version tag so
//! the upgrade path is exercised for real.

use crate::error::{Error, Result};
use crate::huks::param::*;
use crate::huks::{
    HdiResult, HuksHdi, HKS_ERROR_CRYPTO_ENGINE_ERROR, HKS_ERROR_INVALID_KEY_INFO,
    HKS_ERROR_KEY_AUTH_FAILED, HKS_ERROR_KEY_AUTH_TIME_OUT, HKS_ERROR_NOT_SUPPORTED, HKS_SUCCESS,
};
use parking_lot::Mutex;
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::{Zeroize, Zeroizing};

const BLOB_MAGIC: &[u8; 4] = b"SHKS";
const BLOB_VERSION: u32 = 3;
const WORKING_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
// magic(4) + version(4) + flags(1) + uid(8)
const HEADER_LEN: usize = 17;
const FLAG_AUTH_REQUIRED: u8 = 0x01;

/// Auth token layout the soft backend verifies: uid(8 LE) || unix_secs(8 LE)
const TOKEN_LEN: usize = 16;

struct SoftSession {
    working_key: Zeroizing<[u8; WORKING_KEY_LEN]>,
    purpose: u32,
    auth_required: bool,
    secure_uid: u64,
}

pub struct SoftHuksHdi {
    root_key: Zeroizing<[u8; 32]>,
    sessions: Mutex<HashMap<u64, SoftSession>>,
    next_handle: AtomicU64,
}

impl SoftHuksHdi {
    /// In-memory root key; every instance is its own universe
    pub fn ephemeral() -> Self {
        let mut root = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(root.as_mut());
        SoftHuksHdi {
            root_key: root,
            sessions: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Root key persisted at `path` (0600), created on first use
    pub fn from_root_file(path: &Path) -> Result<Self> {
        let mut root = Zeroizing::new([0u8; 32]);
        match fs::read(path) {
            Ok(bytes) if bytes.len() == 32 => {
                root.copy_from_slice(&bytes);
            }
            Ok(_) => {
                return Err(Error::Internal(format!(
                    "bad soft-HUKS root key at {}",
                    path.display()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                rand::rngs::OsRng.fill_bytes(root.as_mut());
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                    fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
                }
                let mut f = fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(path)?;
                f.write_all(root.as_ref())?;
                f.sync_all()?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(SoftHuksHdi {
            root_key: root,
            sessions: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    fn root_cipher(&self) -> HdiResult<LessSafeKey> {
        UnboundKey::new(&AES_256_GCM, self.root_key.as_ref())
            .map(LessSafeKey::new)
            .map_err(|_| HKS_ERROR_CRYPTO_ENGINE_ERROR)
    }

    fn wrap(
        &self,
        working_key: &[u8; WORKING_KEY_LEN],
        version: u32,
        flags: u8,
        secure_uid: u64,
    ) -> HdiResult<Vec<u8>> {
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(BLOB_MAGIC);
        header.extend_from_slice(&version.to_le_bytes());
        header.push(flags);
        header.extend_from_slice(&secure_uid.to_le_bytes());

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .map_err(|_| HKS_ERROR_CRYPTO_ENGINE_ERROR)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = working_key.to_vec();
        self.root_cipher()?
            .seal_in_place_append_tag(nonce, Aad::from(&header), &mut in_out)
            .map_err(|_| HKS_ERROR_CRYPTO_ENGINE_ERROR)?;

        let mut blob = header;
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&in_out);
        Ok(blob)
    }

    fn unwrap(&self, blob: &[u8]) -> HdiResult<(Zeroizing<[u8; WORKING_KEY_LEN]>, u32, u8, u64)> {
        if blob.len() != HEADER_LEN + NONCE_LEN + WORKING_KEY_LEN + TAG_LEN
            || &blob[..4] != BLOB_MAGIC
        {
            return Err(HKS_ERROR_INVALID_KEY_INFO);
        }
        let header = &blob[..HEADER_LEN];
        let version = u32::from_le_bytes(blob[4..8].try_into().unwrap());
        let flags = blob[8];
        let secure_uid = u64::from_le_bytes(blob[9..HEADER_LEN].try_into().unwrap());

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&blob[HEADER_LEN..HEADER_LEN + NONCE_LEN]);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = blob[HEADER_LEN + NONCE_LEN..].to_vec();
        let plain_len = self
            .root_cipher()?
            .open_in_place(nonce, Aad::from(&header), &mut in_out)
            .map_err(|_| HKS_ERROR_INVALID_KEY_INFO)?
            .len();
        if plain_len != WORKING_KEY_LEN {
            in_out.zeroize();
            return Err(HKS_ERROR_INVALID_KEY_INFO);
        }

        let mut key = Zeroizing::new([0u8; WORKING_KEY_LEN]);
        key.copy_from_slice(&in_out[..WORKING_KEY_LEN]);
        in_out.zeroize();
        Ok((key, version, flags, secure_uid))
    }

    fn check_auth(&self, session: &SoftSession, params: &HksParamSet) -> i32 {
        if !session.auth_required {
            return HKS_SUCCESS;
        }
        let token = match params.get_bytes(HKS_TAG_AUTH_TOKEN) {
            Some(t) if t.len() == TOKEN_LEN => t,
            _ => return HKS_ERROR_KEY_AUTH_FAILED,
        };
        let uid = u64::from_le_bytes(token[..8].try_into().unwrap());
        if uid != session.secure_uid {
            return HKS_ERROR_KEY_AUTH_FAILED;
        }
        let issued = u64::from_le_bytes(token[8..].try_into().unwrap());
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if now.saturating_sub(issued) > u64::from(HKS_AUTH_TIMEOUT_SECS) {
            return HKS_ERROR_KEY_AUTH_TIME_OUT;
        }
        HKS_SUCCESS
    }

    /// Re-wrap a blob one version older than it is, to exercise the
    /// upgrade path
    #[cfg(test)]
    pub fn downgrade_for_test(&self, blob: &[u8]) -> Vec<u8> {
        let (key, version, flags, uid) = self.unwrap(blob).unwrap();
        self.wrap(&key, version - 1, flags, uid).unwrap()
    }
}

impl HuksHdi for SoftHuksHdi {
    fn module_init(&self) -> i32 {
        HKS_SUCCESS
    }

    fn module_destroy(&self) -> i32 {
        self.sessions.lock().clear();
        HKS_SUCCESS
    }

    fn generate_key(&self, params: &HksParamSet) -> HdiResult<Vec<u8>> {
        if params.get_uint(HKS_TAG_ALGORITHM) != Some(HKS_ALG_AES)
            || params.get_uint(HKS_TAG_KEY_SIZE) != Some(HKS_AES_KEY_SIZE_256)
        {
            return Err(HKS_ERROR_NOT_SUPPORTED);
        }
        let mut working = [0u8; WORKING_KEY_LEN];
        rand::rngs::OsRng
            .try_fill_bytes(&mut working)
            .map_err(|_| HKS_ERROR_CRYPTO_ENGINE_ERROR)?;

        let auth_required = params.get_uint(HKS_TAG_USER_AUTH_TYPE).is_some();
        let secure_uid = params.get_ulong(HKS_TAG_USER_AUTH_SECURE_UID).unwrap_or(0);
        let flags = if auth_required { FLAG_AUTH_REQUIRED } else { 0 };

        let blob = self.wrap(&working, BLOB_VERSION, flags, secure_uid);
        working.zeroize();
        blob
    }

    fn init_session(&self, key: &[u8], params: &HksParamSet) -> HdiResult<u64> {
        let purpose = params
            .get_uint(HKS_TAG_PURPOSE)
            .ok_or(HKS_ERROR_NOT_SUPPORTED)?;
        let (working_key, _version, flags, secure_uid) = self.unwrap(key)?;

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().insert(
            handle,
            SoftSession {
                working_key,
                purpose,
                auth_required: flags & FLAG_AUTH_REQUIRED != 0,
                secure_uid,
            },
        );
        Ok(handle)
    }

    fn finish_session(
        &self,
        handle: u64,
        params: &HksParamSet,
        input: &[u8],
    ) -> HdiResult<Vec<u8>> {
        let session = self
            .sessions
            .lock()
            .remove(&handle)
            .ok_or(HKS_ERROR_INVALID_KEY_INFO)?;

        // Auth is enforced at finish time; an expired window surfaces
        // here, not at init.
        let auth = self.check_auth(&session, params);
        if auth != HKS_SUCCESS {
            return Err(auth);
        }

        let nonce_bytes = params
            .get_bytes(HKS_TAG_NONCE)
            .filter(|n| n.len() == NONCE_LEN)
            .ok_or(HKS_ERROR_NOT_SUPPORTED)?;
        let aad = params.get_bytes(HKS_TAG_ASSOCIATED_DATA).unwrap_or(&[]);

        let cipher = UnboundKey::new(&AES_256_GCM, session.working_key.as_ref())
            .map(LessSafeKey::new)
            .map_err(|_| HKS_ERROR_CRYPTO_ENGINE_ERROR)?;
        let mut nonce_arr = [0u8; NONCE_LEN];
        nonce_arr.copy_from_slice(nonce_bytes);
        let nonce = Nonce::assume_unique_for_key(nonce_arr);

        match session.purpose {
            HKS_KEY_PURPOSE_ENCRYPT => {
                let mut in_out = input.to_vec();
                cipher
                    .seal_in_place_append_tag(nonce, Aad::from(aad), &mut in_out)
                    .map_err(|_| HKS_ERROR_CRYPTO_ENGINE_ERROR)?;
                Ok(in_out)
            }
            HKS_KEY_PURPOSE_DECRYPT => {
                if input.len() < TAG_LEN {
                    return Err(HKS_ERROR_INVALID_KEY_INFO);
                }
                let mut in_out = input.to_vec();
                let plain_len = cipher
                    .open_in_place(nonce, Aad::from(aad), &mut in_out)
                    .map_err(|_| HKS_ERROR_CRYPTO_ENGINE_ERROR)?
                    .len();
                in_out.truncate(plain_len);
                Ok(in_out)
            }
            _ => Err(HKS_ERROR_NOT_SUPPORTED),
        }
    }

    fn upgrade_key(&self, old_key: &[u8], params: &HksParamSet) -> HdiResult<Vec<u8>> {
        let (working_key, _version, flags, secure_uid) = self.unwrap(old_key)?;
        let target = params
            .get_uint(HKS_TAG_KEY_VERSION)
            .unwrap_or(BLOB_VERSION);
        self.wrap(&working_key, target, flags, secure_uid)
    }

    fn key_version(&self, key: &[u8]) -> HdiResult<u32> {
        if key.len() < 8 || &key[..4] != BLOB_MAGIC {
            return Err(HKS_ERROR_INVALID_KEY_INFO);
        }
        Ok(u32::from_le_bytes(key[4..8].try_into().unwrap()))
    }

    fn current_version(&self) -> u32 {
        BLOB_VERSION
    }

    fn generate_random(&self, len: usize) -> HdiResult<Vec<u8>> {
        let mut bytes = vec![0u8; len];
        rand::rngs::OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|_| HKS_ERROR_CRYPTO_ENGINE_ERROR)?;
        Ok(bytes)
    }
}
