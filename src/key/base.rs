//! BaseKey - key lifecycle and on-disk versioning
//!
//! One BaseKey owns one (user, encryption-level) key directory:
//!
//! ```text
//! <base>/<el>/<userId>/
//!     version_0/ ... version_N/    numbered generations
//!     latest/                      current generation
//!     latest_bak/                  transient during promotion
//!     fscrypt_version              one ASCII byte, '1' or '2'
//!     key_id / key_desc            kernel handle (ABI-dependent)
//!     key_hash                     engine IV identity
//! ```
//!
//! The kernel handle and engine identity sit beside the generation dirs,
//! not inside them: they belong to the raw key, which outlives any one
//! generation, and rotation deletes superseded generation dirs wholesale.
//!
//! Each generation holds `shield`, `sec_discard` and `encrypted`.
//! Promotion is rename-based and ordered so that at every intermediate
//! step at least one of {latest, latest_bak, version_N} is a complete,
//! decryptable generation.
//!
//! BaseKey does no internal locking; callers (KeyManager) serialize
//! operations on the same key. Concurrent store/update/restore on one
//! directory is not safe.

use crate::crypto::{
    aes_decrypt, aes_encrypt, comb_key_blob, comb_key_ctx, hash_with_prefix, split_key_blob,
    split_key_ctx, KeyBlob, KeyContext, AES_256_HASH_RANDOM_SIZE,
    CRYPTO_AES_256_KEY_ENCRYPTED_SIZE, CRYPTO_AES_256_XTS_KEY_SIZE, CRYPTO_KEY_SECDISC_SIZE,
    GCM_MAC_BYTES, GCM_NONCE_BYTES, HASH_PREFIX_AAD, HASH_PREFIX_KEY_HASH, HASH_PREFIX_NONCE,
};
use crate::error::{Error, Result};
use crate::huks::HuksMaster;
use crate::key::{
    FscryptVersion, KeyInfo, UserAuth, PATH_ENCRYPTED, PATH_FSCRYPT_VERSION, PATH_LATEST,
    PATH_LATEST_BAK, PATH_SECDISC, PATH_SHIELD, VERSION_PREFIX,
};
use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct BaseKey {
    pub(crate) dir: PathBuf,
    pub(crate) huks: Arc<HuksMaster>,
    pub key_info: KeyInfo,
}

impl BaseKey {
    pub fn new(dir: PathBuf, huks: Arc<HuksMaster>) -> Self {
        BaseKey {
            dir,
            huks,
            key_info: KeyInfo::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether any stored generation exists on disk
    pub fn is_stored(&self) -> bool {
        self.dir.join(PATH_LATEST).is_dir() || !self.candidate_indices().is_empty()
    }

    /// Load the on-disk version indicator or synthesize a fresh raw key.
    ///
    /// Fails if a raw key is already present; an accidental re-init must
    /// not overwrite live key material.
    pub fn init_key(&mut self, need_generate_key: bool) -> Result<()> {
        if !self.key_info.key.is_empty() {
            return Err(Error::KeyAlreadyInitialized);
        }
        if let Some(version) = self.load_version_file()? {
            self.key_info.version = Some(version);
        }
        if need_generate_key {
            let key = self
                .huks
                .generate_random_key(CRYPTO_AES_256_XTS_KEY_SIZE);
            if key.is_empty() {
                return Err(Error::RandomFailed);
            }
            self.key_info.key_hash =
                hash_with_prefix(HASH_PREFIX_KEY_HASH, key.as_slice(), AES_256_HASH_RANDOM_SIZE)?;
            self.key_info.key = key;
        }
        Ok(())
    }

    /// Persist the raw key as a new numbered generation
    pub fn store_key(&mut self, auth: &UserAuth) -> Result<()> {
        self.store_key_with_shield(auth, true)
    }

    /// `need_generate_shield == false` reuses the generation's existing
    /// shield and the salt-derived nonce (legacy re-encrypt path)
    pub fn store_key_with_shield(&mut self, auth: &UserAuth, need_generate_shield: bool) -> Result<()> {
        if self.key_info.key.is_empty() {
            return Err(Error::InvalidParam("no raw key to store".to_string()));
        }
        self.do_store_key(auth, need_generate_shield)
    }

    fn do_store_key(&mut self, auth: &UserAuth, need_generate_shield: bool) -> Result<()> {
        let (candidate, index) = self.get_next_candidate_dir();
        fs::create_dir_all(&candidate)?;

        // An incomplete candidate must not survive to be picked up by a
        // later restore, whichever step failed.
        if let Err(e) = self.fill_candidate(auth, &candidate, need_generate_shield) {
            let _ = fs::remove_dir_all(&candidate);
            return Err(e);
        }
        info!(dir = %self.dir.display(), index, "stored key generation");
        Ok(())
    }

    fn fill_candidate(
        &mut self,
        auth: &UserAuth,
        candidate: &Path,
        need_generate_shield: bool,
    ) -> Result<()> {
        fs::set_permissions(candidate, fs::Permissions::from_mode(0o700))?;
        self.save_version_file()?;

        let key = std::mem::take(&mut self.key_info.key);
        let result = self.encrypt_key_blob(auth, candidate, &key, need_generate_shield);
        self.key_info.key = key;
        let encrypted = result?;

        write_file(&candidate.join(PATH_ENCRYPTED), encrypted.as_slice())?;
        sync_dir(candidate)?;
        // The parent must durably reference the new generation before
        // anyone is told the store succeeded.
        sync_dir(&self.dir)
    }

    /// Promote the newest complete generation to `latest`.
    ///
    /// Order is load-bearing: back up the current `latest` before the
    /// candidate rename, never after.
    pub fn update_key(&mut self) -> Result<()> {
        let indices = self.candidate_indices();
        let Some(&newest) = indices.last() else {
            return Err(Error::NoCandidate);
        };
        let candidate = self.dir.join(format!("{}{}", VERSION_PREFIX, newest));
        self.promote_candidate(&candidate)?;
        self.cleanup_old_generations();
        Ok(())
    }

    fn promote_candidate(&self, candidate: &Path) -> Result<()> {
        let latest = self.dir.join(PATH_LATEST);
        let bak = self.dir.join(PATH_LATEST_BAK);

        // A stale backup from an interrupted promotion can go now; the
        // candidate being promoted is complete.
        if bak.is_dir() {
            if let Err(e) = fs::remove_dir_all(&bak) {
                warn!(error = %e, "failed to drop stale latest_bak");
            }
        }
        if latest.is_dir() {
            fs::rename(&latest, &bak)?;
        }
        fs::rename(candidate, &latest)?;
        sync_dir(&self.dir)?;
        debug!(dir = %self.dir.display(), "promoted candidate to latest");
        Ok(())
    }

    /// Best-effort removal of superseded generations and the backup
    fn cleanup_old_generations(&self) {
        for index in self.candidate_indices() {
            let dir = self.dir.join(format!("{}{}", VERSION_PREFIX, index));
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!(dir = %dir.display(), error = %e, "failed to remove old generation");
            }
        }
        let bak = self.dir.join(PATH_LATEST_BAK);
        if bak.is_dir() {
            if let Err(e) = fs::remove_dir_all(&bak) {
                warn!(error = %e, "failed to remove latest_bak");
            }
        }
        let _ = sync_dir(&self.dir);
    }

    /// Authenticated load: `latest` first, then candidates newest-first,
    /// then the transient backup. Only exhaustion of every generation is
    /// the restore-failed outcome; auth-class failures keep their class.
    pub fn restore_key(&mut self, auth: &UserAuth, need_sync_candidate: bool) -> Result<()> {
        if let Some(version) = self.load_version_file()? {
            match self.key_info.version {
                Some(expected) if expected != version => {
                    return Err(Error::VersionMismatch {
                        expected: expected.tag(),
                        got: version.tag(),
                    });
                }
                _ => self.key_info.version = Some(version),
            }
        }

        let latest = self.dir.join(PATH_LATEST);
        let mut auth_failure: Option<Error> = None;
        match self.decrypt_generation(auth, &latest) {
            Ok(key) => {
                self.adopt_key(key)?;
                return Ok(());
            }
            Err(e) => {
                debug!(error = %e, "latest generation did not decrypt");
                if e.is_auth_error() {
                    auth_failure = Some(e);
                }
            }
        }

        let mut fallbacks: Vec<PathBuf> = self
            .candidate_indices()
            .into_iter()
            .rev()
            .map(|i| self.dir.join(format!("{}{}", VERSION_PREFIX, i)))
            .collect();
        fallbacks.push(self.dir.join(PATH_LATEST_BAK));

        for gen_dir in fallbacks {
            match self.decrypt_generation(auth, &gen_dir) {
                Ok(key) => {
                    info!(dir = %gen_dir.display(), "restored from fallback generation");
                    if need_sync_candidate && gen_dir.file_name().is_some_and(|n| {
                        n.to_string_lossy().starts_with(VERSION_PREFIX)
                    }) {
                        if let Err(e) = self.promote_candidate(&gen_dir) {
                            warn!(error = %e, "failed to promote restored candidate");
                        } else {
                            self.cleanup_old_generations();
                        }
                    }
                    self.adopt_key(key)?;
                    return Ok(());
                }
                Err(e) => {
                    debug!(dir = %gen_dir.display(), error = %e, "fallback generation failed");
                    if e.is_auth_error() {
                        auth_failure = Some(e);
                    }
                }
            }
        }

        // Wrong credentials must surface as such, not as corruption.
        match auth_failure {
            Some(e) => Err(e),
            None => Err(Error::RestoreKeyFailed),
        }
    }

    fn decrypt_generation(&self, auth: &UserAuth, gen_dir: &Path) -> Result<KeyBlob> {
        if !gen_dir.is_dir() {
            return Err(Error::KeyFileMissing(gen_dir.display().to_string()));
        }
        let key = self.decrypt_key_blob(auth, gen_dir)?;
        if key.len() != CRYPTO_AES_256_XTS_KEY_SIZE {
            return Err(Error::Decryption(format!(
                "decrypted key length mismatch: {}",
                key.len()
            )));
        }
        Ok(key)
    }

    fn adopt_key(&mut self, key: KeyBlob) -> Result<()> {
        self.key_info.key_hash =
            hash_with_prefix(HASH_PREFIX_KEY_HASH, key.as_slice(), AES_256_HASH_RANDOM_SIZE)?;
        self.key_info.key = key;
        Ok(())
    }

    /// Zero in-memory key material and best-effort delete the directory
    /// tree. Idempotent; partial I/O failure is logged, never fatal, so
    /// user deletion always completes.
    pub fn clear_key(&mut self) {
        self.key_info.clear();
        if self.dir.exists() {
            if let Err(e) = fs::remove_dir_all(&self.dir) {
                error!(dir = %self.dir.display(), error = %e, "failed to remove key directory");
            }
        }
    }

    /// Opportunistically re-wrap stale shields across all stored
    /// generations. Already-current shields are untouched.
    pub fn upgrade_keys(&self) {
        let mut dirs: Vec<PathBuf> = vec![self.dir.join(PATH_LATEST)];
        dirs.extend(
            self.candidate_indices()
                .into_iter()
                .map(|i| self.dir.join(format!("{}{}", VERSION_PREFIX, i))),
        );
        for gen_dir in dirs.into_iter().filter(|d| d.is_dir()) {
            let shield_path = gen_dir.join(PATH_SHIELD);
            let mut ctx = KeyContext::default();
            ctx.shield = match read_file(&shield_path) {
                Ok(blob) => blob,
                Err(e) => {
                    warn!(path = %shield_path.display(), error = %e, "skipping shield upgrade");
                    continue;
                }
            };
            match self.huks.upgrade_key(&mut ctx) {
                Ok(true) => {
                    if let Err(e) = write_file(&shield_path, ctx.shield.as_slice())
                        .and_then(|_| sync_dir(&gen_dir))
                    {
                        error!(path = %shield_path.display(), error = %e, "failed to persist upgraded shield");
                    } else {
                        info!(path = %shield_path.display(), "shield upgraded");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(path = %shield_path.display(), error = %e, "shield upgrade failed"),
            }
        }
    }

    /// Shield the raw key into the composed on-disk blob, creating the
    /// generation's `shield` and `sec_discard` files as needed.
    ///
    /// Two-stage wrap. The hardware stage GCM-encrypts a transient
    /// 32-byte pre-key under the shield (this is the auth-gated stage);
    /// the local stage GCM-encrypts the raw key under
    /// SHA-512(pre_key || sec_discard). Both halves land in `rnd_enc`:
    ///
    /// ```text
    /// encrypted = nonce(12) || huks(pre_key)(48) || aes(raw_key)(92) || aad(16)
    /// ```
    ///
    /// Losing `sec_discard` severs the local derivation; losing the
    /// shield severs the hardware stage. Either alone is a crypto erase.
    pub(crate) fn encrypt_key_blob(
        &self,
        auth: &UserAuth,
        gen_dir: &Path,
        plain_key: &KeyBlob,
        need_generate_shield: bool,
    ) -> Result<KeyBlob> {
        let mut ctx = KeyContext::default();
        self.load_and_save_shield(auth, gen_dir, need_generate_shield, &mut ctx)?;
        self.load_and_save_secdisc(gen_dir, &mut ctx)?;

        ctx.aad = hash_with_prefix(HASH_PREFIX_AAD, ctx.sec_discard.as_slice(), GCM_MAC_BYTES)?;
        let is_need_new_nonce = need_generate_shield;
        if !is_need_new_nonce {
            ctx.nonce =
                hash_with_prefix(HASH_PREFIX_NONCE, ctx.sec_discard.as_slice(), GCM_NONCE_BYTES)?;
        }

        let pre_key = KeyBlob::random(AES_256_HASH_RANDOM_SIZE);
        if pre_key.is_empty() {
            return Err(Error::RandomFailed);
        }
        let pre_enc = self
            .huks
            .encrypt_key(&mut ctx, auth, &pre_key, is_need_new_nonce)?;
        if pre_enc.len() != AES_256_HASH_RANDOM_SIZE + GCM_MAC_BYTES {
            return Err(Error::Encryption(format!(
                "unexpected pre-key wrap size: {}",
                pre_enc.len()
            )));
        }

        let local_enc = aes_encrypt(&pre_key, &ctx.sec_discard, plain_key)?;
        if local_enc.len() != GCM_NONCE_BYTES + CRYPTO_AES_256_KEY_ENCRYPTED_SIZE {
            return Err(Error::Encryption(format!(
                "unexpected wrapped key size: {}",
                local_enc.len()
            )));
        }
        ctx.rnd_enc = comb_key_blob(&pre_enc, &local_enc)?;
        comb_key_ctx(&ctx.nonce, &ctx.rnd_enc, &ctx.aad)
    }

    /// Inverse of [`Self::encrypt_key_blob`]: the auth-gated hardware
    /// decrypt recovers the transient pre-key, then the local unwrap
    /// yields the raw key. Missing files, size mismatches and tag
    /// failures are reported, never treated as "key absent".
    pub(crate) fn decrypt_key_blob(&self, auth: &UserAuth, gen_dir: &Path) -> Result<KeyBlob> {
        let mut ctx = KeyContext::default();
        ctx.shield = read_file(&gen_dir.join(PATH_SHIELD))?;
        ctx.sec_discard = read_file(&gen_dir.join(PATH_SECDISC))?;
        let encrypted = read_file(&gen_dir.join(PATH_ENCRYPTED))?;

        split_key_ctx(&encrypted, &mut ctx)?;
        let (pre_enc, local_enc) =
            split_key_blob(&ctx.rnd_enc, AES_256_HASH_RANDOM_SIZE + GCM_MAC_BYTES)?;
        let pre_key = self.huks.decrypt_key(&ctx, auth, &pre_enc)?;
        aes_decrypt(&pre_key, &ctx.sec_discard, &local_enc)
    }

    fn load_and_save_shield(
        &self,
        auth: &UserAuth,
        gen_dir: &Path,
        need_generate_shield: bool,
        ctx: &mut KeyContext,
    ) -> Result<()> {
        let shield_path = gen_dir.join(PATH_SHIELD);
        if !need_generate_shield && shield_path.is_file() {
            ctx.shield = read_file(&shield_path)?;
            return Ok(());
        }
        ctx.shield = self.huks.generate_key(auth)?;
        write_file(&shield_path, ctx.shield.as_slice())
    }

    fn load_and_save_secdisc(&self, gen_dir: &Path, ctx: &mut KeyContext) -> Result<()> {
        let secdisc_path = gen_dir.join(PATH_SECDISC);
        if secdisc_path.is_file() {
            ctx.sec_discard = read_file(&secdisc_path)?;
            if ctx.sec_discard.len() != CRYPTO_KEY_SECDISC_SIZE {
                return Err(Error::InvalidBlobSize {
                    expected: CRYPTO_KEY_SECDISC_SIZE,
                    got: ctx.sec_discard.len(),
                });
            }
            return Ok(());
        }
        ctx.sec_discard = KeyBlob::random(CRYPTO_KEY_SECDISC_SIZE);
        if ctx.sec_discard.is_empty() {
            return Err(Error::RandomFailed);
        }
        write_file(&secdisc_path, ctx.sec_discard.as_slice())
    }

    fn load_version_file(&self) -> Result<Option<FscryptVersion>> {
        let path = self.dir.join(PATH_FSCRYPT_VERSION);
        match fs::read(&path) {
            Ok(bytes) if bytes.len() == 1 => Ok(Some(FscryptVersion::from_tag(bytes[0])?)),
            Ok(bytes) => Err(Error::InvalidBlobSize {
                expected: 1,
                got: bytes.len(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save_version_file(&self) -> Result<()> {
        let path = self.dir.join(PATH_FSCRYPT_VERSION);
        if path.is_file() {
            return Ok(());
        }
        let tag = self.key_info.version.unwrap_or(FscryptVersion::V2).tag();
        write_file(&path, &[tag])
    }

    /// Existing generation indices, ascending
    fn candidate_indices(&self) -> Vec<u32> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut indices: Vec<u32> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                e.file_name()
                    .to_str()
                    .and_then(|name| name.strip_prefix(VERSION_PREFIX).map(str::to_owned))
            })
            .filter_map(|suffix| suffix.parse().ok())
            .collect();
        indices.sort_unstable();
        indices
    }

    fn get_next_candidate_dir(&self) -> (PathBuf, u32) {
        let next = self
            .candidate_indices()
            .last()
            .map(|&i| i + 1)
            .unwrap_or(0);
        (self.dir.join(format!("{}{}", VERSION_PREFIX, next)), next)
    }
}

pub(crate) fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

pub(crate) fn read_file(path: &Path) -> Result<KeyBlob> {
    match fs::read(path) {
        Ok(bytes) => Ok(KeyBlob::from(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::KeyFileMissing(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// fsync a directory so renames and new entries are durable
pub(crate) fn sync_dir(path: &Path) -> Result<()> {
    fs::File::open(path)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::huks::{HuksHdi, SoftHuksHdi};
    use tempfile::TempDir;

    fn huks() -> Arc<HuksMaster> {
        Arc::new(HuksMaster::new(Arc::new(SoftHuksHdi::ephemeral())))
    }

    fn new_key(tmp: &TempDir, huks: &Arc<HuksMaster>) -> BaseKey {
        let dir = tmp.path().join("el2").join("100");
        fs::create_dir_all(&dir).unwrap();
        BaseKey::new(dir, huks.clone())
    }

    fn stored_key(tmp: &TempDir, huks: &Arc<HuksMaster>, auth: &UserAuth) -> (BaseKey, KeyBlob) {
        let mut key = new_key(tmp, huks);
        key.init_key(true).unwrap();
        let raw = key.key_info.key.clone();
        key.store_key(auth).unwrap();
        (key, raw)
    }

    #[test]
    fn test_init_key_generates_raw_key() {
        let tmp = TempDir::new().unwrap();
        let mut key = new_key(&tmp, &huks());
        key.init_key(true).unwrap();
        assert_eq!(key.key_info.key.len(), CRYPTO_AES_256_XTS_KEY_SIZE);
        assert!(!key.key_info.key_hash.is_empty());
    }

    #[test]
    fn test_init_key_twice_fails() {
        let tmp = TempDir::new().unwrap();
        let mut key = new_key(&tmp, &huks());
        key.init_key(true).unwrap();
        assert!(matches!(
            key.init_key(true),
            Err(Error::KeyAlreadyInitialized)
        ));
    }

    #[test]
    fn test_store_creates_numbered_generation() {
        let tmp = TempDir::new().unwrap();
        let (key, _) = stored_key(&tmp, &huks(), &UserAuth::default());

        let gen = key.dir().join("version_0");
        assert!(gen.join(PATH_SHIELD).is_file());
        assert!(gen.join(PATH_SECDISC).is_file());
        assert!(gen.join(PATH_ENCRYPTED).is_file());
        assert_eq!(
            fs::read(key.dir().join(PATH_FSCRYPT_VERSION)).unwrap(),
            b"2"
        );
        assert_eq!(
            fs::metadata(gen.join(PATH_ENCRYPTED)).unwrap().permissions().mode() & 0o777,
            0o600
        );
        assert_eq!(
            fs::metadata(&gen).unwrap().permissions().mode() & 0o777,
            0o700
        );
    }

    #[test]
    fn test_store_twice_never_mutates_existing_generation() {
        let tmp = TempDir::new().unwrap();
        let (mut key, _) = stored_key(&tmp, &huks(), &UserAuth::default());
        let first = fs::read(key.dir().join("version_0").join(PATH_ENCRYPTED)).unwrap();

        key.store_key(&UserAuth::default()).unwrap();
        assert!(key.dir().join("version_1").is_dir());
        assert_eq!(
            fs::read(key.dir().join("version_0").join(PATH_ENCRYPTED)).unwrap(),
            first
        );
    }

    #[test]
    fn test_update_promotes_newest_and_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let h = huks();
        let (mut key, _) = stored_key(&tmp, &h, &UserAuth::default());
        key.store_key(&UserAuth::default()).unwrap();
        let newest = fs::read(key.dir().join("version_1").join(PATH_ENCRYPTED)).unwrap();

        key.update_key().unwrap();
        assert!(key.dir().join(PATH_LATEST).is_dir());
        assert!(!key.dir().join("version_0").exists());
        assert!(!key.dir().join("version_1").exists());
        assert!(!key.dir().join(PATH_LATEST_BAK).exists());
        assert_eq!(
            fs::read(key.dir().join(PATH_LATEST).join(PATH_ENCRYPTED)).unwrap(),
            newest
        );
    }

    #[test]
    fn test_update_without_candidate_fails() {
        let tmp = TempDir::new().unwrap();
        let mut key = new_key(&tmp, &huks());
        assert!(matches!(key.update_key(), Err(Error::NoCandidate)));
    }

    #[test]
    fn test_end_to_end_store_update_restore() {
        let tmp = TempDir::new().unwrap();
        let h = huks();
        let auth = UserAuth::default();
        let (mut key, raw) = stored_key(&tmp, &h, &auth);
        key.store_key(&auth).unwrap();
        key.update_key().unwrap();
        key.key_info.key.clear();

        let mut restored = BaseKey::new(key.dir().to_path_buf(), h);
        restored.restore_key(&auth, false).unwrap();
        // version_1 was last stored, and carries the same raw key
        assert_eq!(restored.key_info.key.as_slice(), raw.as_slice());
    }

    #[test]
    fn test_restore_with_secure_access_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let h = huks();
        let auth = UserAuth::with_credentials(b"1234", 7);
        let (mut key, raw) = stored_key(&tmp, &h, &auth);
        key.update_key().unwrap();
        key.key_info.key.clear();

        let mut restored = BaseKey::new(key.dir().to_path_buf(), h);
        restored.restore_key(&auth, false).unwrap();
        assert_eq!(restored.key_info.key.as_slice(), raw.as_slice());
    }

    #[test]
    fn test_restore_wrong_credentials_is_auth_error() {
        let tmp = TempDir::new().unwrap();
        let h = huks();
        let auth = UserAuth::with_credentials(b"1234", 7);
        let (mut key, _) = stored_key(&tmp, &h, &auth);
        key.update_key().unwrap();

        let mut restored = BaseKey::new(key.dir().to_path_buf(), h);
        let wrong = UserAuth::with_credentials(b"1234", 8);
        let err = restored.restore_key(&wrong, false).unwrap_err();
        assert!(err.is_auth_error());
        assert!(restored.key_info.key.is_empty());
    }

    #[test]
    fn test_restore_falls_back_to_intact_candidate() {
        let tmp = TempDir::new().unwrap();
        let h = huks();
        let auth = UserAuth::default();
        let (mut key, raw) = stored_key(&tmp, &h, &auth);
        key.update_key().unwrap();
        // second generation, left as a candidate
        key.store_key(&auth).unwrap();

        // truncate latest's encrypted file
        let latest_enc = key.dir().join(PATH_LATEST).join(PATH_ENCRYPTED);
        let data = fs::read(&latest_enc).unwrap();
        fs::write(&latest_enc, &data[..10]).unwrap();

        let mut restored = BaseKey::new(key.dir().to_path_buf(), h);
        restored.restore_key(&auth, true).unwrap();
        assert_eq!(restored.key_info.key.as_slice(), raw.as_slice());
        // the intact candidate was promoted
        assert!(restored.dir().join(PATH_LATEST).is_dir());
        assert!(!restored.dir().join("version_0").exists());
    }

    #[test]
    fn test_restore_survives_crash_between_renames() {
        // Simulate the window after latest -> latest_bak but before
        // candidate -> latest: only latest_bak and version_N exist.
        let tmp = TempDir::new().unwrap();
        let h = huks();
        let auth = UserAuth::default();
        let (mut key, raw) = stored_key(&tmp, &h, &auth);
        key.update_key().unwrap();
        key.store_key(&auth).unwrap();
        fs::rename(
            key.dir().join(PATH_LATEST),
            key.dir().join(PATH_LATEST_BAK),
        )
        .unwrap();

        let mut restored = BaseKey::new(key.dir().to_path_buf(), h);
        restored.restore_key(&auth, false).unwrap();
        assert_eq!(restored.key_info.key.as_slice(), raw.as_slice());
    }

    #[test]
    fn test_restore_from_backup_only() {
        // Crash right after promotion started from a state with no
        // remaining candidates: latest_bak alone must still restore.
        let tmp = TempDir::new().unwrap();
        let h = huks();
        let auth = UserAuth::default();
        let (mut key, raw) = stored_key(&tmp, &h, &auth);
        key.update_key().unwrap();
        fs::rename(
            key.dir().join(PATH_LATEST),
            key.dir().join(PATH_LATEST_BAK),
        )
        .unwrap();

        let mut restored = BaseKey::new(key.dir().to_path_buf(), h);
        restored.restore_key(&auth, false).unwrap();
        assert_eq!(restored.key_info.key.as_slice(), raw.as_slice());
    }

    #[test]
    fn test_restore_nothing_stored_is_restore_failed() {
        let tmp = TempDir::new().unwrap();
        let mut key = new_key(&tmp, &huks());
        assert!(matches!(
            key.restore_key(&UserAuth::default(), false),
            Err(Error::RestoreKeyFailed)
        ));
    }

    #[test]
    fn test_restore_version_mismatch_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let h = huks();
        let (mut key, _) = stored_key(&tmp, &h, &UserAuth::default());
        key.update_key().unwrap();

        let mut restored = BaseKey::new(key.dir().to_path_buf(), h);
        restored.key_info.version = Some(FscryptVersion::V1);
        assert!(matches!(
            restored.restore_key(&UserAuth::default(), false),
            Err(Error::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_deleting_sec_discard_is_crypto_erase() {
        let tmp = TempDir::new().unwrap();
        let h = huks();
        let auth = UserAuth::default();
        let (mut key, _) = stored_key(&tmp, &h, &auth);
        key.update_key().unwrap();
        fs::remove_file(key.dir().join(PATH_LATEST).join(PATH_SECDISC)).unwrap();

        let mut restored = BaseKey::new(key.dir().to_path_buf(), h);
        let err = restored.restore_key(&auth, false).unwrap_err();
        assert!(!err.is_auth_error());
    }

    #[test]
    fn test_clear_key_is_idempotent_and_zeroes() {
        let tmp = TempDir::new().unwrap();
        let (mut key, _) = stored_key(&tmp, &huks(), &UserAuth::default());
        let dir = key.dir().to_path_buf();

        key.clear_key();
        assert!(key.key_info.key.is_empty());
        assert!(!dir.exists());
        key.clear_key();
        assert!(key.key_info.key.is_empty());
    }

    #[test]
    fn test_upgrade_keys_rewraps_stale_shield() {
        let tmp = TempDir::new().unwrap();
        let hdi = Arc::new(SoftHuksHdi::ephemeral());
        let h = Arc::new(HuksMaster::new(hdi.clone()));
        let auth = UserAuth::default();
        let mut key = new_key(&tmp, &h);
        key.init_key(true).unwrap();
        let raw = key.key_info.key.clone();
        key.store_key(&auth).unwrap();
        key.update_key().unwrap();

        // age the stored shield by one blob version
        let shield_path = key.dir().join(PATH_LATEST).join(PATH_SHIELD);
        let stale = hdi.downgrade_for_test(&fs::read(&shield_path).unwrap());
        fs::write(&shield_path, stale).unwrap();

        key.upgrade_keys();
        assert_eq!(
            hdi.key_version(&fs::read(&shield_path).unwrap()).unwrap(),
            hdi.current_version()
        );

        let mut restored = BaseKey::new(key.dir().to_path_buf(), h);
        restored.restore_key(&auth, false).unwrap();
        assert_eq!(restored.key_info.key.as_slice(), raw.as_slice());
    }

    /// HDI whose shield generation is broken; everything else delegates
    struct BrokenShieldHdi(SoftHuksHdi);

    impl crate::huks::HuksHdi for BrokenShieldHdi {
        fn module_init(&self) -> i32 {
            self.0.module_init()
        }
        fn module_destroy(&self) -> i32 {
            self.0.module_destroy()
        }
        fn generate_key(
            &self,
            _params: &crate::huks::HksParamSet,
        ) -> crate::huks::HdiResult<Vec<u8>> {
            Err(crate::huks::HKS_ERROR_CRYPTO_ENGINE_ERROR)
        }
        fn init_session(
            &self,
            key: &[u8],
            params: &crate::huks::HksParamSet,
        ) -> crate::huks::HdiResult<u64> {
            self.0.init_session(key, params)
        }
        fn finish_session(
            &self,
            handle: u64,
            params: &crate::huks::HksParamSet,
            input: &[u8],
        ) -> crate::huks::HdiResult<Vec<u8>> {
            self.0.finish_session(handle, params, input)
        }
        fn upgrade_key(
            &self,
            old_key: &[u8],
            params: &crate::huks::HksParamSet,
        ) -> crate::huks::HdiResult<Vec<u8>> {
            self.0.upgrade_key(old_key, params)
        }
        fn key_version(&self, key: &[u8]) -> crate::huks::HdiResult<u32> {
            self.0.key_version(key)
        }
        fn current_version(&self) -> u32 {
            self.0.current_version()
        }
        fn generate_random(&self, len: usize) -> crate::huks::HdiResult<Vec<u8>> {
            self.0.generate_random(len)
        }
    }

    #[test]
    fn test_store_failure_leaves_no_partial_candidate() {
        let tmp = TempDir::new().unwrap();
        let broken = Arc::new(HuksMaster::new(Arc::new(BrokenShieldHdi(
            SoftHuksHdi::ephemeral(),
        ))));
        let mut key = new_key(&tmp, &broken);
        key.init_key(true).unwrap();

        // shield generation fails after the candidate dir was created
        assert!(key.store_key(&UserAuth::default()).is_err());
        assert!(!key.dir().join("version_0").exists());
        // raw key survives the failed store for a retry
        assert!(!key.key_info.key.is_empty());
    }

    #[test]
    fn test_store_failure_outside_crypto_also_removes_candidate() {
        let tmp = TempDir::new().unwrap();
        let mut key = new_key(&tmp, &huks());
        key.init_key(true).unwrap();

        // a directory squatting on the version file fails the store
        // after the candidate dir was created
        fs::create_dir(key.dir().join(PATH_FSCRYPT_VERSION)).unwrap();
        assert!(key.store_key(&UserAuth::default()).is_err());
        assert!(!key.dir().join("version_0").exists());
    }

    #[test]
    fn test_encrypted_file_carries_both_wrap_stages() {
        let tmp = TempDir::new().unwrap();
        let (key, _) = stored_key(&tmp, &huks(), &UserAuth::default());

        let encrypted = fs::read(key.dir().join("version_0").join(PATH_ENCRYPTED)).unwrap();
        let pre = AES_256_HASH_RANDOM_SIZE + GCM_MAC_BYTES;
        let local = GCM_NONCE_BYTES + CRYPTO_AES_256_KEY_ENCRYPTED_SIZE;
        assert_eq!(
            encrypted.len(),
            GCM_NONCE_BYTES + pre + local + GCM_MAC_BYTES
        );
    }

    #[test]
    fn test_corrupt_sec_discard_fails_local_unwrap() {
        let tmp = TempDir::new().unwrap();
        let h = huks();
        let auth = UserAuth::default();
        let (mut key, _) = stored_key(&tmp, &h, &auth);
        key.update_key().unwrap();

        let salt_path = key.dir().join(PATH_LATEST).join(PATH_SECDISC);
        let mut salt = fs::read(&salt_path).unwrap();
        salt[0] ^= 0xff;
        fs::write(&salt_path, &salt).unwrap();

        let mut restored = BaseKey::new(key.dir().to_path_buf(), h);
        let err = restored.restore_key(&auth, false).unwrap_err();
        assert!(!err.is_auth_error());
    }

    #[test]
    fn test_legacy_store_uses_derived_nonce() {
        let tmp = TempDir::new().unwrap();
        let h = huks();
        let auth = UserAuth::default();
        let (mut key, raw) = stored_key(&tmp, &h, &auth);
        key.update_key().unwrap();

        // re-store over the restored generation without a new shield
        let mut restored = BaseKey::new(key.dir().to_path_buf(), h.clone());
        restored.restore_key(&auth, false).unwrap();
        restored.store_key_with_shield(&auth, false).unwrap();
        restored.update_key().unwrap();

        let mut again = BaseKey::new(key.dir().to_path_buf(), h);
        again.restore_key(&auth, false).unwrap();
        assert_eq!(again.key_info.key.as_slice(), raw.as_slice());

        // the derived-nonce path persists the salt-derived nonce verbatim
        let latest = again.dir().join(PATH_LATEST);
        let salt = read_file(&latest.join(PATH_SECDISC)).unwrap();
        let derived =
            hash_with_prefix(HASH_PREFIX_NONCE, salt.as_slice(), GCM_NONCE_BYTES).unwrap();
        let encrypted = read_file(&latest.join(PATH_ENCRYPTED)).unwrap();
        assert_eq!(&encrypted.as_slice()[..GCM_NONCE_BYTES], derived.as_slice());
    }
}
