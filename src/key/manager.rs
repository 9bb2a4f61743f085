//! KeyManager - per-user registry of key lifecycles
//!
//! Thin orchestration over BaseKey. Explicitly constructed with its
//! collaborators (no global singleton); one registry mutex serializes
//! operations, which BaseKey requires of its callers.

use crate::error::{Error, Result};
use crate::huks::HuksMaster;
use crate::kernel::KernelServices;
use crate::key::v1_ext::{FbexExt, FBEX_KEY_FLAG_NEW};
use crate::key::{BaseKey, DelayHandler, KeyLevel, UserAuth};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Owner of the device-global EL1 key
pub const GLOBAL_USER_ID: u32 = 0;

pub struct KeyManager {
    huks: Arc<HuksMaster>,
    kernel: KernelServices,
    base_dir: PathBuf,
    /// Mount point the fscrypt ioctls operate on
    data_mnt: PathBuf,
    el1_inactive: bool,
    keys: Mutex<HashMap<(u32, KeyLevel), BaseKey>>,
    delay: DelayHandler,
}

impl KeyManager {
    pub fn new(
        huks: Arc<HuksMaster>,
        kernel: KernelServices,
        base_dir: PathBuf,
        data_mnt: PathBuf,
    ) -> Self {
        KeyManager {
            huks,
            kernel,
            base_dir,
            data_mnt,
            el1_inactive: false,
            keys: Mutex::new(HashMap::new()),
            delay: DelayHandler::new(),
        }
    }

    /// Force EL1 engine-key removal on inactivation (EL1 normally stays
    /// resident)
    pub fn with_el1_inactive(mut self, el1_inactive: bool) -> Self {
        self.el1_inactive = el1_inactive;
        self
    }

    fn key_dir(&self, user_id: u32, level: KeyLevel) -> PathBuf {
        self.base_dir.join(level.dir_name()).join(user_id.to_string())
    }

    fn fbex_ext(&self, user_id: u32, level: KeyLevel) -> FbexExt {
        FbexExt::new(
            self.kernel.fbex.clone(),
            self.key_dir(user_id, level),
            user_id,
            level,
            self.el1_inactive,
        )
    }

    fn with_key<T>(
        &self,
        user_id: u32,
        level: KeyLevel,
        f: impl FnOnce(&mut BaseKey) -> Result<T>,
    ) -> Result<T> {
        let mut keys = self.keys.lock();
        let key = keys.entry((user_id, level)).or_insert_with(|| {
            BaseKey::new(self.key_dir(user_id, level), self.huks.clone())
        });
        f(key)
    }

    /// Boot-time device key (EL1, empty auth): restore it if stored,
    /// otherwise create it, then install into the kernel.
    pub fn init_global_key(&self) -> Result<()> {
        let auth = UserAuth::default();
        let fbex = self.fbex_ext(GLOBAL_USER_ID, KeyLevel::El1);
        self.with_key(GLOBAL_USER_ID, KeyLevel::El1, |key| {
            let flag = if key.is_stored() {
                key.restore_key(&auth, true)?;
                0
            } else {
                fs::create_dir_all(key.dir())?;
                fs::set_permissions(key.dir(), fs::Permissions::from_mode(0o700))?;
                key.init_key(true)?;
                key.store_key(&auth)?;
                key.update_key()?;
                FBEX_KEY_FLAG_NEW
            };
            fbex.active_key_ext(&key.key_info.key_hash, flag)?;
            key.active_key(&self.kernel, &self.data_mnt)
        })?;
        info!("global device key active");
        Ok(())
    }

    /// Create every per-user level for a new account. No credential
    /// exists yet, so all levels start with empty auth;
    /// [`Self::update_user_auth`] binds one later.
    pub fn generate_user_keys(&self, user_id: u32) -> Result<()> {
        let auth = UserAuth::default();
        for level in KeyLevel::user_levels() {
            self.with_key(user_id, level, |key| {
                if key.is_stored() {
                    return Err(Error::KeyAlreadyInitialized);
                }
                fs::create_dir_all(key.dir())?;
                fs::set_permissions(key.dir(), fs::Permissions::from_mode(0o700))?;
                key.init_key(true)?;
                key.store_key(&auth)?;
                key.update_key()
            })?;
        }
        info!(user_id, "user keys generated");
        Ok(())
    }

    /// Remove a user's keys everywhere: kernel, engine, disk, memory.
    /// Per-level I/O failures are logged so the deletion always runs to
    /// completion.
    pub fn delete_user_keys(&self, user_id: u32) {
        self.delay.cancel(user_id);
        let mut keys = self.keys.lock();
        for level in KeyLevel::user_levels() {
            let mut key = keys
                .remove(&(user_id, level))
                .unwrap_or_else(|| BaseKey::new(self.key_dir(user_id, level), self.huks.clone()));
            let fbex = self.fbex_ext(user_id, level);
            // an empty IV means the key was never engine-installed
            let iv = key.engine_iv();
            if !iv.is_empty() {
                if let Err(e) = fbex.inactive_key_ext(&iv, true) {
                    warn!(user_id, level = ?level, error = %e, "fbex removal failed during delete");
                }
            }
            if let Err(e) = key.inactive_key(&self.kernel, &self.data_mnt) {
                warn!(user_id, level = ?level, error = %e, "kernel removal failed during delete");
            }
            key.clear_key();
        }
        info!(user_id, "user keys deleted");
    }

    /// Re-wrap a user's credential-bound levels under new credentials:
    /// restore with the old auth, store a new generation with the new
    /// auth, promote it.
    pub fn update_user_auth(
        &self,
        user_id: u32,
        old_auth: &UserAuth,
        new_auth: &UserAuth,
    ) -> Result<()> {
        for level in [KeyLevel::El2, KeyLevel::El3, KeyLevel::El4] {
            self.with_key(user_id, level, |key| {
                key.key_info.key.clear();
                key.restore_key(old_auth, true)?;
                key.store_key(new_auth)?;
                key.update_key()?;
                key.key_info.key.clear();
                Ok(())
            })?;
        }
        info!(user_id, "user auth updated");
        Ok(())
    }

    /// Unlock: restore each level with the user's credentials and
    /// install into kernel and engine. Cancels any pending deferred
    /// deactivation first.
    pub fn active_user_key(&self, user_id: u32, auth: &UserAuth) -> Result<()> {
        self.delay.cancel(user_id);
        for level in KeyLevel::user_levels() {
            let fbex = self.fbex_ext(user_id, level);
            self.with_key(user_id, level, |key| {
                if key.key_info.key.is_empty() {
                    key.restore_key(auth, true)?;
                }
                fbex.active_key_ext(&key.key_info.key_hash, 0)?;
                key.active_key(&self.kernel, &self.data_mnt)
            })?;
        }
        info!(user_id, "user keys active");
        Ok(())
    }

    /// Lock/logout: remove the user's keys from kernel and engine.
    /// On-disk state is untouched; `destroy == false` on the engine side
    /// retains the key for a fast re-unlock.
    pub fn inactive_user_key(&self, user_id: u32) -> Result<()> {
        for level in KeyLevel::user_levels() {
            let fbex = self.fbex_ext(user_id, level);
            self.with_key(user_id, level, |key| {
                // installed IV, reloaded from disk after a daemon restart
                let iv = key.engine_iv();
                if !iv.is_empty() {
                    fbex.inactive_key_ext(&iv, false)?;
                }
                key.inactive_key(&self.kernel, &self.data_mnt)?;
                key.key_info.clear();
                Ok(())
            })?;
        }
        info!(user_id, "user keys inactive");
        Ok(())
    }

    /// Arm a deferred deactivation; a later activation or deletion
    /// cancels it.
    pub fn defer_inactive_user_key(self: &Arc<Self>, user_id: u32, delay: Duration) {
        let manager = self.clone();
        self.delay.defer(user_id, delay, move || {
            if let Err(e) = manager.inactive_user_key(user_id) {
                warn!(user_id, error = %e, "deferred deactivation failed");
            }
        });
    }

    /// Ensure the per-level directory skeleton exists with 0700 perms
    pub fn prepare_user_space(&self, user_id: u32) -> Result<()> {
        for level in KeyLevel::user_levels() {
            let dir = self.key_dir(user_id, level);
            fs::create_dir_all(&dir)?;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }

    /// Legacy re-encrypt of the CE key in place: same shield, same
    /// generation, salt-derived nonce.
    pub fn update_key_context(&self, user_id: u32, auth: &UserAuth) -> Result<()> {
        self.with_key(user_id, KeyLevel::El2, |key| {
            key.key_info.key.clear();
            key.restore_key(auth, true)?;
            key.store_key_with_shield(auth, false)?;
            key.update_key()?;
            key.key_info.key.clear();
            Ok(())
        })
    }

    /// Opportunistic shield re-wrap sweep across a user's stored keys
    pub fn upgrade_user_keys(&self, user_id: u32) {
        for level in KeyLevel::user_levels() {
            if let Err(e) = self.with_key(user_id, level, |key| {
                key.upgrade_keys();
                Ok(())
            }) {
                warn!(user_id, level = ?level, error = %e, "shield upgrade sweep failed");
            }
        }
    }

    pub fn pending_deactivations(&self) -> usize {
        self.delay.pending_count()
    }
}
