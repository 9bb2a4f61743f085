//! FBEX coordination and migration user-ID remapping
//!
//! Bridges a key to the vendor inline-crypto-engine ioctl surface. The
//! user-ID remap below is active only while a `need_restore` marker file
//! is present (single-OS-upgrade migration window) and encodes a fixed
//! historical contract with shipped kernels:
//!
//! ```text
//! 0            -> 100
//! 10, 11, ...  -> 101, 102, ...   (offset 91)
//! 100          -> 0               (reverse)
//! ```
//!
//! Do not generalize the arithmetic.

use crate::crypto::KeyBlob;
use crate::error::Result;
use crate::kernel::fbex::{FBEX_TYPE_EL2, FBEX_TYPE_EL3, FBEX_TYPE_EL4, FBEX_TYPE_EL5};
use crate::kernel::Fbex;
use crate::key::{KeyLevel, PATH_NEED_RESTORE};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_SINGLE_FIRST_USER_ID: u32 = 100;
pub const USER_ID_DIFF: u32 = 91;
/// First non-owner account id; ids below this (except 0) never remap
const FIRST_EXTRA_USER_ID: u32 = 10;
/// Brand-new key; the warm-boot retry does not apply
pub const FBEX_KEY_FLAG_NEW: u8 = 1;

pub struct FbexExt {
    fbex: Arc<dyn Fbex>,
    /// Key directory holding the `need_restore` migration marker
    key_dir: PathBuf,
    user_id: u32,
    level: KeyLevel,
    /// Force EL1 engine-key removal on inactivation (EL1 normally stays
    /// resident)
    el1_inactive: bool,
}

impl FbexExt {
    pub fn new(
        fbex: Arc<dyn Fbex>,
        key_dir: PathBuf,
        user_id: u32,
        level: KeyLevel,
        el1_inactive: bool,
    ) -> Self {
        FbexExt {
            fbex,
            key_dir,
            user_id,
            level,
            el1_inactive,
        }
    }

    pub fn is_support(&self) -> bool {
        self.fbex.is_support()
    }

    fn need_restore(&self) -> bool {
        self.key_dir.join(PATH_NEED_RESTORE).is_file()
    }

    pub fn set_need_restore_flag(&self) -> Result<()> {
        crate::key::base::write_file(&self.key_dir.join(PATH_NEED_RESTORE), b"1")
    }

    pub fn clear_need_restore_flag(&self) {
        let marker = self.key_dir.join(PATH_NEED_RESTORE);
        if let Err(e) = std::fs::remove_file(&marker) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %marker.display(), error = %e, "failed to clear need_restore marker");
            }
        }
    }

    /// Migration remap, applied only inside the need_restore window
    fn map_user_id(&self, user_id: u32) -> u32 {
        remap_user_id(user_id, self.need_restore())
    }

    fn fbex_type(&self) -> u32 {
        match self.level {
            // EL1 keys share the EL2 engine domain
            KeyLevel::El1 | KeyLevel::El2 => FBEX_TYPE_EL2,
            KeyLevel::El3 => FBEX_TYPE_EL3,
            KeyLevel::El4 => FBEX_TYPE_EL4,
            KeyLevel::El5 => FBEX_TYPE_EL5,
        }
    }

    /// Install the key IV into the engine.
    ///
    /// `flag == 0` means a previously installed key is being re-armed;
    /// that path retries once to ride out a transient kernel race on
    /// warm boot. A brand-new key (`flag == FBEX_KEY_FLAG_NEW`) fails
    /// immediately.
    pub fn active_key_ext(&self, iv: &KeyBlob, flag: u8) -> Result<()> {
        if !self.fbex.is_support() {
            return Ok(());
        }
        let user = self.map_user_id(self.user_id);
        let type_ = self.fbex_type();
        match self.fbex.install_key_to_kernel(user, type_, iv, flag) {
            Ok(()) => Ok(()),
            Err(e) if flag == 0 => {
                warn!(user, type_, error = %e, "fbex install failed, retrying once");
                self.fbex.install_key_to_kernel(user, type_, iv, flag)
            }
            Err(e) => Err(e),
        }
    }

    /// Double-DE path: one engine key serving both linked encryption
    /// domains. Returns the engine-reported elType callers use to
    /// correlate kernel state across the pair.
    pub fn active_double_key_ext(&self, iv: &KeyBlob) -> Result<u32> {
        if !self.fbex.is_support() {
            return Ok(crate::kernel::fbex::FBEX_TYPE_DOUBLE_DE);
        }
        let single = self.map_user_id(self.user_id);
        let el_type = self.fbex.install_double_de_key(single, self.user_id, iv)?;
        info!(user = self.user_id, el_type, "double-DE key installed");
        Ok(el_type)
    }

    /// `destroy == true` removes the engine key; `false` is the
    /// logout-but-retain path. EL1 stays resident unless configured
    /// otherwise.
    pub fn inactive_key_ext(&self, iv: &KeyBlob, destroy: bool) -> Result<()> {
        if self.level == KeyLevel::El1 && !self.el1_inactive {
            return Ok(());
        }
        if !self.fbex.is_support() {
            return Ok(());
        }
        let user = self.map_user_id(self.user_id);
        self.fbex
            .uninstall_or_lock_key(user, self.fbex_type(), iv, destroy)
    }
}

/// Standalone remap used by callers outside the marker window check
pub fn remap_user_id(user_id: u32, need_restore: bool) -> u32 {
    if !need_restore {
        return user_id;
    }
    match user_id {
        0 => DEFAULT_SINGLE_FIRST_USER_ID,
        DEFAULT_SINGLE_FIRST_USER_ID => 0,
        id if id >= FIRST_EXTRA_USER_ID => id + USER_ID_DIFF,
        id => id,
    }
}
