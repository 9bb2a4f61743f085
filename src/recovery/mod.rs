//! Recovery-key escrow boundary
//!
//! The real provider is a TEE session whose protocol is vendor-opaque;
//! the lifecycle core only needs "create a recovery blob" and "consume
//! it once". `FileEscrowProvider` is the software implementation used
//! for bring-up and tests, sealing the escrowed key through the same
//! HUKS service the shields use.

use crate::crypto::{
    comb_key_ctx, hash_with_prefix, split_key_ctx, KeyBlob, KeyContext, GCM_MAC_BYTES,
    HASH_PREFIX_AAD,
};
use crate::error::{Error, Result};
use crate::huks::HuksMaster;
use crate::key::UserAuth;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

const ESCROW_SHIELD: &str = "escrow_shield";
const ESCROW_BLOB: &str = "escrow_blob";

pub trait RecoveryKeyProvider: Send + Sync {
    /// Escrow `raw_key` so it can be recovered exactly once without the
    /// user's credentials.
    fn create_recovery_key(&self, user_id: u32, raw_key: &KeyBlob) -> Result<()>;

    /// One-shot recovery: returns the escrowed key and destroys the
    /// escrow. A second call for the same user must fail.
    fn consume_recovery_key(&self, user_id: u32) -> Result<KeyBlob>;

    fn has_recovery_key(&self, user_id: u32) -> bool;
}

/// File-backed escrow sealed through HUKS
pub struct FileEscrowProvider {
    dir: PathBuf,
    huks: Arc<HuksMaster>,
}

impl FileEscrowProvider {
    pub fn new(dir: PathBuf, huks: Arc<HuksMaster>) -> Self {
        FileEscrowProvider { dir, huks }
    }

    fn user_dir(&self, user_id: u32) -> PathBuf {
        self.dir.join(user_id.to_string())
    }

    fn escrow_aad(user_id: u32) -> Result<KeyBlob> {
        hash_with_prefix(HASH_PREFIX_AAD, &user_id.to_le_bytes(), GCM_MAC_BYTES)
    }
}

impl RecoveryKeyProvider for FileEscrowProvider {
    fn create_recovery_key(&self, user_id: u32, raw_key: &KeyBlob) -> Result<()> {
        if raw_key.is_empty() {
            return Err(Error::InvalidParam("empty recovery key".to_string()));
        }
        let user_dir = self.user_dir(user_id);
        fs::create_dir_all(&user_dir)?;
        fs::set_permissions(&user_dir, fs::Permissions::from_mode(0o700))?;

        // Escrow is recoverable without credentials, so the shield
        // carries no secure-access policy.
        let auth = UserAuth::default();
        let mut ctx = KeyContext {
            shield: self.huks.generate_key(&auth)?,
            aad: Self::escrow_aad(user_id)?,
            ..Default::default()
        };
        let wrapped = self.huks.encrypt_key(&mut ctx, &auth, raw_key, true)?;
        let blob = comb_key_ctx(&ctx.nonce, &wrapped, &ctx.aad)?;

        crate::key::base::write_file(&user_dir.join(ESCROW_SHIELD), ctx.shield.as_slice())?;
        crate::key::base::write_file(&user_dir.join(ESCROW_BLOB), blob.as_slice())?;
        crate::key::base::sync_dir(&user_dir)?;
        info!(user_id, "recovery key escrowed");
        Ok(())
    }

    fn consume_recovery_key(&self, user_id: u32) -> Result<KeyBlob> {
        let user_dir = self.user_dir(user_id);
        let mut ctx = KeyContext {
            shield: crate::key::base::read_file(&user_dir.join(ESCROW_SHIELD))?,
            ..Default::default()
        };
        let blob = crate::key::base::read_file(&user_dir.join(ESCROW_BLOB))?;
        split_key_ctx(&blob, &mut ctx)?;
        if ctx.aad.as_slice() != Self::escrow_aad(user_id)?.as_slice() {
            return Err(Error::Recovery("escrow user mismatch".to_string()));
        }

        let wrapped = ctx.rnd_enc.clone();
        let key = self.huks.decrypt_key(&ctx, &UserAuth::default(), &wrapped)?;

        // Destroy before returning; a failed delete must not leave a
        // replayable escrow.
        if let Err(e) = fs::remove_dir_all(&user_dir) {
            warn!(user_id, error = %e, "failed to destroy consumed escrow");
            return Err(Error::Recovery(format!("escrow destroy failed: {}", e)));
        }
        info!(user_id, "recovery key consumed");
        Ok(key)
    }

    fn has_recovery_key(&self, user_id: u32) -> bool {
        self.user_dir(user_id).join(ESCROW_BLOB).is_file()
    }
}
