//! Kernel installation half of BaseKey
//!
//! Version dispatch is an enum match, not a type hierarchy: v2 keys go
//! through the mount-point ioctl and get a kernel-assigned identifier,
//! v1 keys go into the session keyring under a descriptor derived from
//! the key hash. Either way the raw key is wiped from memory the moment
//! the kernel has it.

use crate::crypto::{KeyBlob, FSCRYPT_KEY_DESCRIPTOR_SIZE, FSCRYPT_KEY_IDENTIFIER_SIZE};
use crate::error::{Error, Result};
use crate::kernel::KernelServices;
use crate::key::base::{read_file, sync_dir, write_file, BaseKey};
use crate::key::{FscryptVersion, PATH_FSCRYPT_VERSION, PATH_KEY_DESC, PATH_KEY_HASH, PATH_KEY_ID};
use std::path::Path;
use tracing::{info, warn};

impl BaseKey {
    /// Install the restored raw key into the kernel and persist the
    /// kernel handle next to the generation directories.
    pub fn active_key(&mut self, kernel: &KernelServices, mnt: &Path) -> Result<()> {
        if self.key_info.key.is_empty() {
            return Err(Error::InvalidParam("no raw key to install".to_string()));
        }
        let version = self.resolve_version(kernel, mnt)?;

        match version {
            FscryptVersion::V2 => {
                let key_id = kernel.key_ctrl.install_key_v2(mnt, &self.key_info.key)?;
                write_file(&self.dir.join(PATH_KEY_ID), &key_id)?;
                self.key_info.key_id = KeyBlob::from(&key_id[..]);
            }
            FscryptVersion::V1 => {
                let desc = self.v1_key_descriptor()?;
                kernel.key_ctrl.install_key_v1(&desc, &self.key_info.key)?;
                write_file(&self.dir.join(PATH_KEY_DESC), &desc)?;
                self.key_info.key_desc = KeyBlob::from(&desc[..]);
            }
        }
        write_file(
            &self.dir.join(PATH_KEY_HASH),
            self.key_info.key_hash.as_slice(),
        )?;
        sync_dir(&self.dir)?;
        self.key_info.key.clear();
        info!(dir = %self.dir.display(), version = ?version, "key installed into kernel");
        Ok(())
    }

    /// Engine IV for this key: the salted key hash, persisted at install
    /// time so lock and delete present the same identity after a daemon
    /// restart. Empty when the key was never installed.
    pub fn engine_iv(&mut self) -> KeyBlob {
        if self.key_info.key_hash.is_empty() {
            if let Ok(hash) = read_file(&self.dir.join(PATH_KEY_HASH)) {
                self.key_info.key_hash = hash;
            }
        }
        self.key_info.key_hash.clone()
    }

    /// Remove this key from the kernel and drop the persisted handle.
    ///
    /// Loads the handle from disk when the in-memory copy is gone (the
    /// common case after a daemon restart).
    pub fn inactive_key(&mut self, kernel: &KernelServices, mnt: &Path) -> Result<()> {
        let version = self.resolve_version(kernel, mnt)?;

        match version {
            FscryptVersion::V2 => {
                if self.key_info.key_id.is_empty() {
                    self.key_info.key_id = read_file(&self.dir.join(PATH_KEY_ID))?;
                }
                let key_id: [u8; FSCRYPT_KEY_IDENTIFIER_SIZE] = self
                    .key_info
                    .key_id
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::InvalidBlobSize {
                        expected: FSCRYPT_KEY_IDENTIFIER_SIZE,
                        got: self.key_info.key_id.len(),
                    })?;
                kernel.key_ctrl.remove_key_v2(mnt, &key_id)?;
                remove_handle_file(&self.dir.join(PATH_KEY_ID));
            }
            FscryptVersion::V1 => {
                if self.key_info.key_desc.is_empty() {
                    self.key_info.key_desc = read_file(&self.dir.join(PATH_KEY_DESC))?;
                }
                let desc: [u8; FSCRYPT_KEY_DESCRIPTOR_SIZE] = self
                    .key_info
                    .key_desc
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::InvalidBlobSize {
                        expected: FSCRYPT_KEY_DESCRIPTOR_SIZE,
                        got: self.key_info.key_desc.len(),
                    })?;
                kernel.key_ctrl.remove_key_v1(&desc)?;
                remove_handle_file(&self.dir.join(PATH_KEY_DESC));
            }
        }
        self.key_info.key_id.clear();
        self.key_info.key_desc.clear();
        info!(dir = %self.dir.display(), "key removed from kernel");
        Ok(())
    }

    /// On-disk indicator wins; a fresh directory asks the kernel and
    /// pins the answer so the key never flips ABI across reboots.
    fn resolve_version(&mut self, kernel: &KernelServices, mnt: &Path) -> Result<FscryptVersion> {
        if let Some(version) = self.key_info.version {
            return Ok(version);
        }
        let path = self.dir.join(PATH_FSCRYPT_VERSION);
        let version = match std::fs::read(&path) {
            Ok(bytes) if bytes.len() == 1 => FscryptVersion::from_tag(bytes[0])?,
            Ok(bytes) => {
                return Err(Error::InvalidBlobSize {
                    expected: 1,
                    got: bytes.len(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let probed = FscryptVersion::from_tag(kernel.key_ctrl.fscrypt_version_tag(mnt))?;
                write_file(&path, &[probed.tag()])?;
                probed
            }
            Err(e) => return Err(e.into()),
        };
        self.key_info.version = Some(version);
        Ok(version)
    }

    /// v1 descriptor: leading bytes of the salted key hash, so the
    /// keyring name is stable without disclosing key material
    fn v1_key_descriptor(&self) -> Result<[u8; FSCRYPT_KEY_DESCRIPTOR_SIZE]> {
        if self.key_info.key_hash.len() < FSCRYPT_KEY_DESCRIPTOR_SIZE {
            return Err(Error::InvalidParam("missing key hash".to_string()));
        }
        let mut desc = [0u8; FSCRYPT_KEY_DESCRIPTOR_SIZE];
        desc.copy_from_slice(&self.key_info.key_hash.as_slice()[..FSCRYPT_KEY_DESCRIPTOR_SIZE]);
        Ok(desc)
    }
}

fn remove_handle_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove kernel handle file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::huks::{HuksMaster, SoftHuksHdi};
    use crate::kernel::{NoopFbex, NoopKeyCtrl};
    use crate::key::UserAuth;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn services(ctrl: &Arc<NoopKeyCtrl>) -> KernelServices {
        KernelServices::new(ctrl.clone(), Arc::new(NoopFbex::new(true)))
    }

    fn ready_key(tmp: &TempDir) -> BaseKey {
        let huks = Arc::new(HuksMaster::new(Arc::new(SoftHuksHdi::ephemeral())));
        let dir = tmp.path().join("el2").join("100");
        fs::create_dir_all(&dir).unwrap();
        let mut key = BaseKey::new(dir, huks);
        key.init_key(true).unwrap();
        key.store_key(&UserAuth::default()).unwrap();
        key.update_key().unwrap();
        key
    }

    #[test]
    fn test_active_v2_persists_identifier_and_clears_raw_key() {
        let tmp = TempDir::new().unwrap();
        let ctrl = Arc::new(NoopKeyCtrl::new());
        let kernel = services(&ctrl);
        let mut key = ready_key(&tmp);

        key.active_key(&kernel, tmp.path()).unwrap();
        assert!(key.key_info.key.is_empty());
        assert_eq!(ctrl.installed_count(), 1);
        let stored = fs::read(key.dir().join(PATH_KEY_ID)).unwrap();
        assert_eq!(stored, key.key_info.key_id.as_slice());
        assert_eq!(stored.len(), FSCRYPT_KEY_IDENTIFIER_SIZE);
    }

    #[test]
    fn test_inactive_v2_after_restart_reads_handle_from_disk() {
        let tmp = TempDir::new().unwrap();
        let ctrl = Arc::new(NoopKeyCtrl::new());
        let kernel = services(&ctrl);
        let mut key = ready_key(&tmp);
        key.active_key(&kernel, tmp.path()).unwrap();

        // fresh BaseKey simulates a daemon restart
        let huks = Arc::new(HuksMaster::new(Arc::new(SoftHuksHdi::ephemeral())));
        let mut revived = BaseKey::new(key.dir().to_path_buf(), huks);
        revived.inactive_key(&kernel, tmp.path()).unwrap();
        assert_eq!(ctrl.installed_count(), 0);
        assert!(!revived.dir().join(PATH_KEY_ID).exists());
    }

    #[test]
    fn test_v1_path_uses_hash_derived_descriptor() {
        let tmp = TempDir::new().unwrap();
        let ctrl = Arc::new(NoopKeyCtrl::with_version_tag(b'1'));
        let kernel = services(&ctrl);

        let huks = Arc::new(HuksMaster::new(Arc::new(SoftHuksHdi::ephemeral())));
        let dir = tmp.path().join("el2").join("100");
        fs::create_dir_all(&dir).unwrap();
        let mut key = BaseKey::new(dir, huks);
        key.key_info.version = Some(FscryptVersion::V1);
        key.init_key(true).unwrap();
        let expected: [u8; FSCRYPT_KEY_DESCRIPTOR_SIZE] = key.key_info.key_hash.as_slice()
            [..FSCRYPT_KEY_DESCRIPTOR_SIZE]
            .try_into()
            .unwrap();
        key.store_key(&UserAuth::default()).unwrap();
        key.update_key().unwrap();

        key.active_key(&kernel, tmp.path()).unwrap();
        assert_eq!(ctrl.installed_count(), 1);
        assert_eq!(
            fs::read(key.dir().join(PATH_KEY_DESC)).unwrap(),
            expected
        );

        key.inactive_key(&kernel, tmp.path()).unwrap();
        assert_eq!(ctrl.installed_count(), 0);
    }

    #[test]
    fn test_engine_iv_survives_restart() {
        let tmp = TempDir::new().unwrap();
        let ctrl = Arc::new(NoopKeyCtrl::new());
        let kernel = services(&ctrl);
        let mut key = ready_key(&tmp);
        key.active_key(&kernel, tmp.path()).unwrap();
        let iv = key.engine_iv();
        assert!(!iv.is_empty());

        // fresh BaseKey simulates a daemon restart
        let huks = Arc::new(HuksMaster::new(Arc::new(SoftHuksHdi::ephemeral())));
        let mut revived = BaseKey::new(key.dir().to_path_buf(), huks);
        assert_eq!(revived.engine_iv().as_slice(), iv.as_slice());
    }

    #[test]
    fn test_active_without_raw_key_fails() {
        let tmp = TempDir::new().unwrap();
        let ctrl = Arc::new(NoopKeyCtrl::new());
        let kernel = services(&ctrl);
        let huks = Arc::new(HuksMaster::new(Arc::new(SoftHuksHdi::ephemeral())));
        let mut key = BaseKey::new(tmp.path().join("el2").join("100"), huks);
        assert!(key.active_key(&kernel, tmp.path()).is_err());
    }

    #[test]
    fn test_probed_version_is_pinned_on_disk() {
        let tmp = TempDir::new().unwrap();
        let ctrl = Arc::new(NoopKeyCtrl::new());
        let kernel = services(&ctrl);
        let huks = Arc::new(HuksMaster::new(Arc::new(SoftHuksHdi::ephemeral())));
        let dir = tmp.path().join("el2").join("100");
        fs::create_dir_all(&dir).unwrap();
        let mut key = BaseKey::new(dir, huks);
        key.init_key(true).unwrap();

        // no store yet, so no version file; active probes and pins it
        key.active_key(&kernel, tmp.path()).unwrap();
        assert_eq!(fs::read(key.dir().join(PATH_FSCRYPT_VERSION)).unwrap(), b"2");
    }
}
