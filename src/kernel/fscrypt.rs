//! fscrypt kernel ABI, see <linux/fscrypt.h>
//!
//! v2 keys go through FS_IOC_ADD/REMOVE_ENCRYPTION_KEY on the mount
//! point and are named by a 16-byte kernel-assigned identifier; v1 keys
//! go through the session keyring (add_key/keyctl) and are named by an
//! 8-byte caller-chosen descriptor.

use crate::crypto::{KeyBlob, FSCRYPT_KEY_DESCRIPTOR_SIZE, FSCRYPT_KEY_IDENTIFIER_SIZE};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;
use tracing::debug;

pub const FSCRYPT_MAX_KEY_SIZE: usize = 64;
pub const FSCRYPT_KEY_SPEC_TYPE_DESCRIPTOR: u32 = 1;
pub const FSCRYPT_KEY_SPEC_TYPE_IDENTIFIER: u32 = 2;
/// Legacy v1 payload mode tag
pub const FSCRYPT_MODE_AES_256_XTS: u32 = 1;
/// Keyring description prefix for v1 keys
pub const FSCRYPT_V1_KEY_PREFIX: &str = "fscrypt:";

#[repr(C)]
#[derive(Copy, Clone)]
pub struct fscrypt_key_specifier {
    pub type_: u32,
    pub __reserved: u32,
    /// descriptor (8 bytes) or identifier (16 bytes), zero-padded
    pub u: [u8; 32],
}

#[repr(C)]
pub struct fscrypt_add_key_arg {
    pub key_spec: fscrypt_key_specifier,
    pub raw_size: u32,
    pub key_id: u32,
    pub __reserved: [u32; 8],
    pub raw: [u8; FSCRYPT_MAX_KEY_SIZE],
}

#[repr(C)]
pub struct fscrypt_remove_key_arg {
    pub key_spec: fscrypt_key_specifier,
    pub removal_status_flags: u32,
    pub __reserved: [u32; 5],
}

/// Legacy v1 keyring payload
#[repr(C)]
pub struct fscrypt_key {
    pub mode: u32,
    pub raw: [u8; FSCRYPT_MAX_KEY_SIZE],
    pub size: u32,
}

// Struct sizes are kernel ABI.
const _: () = assert!(std::mem::size_of::<fscrypt_key_specifier>() == 40);
const _: () = assert!(std::mem::size_of::<fscrypt_add_key_arg>() == 40 + 8 + 32 + 64);
const _: () = assert!(std::mem::size_of::<fscrypt_remove_key_arg>() == 40 + 24);
const _: () = assert!(std::mem::size_of::<fscrypt_key>() == 72);

// _IOWR('f', 23, ...) / _IOWR('f', 24, ...)
nix::ioctl_readwrite!(fs_ioc_add_encryption_key, b'f', 23, fscrypt_add_key_arg);
nix::ioctl_readwrite!(fs_ioc_remove_encryption_key, b'f', 24, fscrypt_remove_key_arg);

/// Kernel key install/remove capability consumed by the lifecycle core
pub trait KeyCtrl: Send + Sync {
    /// FS_IOC_ADD_ENCRYPTION_KEY; returns the kernel-assigned identifier
    fn install_key_v2(
        &self,
        mnt: &Path,
        raw_key: &KeyBlob,
    ) -> Result<[u8; FSCRYPT_KEY_IDENTIFIER_SIZE]>;

    fn remove_key_v2(&self, mnt: &Path, key_id: &[u8; FSCRYPT_KEY_IDENTIFIER_SIZE]) -> Result<()>;

    /// add_key(2) into the session keyring under the v1 descriptor
    fn install_key_v1(
        &self,
        key_desc: &[u8; FSCRYPT_KEY_DESCRIPTOR_SIZE],
        raw_key: &KeyBlob,
    ) -> Result<()>;

    fn remove_key_v1(&self, key_desc: &[u8; FSCRYPT_KEY_DESCRIPTOR_SIZE]) -> Result<()>;

    /// Which fscrypt ABI the kernel under `mnt` speaks ('1' or '2')
    fn fscrypt_version_tag(&self, mnt: &Path) -> u8;
}

/// Real ioctl/syscall-backed implementation
pub struct DeviceKeyCtrl;

impl DeviceKeyCtrl {
    pub fn new() -> Self {
        DeviceKeyCtrl
    }
}

impl Default for DeviceKeyCtrl {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyCtrl for DeviceKeyCtrl {
    fn install_key_v2(
        &self,
        mnt: &Path,
        raw_key: &KeyBlob,
    ) -> Result<[u8; FSCRYPT_KEY_IDENTIFIER_SIZE]> {
        if raw_key.is_empty() || raw_key.len() > FSCRYPT_MAX_KEY_SIZE {
            return Err(Error::InvalidParam("bad raw key size".to_string()));
        }
        let dir = File::open(mnt)?;
        let mut arg = fscrypt_add_key_arg {
            key_spec: fscrypt_key_specifier {
                type_: FSCRYPT_KEY_SPEC_TYPE_IDENTIFIER,
                __reserved: 0,
                u: [0u8; 32],
            },
            raw_size: raw_key.len() as u32,
            key_id: 0,
            __reserved: [0u32; 8],
            raw: [0u8; FSCRYPT_MAX_KEY_SIZE],
        };
        arg.raw[..raw_key.len()].copy_from_slice(raw_key.as_slice());

        // SAFETY: arg is a properly initialized ABI struct and the fd is
        // a directory on the target filesystem.
        let res = unsafe { fs_ioc_add_encryption_key(dir.as_raw_fd(), &mut arg) };
        arg.raw.iter_mut().for_each(|b| *b = 0);
        res.map_err(|e| Error::KernelInstall(e.to_string()))?;

        let mut key_id = [0u8; FSCRYPT_KEY_IDENTIFIER_SIZE];
        key_id.copy_from_slice(&arg.key_spec.u[..FSCRYPT_KEY_IDENTIFIER_SIZE]);
        Ok(key_id)
    }

    fn remove_key_v2(&self, mnt: &Path, key_id: &[u8; FSCRYPT_KEY_IDENTIFIER_SIZE]) -> Result<()> {
        let dir = File::open(mnt)?;
        let mut arg = fscrypt_remove_key_arg {
            key_spec: fscrypt_key_specifier {
                type_: FSCRYPT_KEY_SPEC_TYPE_IDENTIFIER,
                __reserved: 0,
                u: [0u8; 32],
            },
            removal_status_flags: 0,
            __reserved: [0u32; 5],
        };
        arg.key_spec.u[..FSCRYPT_KEY_IDENTIFIER_SIZE].copy_from_slice(key_id);

        // SAFETY: see install_key_v2.
        unsafe { fs_ioc_remove_encryption_key(dir.as_raw_fd(), &mut arg) }
            .map_err(|e| Error::KernelRemove(e.to_string()))?;
        if arg.removal_status_flags != 0 {
            debug!(
                flags = arg.removal_status_flags,
                "fscrypt key incompletely removed"
            );
        }
        Ok(())
    }

    fn install_key_v1(
        &self,
        key_desc: &[u8; FSCRYPT_KEY_DESCRIPTOR_SIZE],
        raw_key: &KeyBlob,
    ) -> Result<()> {
        if raw_key.is_empty() || raw_key.len() > FSCRYPT_MAX_KEY_SIZE {
            return Err(Error::InvalidParam("bad raw key size".to_string()));
        }
        let mut payload = fscrypt_key {
            mode: FSCRYPT_MODE_AES_256_XTS,
            raw: [0u8; FSCRYPT_MAX_KEY_SIZE],
            size: raw_key.len() as u32,
        };
        payload.raw[..raw_key.len()].copy_from_slice(raw_key.as_slice());

        let desc = format!("{}{}", FSCRYPT_V1_KEY_PREFIX, hex::encode(key_desc));
        let desc_c = std::ffi::CString::new(desc)
            .map_err(|_| Error::InvalidParam("bad key descriptor".to_string()))?;
        let type_c = c"logon";

        // SAFETY: add_key(2) with a fixed-layout payload; the kernel
        // copies the buffer before we zero it.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_add_key,
                type_c.as_ptr(),
                desc_c.as_ptr(),
                &payload as *const fscrypt_key as *const libc::c_void,
                std::mem::size_of::<fscrypt_key>(),
                libc::KEY_SPEC_SESSION_KEYRING,
            )
        };
        payload.raw.iter_mut().for_each(|b| *b = 0);
        if ret < 0 {
            return Err(Error::KernelInstall(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        Ok(())
    }

    fn remove_key_v1(&self, key_desc: &[u8; FSCRYPT_KEY_DESCRIPTOR_SIZE]) -> Result<()> {
        let desc = format!("{}{}", FSCRYPT_V1_KEY_PREFIX, hex::encode(key_desc));
        let desc_c = std::ffi::CString::new(desc)
            .map_err(|_| Error::InvalidParam("bad key descriptor".to_string()))?;
        let type_c = c"logon";

        // SAFETY: request_key then keyctl revoke+unlink; no pointers
        // outlive the call.
        unsafe {
            let serial = libc::syscall(
                libc::SYS_request_key,
                type_c.as_ptr(),
                desc_c.as_ptr(),
                std::ptr::null::<libc::c_char>(),
                0,
            );
            if serial < 0 {
                return Err(Error::KernelRemove(
                    std::io::Error::last_os_error().to_string(),
                ));
            }
            if libc::syscall(libc::SYS_keyctl, libc::KEYCTL_REVOKE, serial) < 0 {
                return Err(Error::KernelRemove(
                    std::io::Error::last_os_error().to_string(),
                ));
            }
            libc::syscall(
                libc::SYS_keyctl,
                libc::KEYCTL_UNLINK,
                serial,
                libc::KEY_SPEC_SESSION_KEYRING,
            );
        }
        Ok(())
    }

    fn fscrypt_version_tag(&self, mnt: &Path) -> u8 {
        // Probe with a zero-size add; EINVAL from a v2-capable kernel
        // differs from ENOTTY on pre-v2 kernels.
        let Ok(dir) = File::open(mnt) else {
            return b'1';
        };
        let mut arg = fscrypt_add_key_arg {
            key_spec: fscrypt_key_specifier {
                type_: FSCRYPT_KEY_SPEC_TYPE_IDENTIFIER,
                __reserved: 0,
                u: [0u8; 32],
            },
            raw_size: 0,
            key_id: 0,
            __reserved: [0u32; 8],
            raw: [0u8; FSCRYPT_MAX_KEY_SIZE],
        };
        // SAFETY: probe call with an empty payload.
        match unsafe { fs_ioc_add_encryption_key(dir.as_raw_fd(), &mut arg) } {
            Err(nix::errno::Errno::ENOTTY) | Err(nix::errno::Errno::EOPNOTSUPP) => b'1',
            _ => b'2',
        }
    }
}

/// Recording test double; derives deterministic identifiers so tests
/// can assert on install/remove pairing.
pub struct NoopKeyCtrl {
    installed_v2: Mutex<HashMap<[u8; FSCRYPT_KEY_IDENTIFIER_SIZE], usize>>,
    installed_v1: Mutex<HashMap<[u8; FSCRYPT_KEY_DESCRIPTOR_SIZE], usize>>,
    version_tag: u8,
}

impl NoopKeyCtrl {
    pub fn new() -> Self {
        NoopKeyCtrl {
            installed_v2: Mutex::new(HashMap::new()),
            installed_v1: Mutex::new(HashMap::new()),
            version_tag: b'2',
        }
    }

    pub fn with_version_tag(tag: u8) -> Self {
        NoopKeyCtrl {
            version_tag: tag,
            ..Self::new()
        }
    }

    pub fn installed_count(&self) -> usize {
        self.installed_v2.lock().len() + self.installed_v1.lock().len()
    }
}

impl Default for NoopKeyCtrl {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyCtrl for NoopKeyCtrl {
    fn install_key_v2(
        &self,
        _mnt: &Path,
        raw_key: &KeyBlob,
    ) -> Result<[u8; FSCRYPT_KEY_IDENTIFIER_SIZE]> {
        if raw_key.is_empty() {
            return Err(Error::InvalidParam("empty raw key".to_string()));
        }
        let digest = ring::digest::digest(&ring::digest::SHA512, raw_key.as_slice());
        let mut key_id = [0u8; FSCRYPT_KEY_IDENTIFIER_SIZE];
        key_id.copy_from_slice(&digest.as_ref()[..FSCRYPT_KEY_IDENTIFIER_SIZE]);
        *self.installed_v2.lock().entry(key_id).or_insert(0) += 1;
        Ok(key_id)
    }

    fn remove_key_v2(&self, _mnt: &Path, key_id: &[u8; FSCRYPT_KEY_IDENTIFIER_SIZE]) -> Result<()> {
        self.installed_v2
            .lock()
            .remove(key_id)
            .map(|_| ())
            .ok_or_else(|| Error::KernelRemove("key not installed".to_string()))
    }

    fn install_key_v1(
        &self,
        key_desc: &[u8; FSCRYPT_KEY_DESCRIPTOR_SIZE],
        raw_key: &KeyBlob,
    ) -> Result<()> {
        if raw_key.is_empty() {
            return Err(Error::InvalidParam("empty raw key".to_string()));
        }
        *self.installed_v1.lock().entry(*key_desc).or_insert(0) += 1;
        Ok(())
    }

    fn remove_key_v1(&self, key_desc: &[u8; FSCRYPT_KEY_DESCRIPTOR_SIZE]) -> Result<()> {
        self.installed_v1
            .lock()
            .remove(key_desc)
            .map(|_| ())
            .ok_or_else(|| Error::KernelRemove("key not installed".to_string()))
    }

    fn fscrypt_version_tag(&self, _mnt: &Path) -> u8 {
        self.version_tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes_are_abi() {
        assert_eq!(std::mem::size_of::<fscrypt_key_specifier>(), 40);
        assert_eq!(std::mem::size_of::<fscrypt_add_key_arg>(), 144);
        assert_eq!(std::mem::size_of::<fscrypt_remove_key_arg>(), 64);
        assert_eq!(std::mem::size_of::<fscrypt_key>(), 72);
    }

    #[test]
    fn test_noop_install_remove_pairing() {
        let kc = NoopKeyCtrl::new();
        let key = KeyBlob::random(64);
        let id = kc.install_key_v2(Path::new("/"), &key).unwrap();
        assert_eq!(kc.installed_count(), 1);
        kc.remove_key_v2(Path::new("/"), &id).unwrap();
        assert_eq!(kc.installed_count(), 0);
        assert!(kc.remove_key_v2(Path::new("/"), &id).is_err());
    }

    #[test]
    fn test_noop_v2_identifier_is_deterministic() {
        let kc = NoopKeyCtrl::new();
        let key = KeyBlob::random(64);
        let a = kc.install_key_v2(Path::new("/"), &key).unwrap();
        let b = kc.install_key_v2(Path::new("/"), &key).unwrap();
        assert_eq!(a, b);
    }
}
