//! Vendor inline-crypto-engine (FBEX) ioctl surface
//!
//! Keys for the storage-controller crypto engine are installed through
//! the /dev/fbex_cmd and /dev/fbex_uece character devices. An absent
//! device node means the platform ships without the engine; that is a
//! capability-probe result (`is_support`), never an error.

use crate::crypto::KeyBlob;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// IV buffer size inside the fixed-layout opts structs
pub const FBEX_IV_SIZE: usize = 64;

/// ioctl command codes on /dev/fbex_cmd
pub const FBEX_IOC_MAGIC: u8 = b'F';
pub const FBEX_ADD_IV: u8 = 0x1;
pub const FBEX_DEL_IV: u8 = 0x2;
pub const FBEX_LOCK_SCREEN: u8 = 0x3;
pub const FBEX_UNLOCK_SCREEN: u8 = 0x4;
pub const FBEX_USER_LOGOUT: u8 = 0x5;
pub const FBEX_ADD_DOUBLE_DE_IV: u8 = 0x6;

/// Key domain tags the engine distinguishes
pub const FBEX_TYPE_EL2: u32 = 0;
pub const FBEX_TYPE_EL3: u32 = 1;
pub const FBEX_TYPE_EL4: u32 = 2;
pub const FBEX_TYPE_EL5: u32 = 3;
/// elType reported for a double-DE (EL3+EL4 linked) install
pub const FBEX_TYPE_DOUBLE_DE: u32 = 0x12;

#[repr(C, packed)]
pub struct FbeOptsV1 {
    pub user: u32,
    pub type_: u32,
    pub len: u32,
    pub iv: [u8; FBEX_IV_SIZE],
    pub flag: u8,
}

/// Double-DE variant: two linked user ids sharing one engine key
#[repr(C, packed)]
pub struct FbeOptsEV1 {
    pub user_single: u32,
    pub user_double: u32,
    pub type_: u32,
    pub len: u32,
    pub iv: [u8; FBEX_IV_SIZE],
    pub flag: u8,
}

// Packed layouts are device ABI.
const _: () = assert!(std::mem::size_of::<FbeOptsV1>() == 12 + FBEX_IV_SIZE + 1);
const _: () = assert!(std::mem::size_of::<FbeOptsEV1>() == 16 + FBEX_IV_SIZE + 1);

nix::ioctl_readwrite!(fbex_ioc_add_iv, FBEX_IOC_MAGIC, FBEX_ADD_IV, FbeOptsV1);
nix::ioctl_readwrite!(fbex_ioc_del_iv, FBEX_IOC_MAGIC, FBEX_DEL_IV, FbeOptsV1);
nix::ioctl_readwrite!(fbex_ioc_user_logout, FBEX_IOC_MAGIC, FBEX_USER_LOGOUT, FbeOptsV1);
nix::ioctl_readwrite!(
    fbex_ioc_add_double_de_iv,
    FBEX_IOC_MAGIC,
    FBEX_ADD_DOUBLE_DE_IV,
    FbeOptsEV1
);

/// Inline-crypto-engine capability consumed by the lifecycle core
pub trait Fbex: Send + Sync {
    /// Hardware present? Callers must be able to distinguish "done"
    /// from "no-op because absent".
    fn is_support(&self) -> bool;

    fn install_key_to_kernel(&self, user: u32, type_: u32, iv: &KeyBlob, flag: u8) -> Result<()>;

    /// Install one engine key serving two linked encryption domains;
    /// returns the elType callers use to correlate kernel state.
    fn install_double_de_key(&self, user_single: u32, user_double: u32, iv: &KeyBlob)
        -> Result<u32>;

    /// `destroy == true` removes the key; `false` is logout-but-retain
    fn uninstall_or_lock_key(&self, user: u32, type_: u32, iv: &KeyBlob, destroy: bool)
        -> Result<()>;
}

fn fill_opts(user: u32, type_: u32, iv: &KeyBlob, flag: u8) -> Result<FbeOptsV1> {
    if iv.is_empty() || iv.len() > FBEX_IV_SIZE {
        return Err(Error::InvalidParam("bad fbex iv size".to_string()));
    }
    let mut opts = FbeOptsV1 {
        user,
        type_,
        len: iv.len() as u32,
        iv: [0u8; FBEX_IV_SIZE],
        flag,
    };
    opts.iv[..iv.len()].copy_from_slice(iv.as_slice());
    Ok(opts)
}

/// Real device-node implementation
pub struct DeviceFbex {
    cmd_node: PathBuf,
    supported: bool,
}

impl DeviceFbex {
    /// Probes the device node once at construction. ENOENT means the
    /// platform has no engine; any other open error is deferred to the
    /// first operation.
    pub fn probe(cmd_node: &Path) -> Self {
        let supported = match File::open(cmd_node) {
            Ok(_) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(node = %cmd_node.display(), error = %e, "fbex probe failed, assuming present");
                true
            }
        };
        DeviceFbex {
            cmd_node: cmd_node.to_path_buf(),
            supported,
        }
    }

    fn open(&self) -> Result<File> {
        File::open(&self.cmd_node).map_err(|e| Error::Fbex(e.to_string()))
    }
}

impl Fbex for DeviceFbex {
    fn is_support(&self) -> bool {
        self.supported
    }

    fn install_key_to_kernel(&self, user: u32, type_: u32, iv: &KeyBlob, flag: u8) -> Result<()> {
        if !self.supported {
            return Ok(());
        }
        let dev = self.open()?;
        let mut opts = fill_opts(user, type_, iv, flag)?;
        // SAFETY: opts is a fully initialized packed ABI struct.
        let res = unsafe { fbex_ioc_add_iv(dev.as_raw_fd(), &mut opts) };
        opts.iv.iter_mut().for_each(|b| *b = 0);
        res.map_err(|e| Error::Fbex(e.to_string()))?;
        Ok(())
    }

    fn install_double_de_key(
        &self,
        user_single: u32,
        user_double: u32,
        iv: &KeyBlob,
    ) -> Result<u32> {
        if !self.supported {
            return Ok(FBEX_TYPE_DOUBLE_DE);
        }
        if iv.is_empty() || iv.len() > FBEX_IV_SIZE {
            return Err(Error::InvalidParam("bad fbex iv size".to_string()));
        }
        let dev = self.open()?;
        let mut opts = FbeOptsEV1 {
            user_single,
            user_double,
            type_: FBEX_TYPE_DOUBLE_DE,
            len: iv.len() as u32,
            iv: [0u8; FBEX_IV_SIZE],
            flag: 0,
        };
        opts.iv[..iv.len()].copy_from_slice(iv.as_slice());
        // SAFETY: see install_key_to_kernel.
        let res = unsafe { fbex_ioc_add_double_de_iv(dev.as_raw_fd(), &mut opts) };
        let el_type = opts.type_;
        opts.iv.iter_mut().for_each(|b| *b = 0);
        res.map_err(|e| Error::Fbex(e.to_string()))?;
        Ok(el_type)
    }

    fn uninstall_or_lock_key(
        &self,
        user: u32,
        type_: u32,
        iv: &KeyBlob,
        destroy: bool,
    ) -> Result<()> {
        if !self.supported {
            return Ok(());
        }
        let dev = self.open()?;
        let mut opts = fill_opts(user, type_, iv, 0)?;
        // SAFETY: see install_key_to_kernel.
        let res = if destroy {
            unsafe { fbex_ioc_del_iv(dev.as_raw_fd(), &mut opts) }
        } else {
            unsafe { fbex_ioc_user_logout(dev.as_raw_fd(), &mut opts) }
        };
        opts.iv.iter_mut().for_each(|b| *b = 0);
        res.map_err(|e| Error::Fbex(e.to_string()))?;
        Ok(())
    }
}

/// Recording test double with optional one-shot failure injection.
/// Validates IVs the way the device path does and remembers the install
/// IV per (user, type); a removal with a different IV is rejected.
pub struct NoopFbex {
    supported: bool,
    installed: Mutex<HashMap<(u32, u32), Vec<u8>>>,
    fail_next: Mutex<u32>,
}

impl NoopFbex {
    pub fn new(supported: bool) -> Self {
        NoopFbex {
            supported,
            installed: Mutex::new(HashMap::new()),
            fail_next: Mutex::new(0),
        }
    }

    /// Make the next `n` install calls fail
    pub fn fail_next_installs(&self, n: u32) {
        *self.fail_next.lock() = n;
    }

    pub fn installed_count(&self) -> usize {
        self.installed.lock().len()
    }

    fn maybe_fail(&self) -> Result<()> {
        let mut remaining = self.fail_next.lock();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(Error::Fbex("injected failure".to_string()));
        }
        Ok(())
    }
}

impl Fbex for NoopFbex {
    fn is_support(&self) -> bool {
        self.supported
    }

    fn install_key_to_kernel(&self, user: u32, type_: u32, iv: &KeyBlob, _flag: u8) -> Result<()> {
        if !self.supported {
            return Ok(());
        }
        if iv.is_empty() || iv.len() > FBEX_IV_SIZE {
            return Err(Error::InvalidParam("bad fbex iv size".to_string()));
        }
        self.maybe_fail()?;
        self.installed
            .lock()
            .insert((user, type_), iv.as_slice().to_vec());
        debug!(user, type_, "noop fbex install");
        Ok(())
    }

    fn install_double_de_key(
        &self,
        user_single: u32,
        user_double: u32,
        iv: &KeyBlob,
    ) -> Result<u32> {
        if !self.supported {
            return Ok(FBEX_TYPE_DOUBLE_DE);
        }
        if iv.is_empty() || iv.len() > FBEX_IV_SIZE {
            return Err(Error::InvalidParam("bad fbex iv size".to_string()));
        }
        self.maybe_fail()?;
        let mut map = self.installed.lock();
        map.insert((user_single, FBEX_TYPE_EL3), iv.as_slice().to_vec());
        map.insert((user_double, FBEX_TYPE_EL4), iv.as_slice().to_vec());
        Ok(FBEX_TYPE_DOUBLE_DE)
    }

    fn uninstall_or_lock_key(
        &self,
        user: u32,
        type_: u32,
        iv: &KeyBlob,
        destroy: bool,
    ) -> Result<()> {
        if !self.supported {
            return Ok(());
        }
        if iv.is_empty() || iv.len() > FBEX_IV_SIZE {
            return Err(Error::InvalidParam("bad fbex iv size".to_string()));
        }
        if destroy {
            let mut map = self.installed.lock();
            if let Some(stored) = map.get(&(user, type_)) {
                if stored.as_slice() != iv.as_slice() {
                    return Err(Error::InvalidParam("fbex iv mismatch".to_string()));
                }
            }
            map.remove(&(user, type_));
        }
        Ok(())
    }
}
