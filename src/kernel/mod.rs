//! Kernel-facing ioctl boundary
//!
//! Thin marshaling for the fscrypt key-management ABI and the vendor
//! inline-crypto-engine (FBEX) character devices. The structs here are
//! ABI: explicit-width fields, no reordering, sizes asserted at compile
//! time. The lifecycle core consumes these only through the `KeyCtrl`
//! and `Fbex` traits.

pub mod fbex;
pub mod fscrypt;

pub use fbex::{DeviceFbex, Fbex, NoopFbex};
pub use fscrypt::{DeviceKeyCtrl, KeyCtrl, NoopKeyCtrl};

use std::sync::Arc;

/// Bundle of kernel-facing capabilities handed to the key lifecycle
#[derive(Clone)]
pub struct KernelServices {
    pub key_ctrl: Arc<dyn KeyCtrl>,
    pub fbex: Arc<dyn Fbex>,
}

impl KernelServices {
    pub fn new(key_ctrl: Arc<dyn KeyCtrl>, fbex: Arc<dyn Fbex>) -> Self {
        KernelServices { key_ctrl, fbex }
    }

    /// In-memory doubles for tests
    pub fn noop() -> Self {
        KernelServices {
            key_ctrl: Arc::new(NoopKeyCtrl::new()),
            fbex: Arc::new(NoopFbex::new(true)),
        }
    }
}
