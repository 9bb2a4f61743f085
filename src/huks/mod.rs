//! Hardware Unified Key Store (HUKS) integration
//!
//! `HuksMaster` is the only component that understands the shield blob;
//! everything else treats it as opaque bytes safe to store on disk. The
//! actual hardware is reached through the narrow [`HuksHdi`] trait, with
//! a software backend for tests and hardware-absent bring-up.

mod master;
mod param;
mod soft;

pub use master::{HuksMaster, ScreenLockHook, MAX_RETRY_TIME, RETRY_INTERVAL_MS};
pub use param::{HksParam, HksParamSet, HksValue};
pub use soft::SoftHuksHdi;

/// HDI status codes. These are the daemon's contract with the vendor
/// service; only `HKS_ERROR_COMMUNICATION_FAILURE` is retried.
pub const HKS_SUCCESS: i32 = 0;
pub const HKS_ERROR_COMMUNICATION_FAILURE: i32 = -6;
pub const HKS_ERROR_CRYPTO_ENGINE_ERROR: i32 = -17;
pub const HKS_ERROR_INVALID_KEY_INFO: i32 = -18;
pub const HKS_ERROR_KEY_AUTH_FAILED: i32 = -26;
pub const HKS_ERROR_KEY_AUTH_TIME_OUT: i32 = -47;
pub const HKS_ERROR_NOT_SUPPORTED: i32 = -101;

/// Result carrying a raw HDI status code on failure
pub type HdiResult<T> = std::result::Result<T, i32>;

/// The Hardware Driver Interface boundary.
///
/// One method per HDI round-trip; every call is synchronous and may
/// block. Session state lives behind the returned handle.
pub trait HuksHdi: Send + Sync {
    fn module_init(&self) -> i32;

    fn module_destroy(&self) -> i32;

    /// Generate a key inside the secure element and return its wrapped
    /// form. The wrapped blob is useless outside the hardware.
    fn generate_key(&self, params: &HksParamSet) -> HdiResult<Vec<u8>>;

    /// Open a crypto session using a wrapped key blob
    fn init_session(&self, key: &[u8], params: &HksParamSet) -> HdiResult<u64>;

    /// Run the operation to completion and close the session
    fn finish_session(&self, handle: u64, params: &HksParamSet, input: &[u8])
        -> HdiResult<Vec<u8>>;

    /// Re-wrap an old key blob at the current blob version
    fn upgrade_key(&self, old_key: &[u8], params: &HksParamSet) -> HdiResult<Vec<u8>>;

    /// Blob version embedded in a wrapped key
    fn key_version(&self, key: &[u8]) -> HdiResult<u32>;

    /// Version newly wrapped blobs carry
    fn current_version(&self) -> u32;

    /// Hardware RNG
    fn generate_random(&self, len: usize) -> HdiResult<Vec<u8>>;
}
