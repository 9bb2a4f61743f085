//! HuksMaster - hardware-backed key wrap/unwrap
//!
//! Wraps ("shields") and unwraps the working key through the HDI with
//! bounded retry on the one transient error code. Explicitly constructed
//! and passed by reference (no global singleton); the one-HDI-session
//! semantics survive because the module-init state is guarded here.

use crate::crypto::{KeyBlob, KeyContext, GCM_NONCE_BYTES};
use crate::error::{Error, Result};
use crate::huks::param::*;
use crate::huks::{
    HdiResult, HuksHdi, HKS_ERROR_COMMUNICATION_FAILURE, HKS_ERROR_KEY_AUTH_FAILED,
    HKS_ERROR_KEY_AUTH_TIME_OUT, HKS_SUCCESS,
};
use crate::key::UserAuth;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Bounded retry on the retryable HDI code (defaults; config can tune)
pub const MAX_RETRY_TIME: u32 = 3;
pub const RETRY_INTERVAL_MS: u64 = 50;

/// Invoked when a finish call reports an expired auth token. An expired
/// token must not fall through to a stale-unlocked state, so the hook
/// forces the lock screen.
pub type ScreenLockHook = Box<dyn Fn() + Send + Sync>;

pub struct HuksMaster {
    hdi: Arc<dyn HuksHdi>,
    // Double-checked module init: cheap atomic read outside the lock,
    // re-check inside. Once true it is only reset under the same lock
    // during explicit shutdown.
    inited: AtomicBool,
    init_lock: Mutex<()>,
    screen_lock_hook: Option<ScreenLockHook>,
    retry_max: u32,
    retry_interval: Duration,
}

impl HuksMaster {
    pub fn new(hdi: Arc<dyn HuksHdi>) -> Self {
        HuksMaster {
            hdi,
            inited: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            screen_lock_hook: None,
            retry_max: MAX_RETRY_TIME,
            retry_interval: Duration::from_millis(RETRY_INTERVAL_MS),
        }
    }

    pub fn with_screen_lock_hook(mut self, hook: ScreenLockHook) -> Self {
        self.screen_lock_hook = Some(hook);
        self
    }

    pub fn with_retry(mut self, max: u32, interval_ms: u64) -> Self {
        self.retry_max = max.max(1);
        self.retry_interval = Duration::from_millis(interval_ms);
        self
    }

    fn ensure_init(&self) -> Result<()> {
        if self.inited.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.init_lock.lock();
        if self.inited.load(Ordering::Acquire) {
            return Ok(());
        }
        self.retry("module_init", || {
            let code = self.hdi.module_init();
            if code == HKS_SUCCESS {
                Ok(())
            } else {
                Err(code)
            }
        })?;
        self.inited.store(true, Ordering::Release);
        Ok(())
    }

    /// Tear down the HDI module. Safe to call more than once.
    pub fn destroy(&self) {
        let _guard = self.init_lock.lock();
        if self.inited.swap(false, Ordering::AcqRel) {
            let code = self.hdi.module_destroy();
            if code != HKS_SUCCESS {
                warn!(code, "HUKS module destroy failed");
            }
        }
    }

    /// Retry `f` on the transient HDI code, then map the final status.
    fn retry<T>(&self, op: &'static str, f: impl Fn() -> HdiResult<T>) -> Result<T> {
        let mut last = HKS_ERROR_COMMUNICATION_FAILURE;
        for attempt in 0..self.retry_max {
            match f() {
                Ok(v) => return Ok(v),
                Err(code) if code == HKS_ERROR_COMMUNICATION_FAILURE => {
                    debug!(op, attempt, "retryable HUKS failure");
                    last = code;
                    std::thread::sleep(self.retry_interval);
                }
                Err(code) => return Err(self.map_fatal(op, code)),
            }
        }
        error!(op, code = last, "HUKS retry exhausted");
        Err(Error::HdiRetryExhausted { op, code: last })
    }

    fn map_fatal(&self, op: &'static str, code: i32) -> Error {
        error!(op, code, "HUKS operation failed");
        match code {
            HKS_ERROR_KEY_AUTH_FAILED => Error::AuthFailed,
            HKS_ERROR_KEY_AUTH_TIME_OUT => {
                if let Some(hook) = &self.screen_lock_hook {
                    hook();
                }
                Error::AuthTimeout
            }
            _ => Error::Hdi { op, code },
        }
    }

    /// Generate a new shield key in the secure element.
    ///
    /// When both `auth.secret` and `auth.token` are present the key is
    /// bound to a secure-access policy: decrypts require a live auth
    /// token from the bound secure uid, within a 30 s window.
    pub fn generate_key(&self, auth: &UserAuth) -> Result<KeyBlob> {
        self.ensure_init()?;

        let mut ps = HksParamSet::new();
        ps.add_uint(HKS_TAG_ALGORITHM, HKS_ALG_AES)
            .add_uint(HKS_TAG_KEY_SIZE, HKS_AES_KEY_SIZE_256)
            .add_uint(
                HKS_TAG_PURPOSE,
                HKS_KEY_PURPOSE_ENCRYPT | HKS_KEY_PURPOSE_DECRYPT,
            )
            .add_uint(HKS_TAG_BLOCK_MODE, HKS_MODE_GCM)
            .add_uint(HKS_TAG_PADDING, HKS_PADDING_NONE)
            .add_bool(HKS_TAG_IS_KEY_ALIAS, false);

        if !auth.secret.is_empty() && !auth.token.is_empty() {
            ps.add_uint(
                HKS_TAG_USER_AUTH_TYPE,
                HKS_USER_AUTH_TYPE_PIN | HKS_USER_AUTH_TYPE_FACE | HKS_USER_AUTH_TYPE_FINGERPRINT,
            )
            .add_uint(HKS_TAG_AUTH_TIMEOUT, HKS_AUTH_TIMEOUT_SECS)
            .add_uint(HKS_TAG_CHALLENGE_TYPE, HKS_CHALLENGE_TYPE_NONE)
            .add_ulong(HKS_TAG_USER_AUTH_SECURE_UID, auth.secure_uid);
        }

        let blob = self.retry("generate_key", || self.hdi.generate_key(&ps))?;
        Ok(KeyBlob::from(blob))
    }

    /// Encrypt `plain` under the shield in `ctx`.
    ///
    /// `is_need_new_nonce == true` draws a fresh random nonce into
    /// `ctx.nonce` (persisted by the caller in the composed format);
    /// `false` uses the caller-supplied salt-derived nonce so a legacy
    /// decrypt finds matching parameters.
    pub fn encrypt_key(
        &self,
        ctx: &mut KeyContext,
        auth: &UserAuth,
        plain: &KeyBlob,
        is_need_new_nonce: bool,
    ) -> Result<KeyBlob> {
        if ctx.shield.is_empty() || plain.is_empty() {
            return Err(Error::InvalidParam("empty shield or plaintext".to_string()));
        }
        self.ensure_init()?;

        let ps = self.gen_huks_option_param(ctx, auth, HKS_KEY_PURPOSE_ENCRYPT, is_need_new_nonce)?;
        let handle = self.retry("encrypt_init", || {
            self.hdi.init_session(ctx.shield.as_slice(), &ps)
        })?;
        let out = self.retry("encrypt_finish", || {
            self.hdi.finish_session(handle, &ps, plain.as_slice())
        })?;
        Ok(KeyBlob::from(out))
    }

    /// Decrypt a shield-wrapped blob. This is where an expired or wrong
    /// auth token surfaces, as an auth-class error.
    pub fn decrypt_key(
        &self,
        ctx: &KeyContext,
        auth: &UserAuth,
        input: &KeyBlob,
    ) -> Result<KeyBlob> {
        if ctx.shield.is_empty() || input.is_empty() {
            return Err(Error::InvalidParam(
                "empty shield or ciphertext".to_string(),
            ));
        }
        self.ensure_init()?;

        let mut ps = HksParamSet::new();
        base_gcm_params(&mut ps, HKS_KEY_PURPOSE_DECRYPT);
        append_nonce_aad_token(ctx, auth, &mut ps)?;

        let handle = self.retry("decrypt_init", || {
            self.hdi.init_session(ctx.shield.as_slice(), &ps)
        })?;
        let out = self.retry("decrypt_finish", || {
            self.hdi.finish_session(handle, &ps, input.as_slice())
        })?;
        Ok(KeyBlob::from(out))
    }

    /// Re-wrap a stale shield at the current blob version.
    ///
    /// Returns `Ok(false)` when the shield is already current; that is
    /// not an error.
    pub fn upgrade_key(&self, ctx: &mut KeyContext) -> Result<bool> {
        if ctx.shield.is_empty() {
            return Err(Error::InvalidParam("empty shield".to_string()));
        }
        self.ensure_init()?;

        let version = self.retry("key_version", || self.hdi.key_version(ctx.shield.as_slice()))?;
        let current = self.hdi.current_version();
        if version >= current {
            return Ok(false);
        }

        let mut ps = HksParamSet::new();
        ps.add_uint(HKS_TAG_KEY_VERSION, current);
        let upgraded = self.retry("upgrade_key", || {
            self.hdi.upgrade_key(ctx.shield.as_slice(), &ps)
        })?;
        ctx.shield = KeyBlob::from(upgraded);
        Ok(true)
    }

    /// Hardware RNG. An empty blob signals RNG failure, never a valid
    /// zero-length key; callers must check.
    pub fn generate_random_key(&self, len: usize) -> KeyBlob {
        if self.ensure_init().is_err() {
            return KeyBlob::new();
        }
        match self.hdi.generate_random(len) {
            Ok(bytes) if bytes.len() == len => KeyBlob::from(bytes),
            _ => KeyBlob::new(),
        }
    }

    /// Build the operation param set, routing nonce/aad appending by the
    /// exact `is_need_new_nonce` boolean.
    fn gen_huks_option_param(
        &self,
        ctx: &mut KeyContext,
        auth: &UserAuth,
        purpose: u32,
        is_need_new_nonce: bool,
    ) -> Result<HksParamSet> {
        let mut ps = HksParamSet::new();
        base_gcm_params(&mut ps, purpose);
        if !is_need_new_nonce {
            append_nonce_aad_token(ctx, auth, &mut ps)?;
        } else {
            append_new_nonce_aad_token(ctx, auth, &mut ps)?;
        }
        Ok(ps)
    }
}

fn base_gcm_params(ps: &mut HksParamSet, purpose: u32) {
    ps.add_uint(HKS_TAG_ALGORITHM, HKS_ALG_AES)
        .add_uint(HKS_TAG_KEY_SIZE, HKS_AES_KEY_SIZE_256)
        .add_uint(HKS_TAG_PURPOSE, purpose)
        .add_uint(HKS_TAG_BLOCK_MODE, HKS_MODE_GCM)
        .add_uint(HKS_TAG_PADDING, HKS_PADDING_NONE);
}

// The two helpers below look similar but are not interchangeable: the
// caller-nonce variant rejects a missing nonce or aad outright and sends
// the token whenever one exists; the fresh-nonce variant overwrites
// ctx.nonce, tolerates an absent aad, and sends the token only when the
// secret is also present. Selection is by `is_need_new_nonce` in
// gen_huks_option_param.

/// Caller-supplied (salt-derived) nonce path, used by every decrypt and
/// by legacy re-encrypts
fn append_nonce_aad_token(ctx: &KeyContext, auth: &UserAuth, ps: &mut HksParamSet) -> Result<()> {
    if ctx.nonce.is_empty() {
        return Err(Error::InvalidParam("missing nonce".to_string()));
    }
    if ctx.aad.is_empty() {
        return Err(Error::InvalidParam("missing aad".to_string()));
    }
    ps.add_bytes(HKS_TAG_NONCE, ctx.nonce.as_slice());
    ps.add_bytes(HKS_TAG_ASSOCIATED_DATA, ctx.aad.as_slice());
    if !auth.token.is_empty() {
        ps.add_bytes(HKS_TAG_AUTH_TOKEN, auth.token.as_slice());
    }
    Ok(())
}

/// Fresh-nonce path, used by new-generation encrypts
fn append_new_nonce_aad_token(
    ctx: &mut KeyContext,
    auth: &UserAuth,
    ps: &mut HksParamSet,
) -> Result<()> {
    ctx.nonce = KeyBlob::random(GCM_NONCE_BYTES);
    if ctx.nonce.is_empty() {
        return Err(Error::RandomFailed);
    }
    ps.add_bytes(HKS_TAG_NONCE, ctx.nonce.as_slice());
    if !ctx.aad.is_empty() {
        ps.add_bytes(HKS_TAG_ASSOCIATED_DATA, ctx.aad.as_slice());
    }
    if !auth.token.is_empty() && !auth.secret.is_empty() {
        ps.add_bytes(HKS_TAG_AUTH_TOKEN, auth.token.as_slice());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{hash_with_prefix, HASH_PREFIX_AAD, HASH_PREFIX_NONCE};
    use crate::huks::SoftHuksHdi;
    use std::sync::atomic::AtomicU32;

    fn master() -> HuksMaster {
        HuksMaster::new(Arc::new(SoftHuksHdi::ephemeral()))
    }

    fn ctx_with(shield: KeyBlob, salt: &[u8]) -> KeyContext {
        KeyContext {
            shield,
            nonce: hash_with_prefix(HASH_PREFIX_NONCE, salt, GCM_NONCE_BYTES).unwrap(),
            aad: hash_with_prefix(HASH_PREFIX_AAD, salt, 16).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_wrap_unwrap_roundtrip_no_auth() {
        let m = master();
        let auth = UserAuth::default();
        let shield = m.generate_key(&auth).unwrap();
        let mut ctx = ctx_with(shield, b"salt");

        let plain = KeyBlob::random(32);
        let wrapped = m.encrypt_key(&mut ctx, &auth, &plain, false).unwrap();
        let unwrapped = m.decrypt_key(&ctx, &auth, &wrapped).unwrap();
        assert_eq!(unwrapped.as_slice(), plain.as_slice());
    }

    #[test]
    fn test_new_nonce_overwrites_ctx_nonce() {
        let m = master();
        let auth = UserAuth::default();
        let shield = m.generate_key(&auth).unwrap();
        let mut ctx = ctx_with(shield, b"salt");
        let derived = ctx.nonce.clone();

        let plain = KeyBlob::random(32);
        let wrapped = m.encrypt_key(&mut ctx, &auth, &plain, true).unwrap();
        assert_ne!(ctx.nonce.as_slice(), derived.as_slice());
        // decrypt must use the persisted fresh nonce, not the derived one
        let unwrapped = m.decrypt_key(&ctx, &auth, &wrapped).unwrap();
        assert_eq!(unwrapped.as_slice(), plain.as_slice());
    }

    #[test]
    fn test_secure_access_wrong_uid_rejected() {
        let m = master();
        let good = UserAuth::with_credentials(b"1234", 77);
        let shield = m.generate_key(&good).unwrap();
        let mut ctx = ctx_with(shield, b"salt");

        let plain = KeyBlob::random(32);
        let wrapped = m.encrypt_key(&mut ctx, &good, &plain, false).unwrap();

        let bad = UserAuth::with_credentials(b"1234", 78);
        let err = m.decrypt_key(&ctx, &bad, &wrapped).unwrap_err();
        assert!(err.is_auth_error());
    }

    #[test]
    fn test_secure_access_missing_token_rejected() {
        let m = master();
        let good = UserAuth::with_credentials(b"1234", 77);
        let shield = m.generate_key(&good).unwrap();
        let mut ctx = ctx_with(shield, b"salt");

        let plain = KeyBlob::random(32);
        let wrapped = m.encrypt_key(&mut ctx, &good, &plain, false).unwrap();
        let err = m
            .decrypt_key(&ctx, &UserAuth::default(), &wrapped)
            .unwrap_err();
        assert!(err.is_auth_error());
    }

    #[test]
    fn test_expired_token_fires_screen_lock_hook() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_in_hook = fired.clone();
        let m = HuksMaster::new(Arc::new(SoftHuksHdi::ephemeral()))
            .with_screen_lock_hook(Box::new(move || {
                fired_in_hook.store(true, Ordering::SeqCst);
            }));

        let good = UserAuth::with_credentials(b"1234", 77);
        let shield = m.generate_key(&good).unwrap();
        let mut ctx = ctx_with(shield, b"salt");
        let wrapped = m
            .encrypt_key(&mut ctx, &good, &KeyBlob::random(32), false)
            .unwrap();

        let stale = UserAuth::with_stale_token(b"1234", 77);
        let err = m.decrypt_key(&ctx, &stale, &wrapped).unwrap_err();
        assert!(matches!(err, Error::AuthTimeout));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_upgrade_key_noop_when_current() {
        let m = master();
        let auth = UserAuth::default();
        let shield = m.generate_key(&auth).unwrap();
        let mut ctx = ctx_with(shield, b"salt");
        assert!(!m.upgrade_key(&mut ctx).unwrap());
    }

    #[test]
    fn test_upgrade_key_rewraps_stale_shield() {
        let hdi = Arc::new(SoftHuksHdi::ephemeral());
        let m = HuksMaster::new(hdi.clone());
        let auth = UserAuth::default();
        let shield = m.generate_key(&auth).unwrap();
        let stale = hdi.downgrade_for_test(shield.as_slice());
        let mut ctx = ctx_with(KeyBlob::from(stale), b"salt");

        let plain = KeyBlob::random(32);
        let wrapped = m.encrypt_key(&mut ctx, &auth, &plain, false).unwrap();

        assert!(m.upgrade_key(&mut ctx).unwrap());
        assert!(!m.upgrade_key(&mut ctx).unwrap());
        // old ciphertext still decrypts under the re-wrapped shield
        let unwrapped = m.decrypt_key(&ctx, &auth, &wrapped).unwrap();
        assert_eq!(unwrapped.as_slice(), plain.as_slice());
    }

    #[test]
    fn test_generate_random_key() {
        let m = master();
        let k = m.generate_random_key(32);
        assert_eq!(k.len(), 32);
    }

    /// HDI wrapper that fails the first `fail_count` calls with the
    /// retryable code
    struct FlakyHdi {
        inner: SoftHuksHdi,
        remaining: AtomicU32,
    }

    impl FlakyHdi {
        fn new(fail_count: u32) -> Self {
            FlakyHdi {
                inner: SoftHuksHdi::ephemeral(),
                remaining: AtomicU32::new(fail_count),
            }
        }

        fn trip(&self) -> bool {
            self.remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
        }
    }

    impl HuksHdi for FlakyHdi {
        fn module_init(&self) -> i32 {
            self.inner.module_init()
        }
        fn module_destroy(&self) -> i32 {
            self.inner.module_destroy()
        }
        fn generate_key(&self, params: &HksParamSet) -> HdiResult<Vec<u8>> {
            if self.trip() {
                return Err(HKS_ERROR_COMMUNICATION_FAILURE);
            }
            self.inner.generate_key(params)
        }
        fn init_session(&self, key: &[u8], params: &HksParamSet) -> HdiResult<u64> {
            self.inner.init_session(key, params)
        }
        fn finish_session(
            &self,
            handle: u64,
            params: &HksParamSet,
            input: &[u8],
        ) -> HdiResult<Vec<u8>> {
            self.inner.finish_session(handle, params, input)
        }
        fn upgrade_key(&self, old_key: &[u8], params: &HksParamSet) -> HdiResult<Vec<u8>> {
            self.inner.upgrade_key(old_key, params)
        }
        fn key_version(&self, key: &[u8]) -> HdiResult<u32> {
            self.inner.key_version(key)
        }
        fn current_version(&self) -> u32 {
            self.inner.current_version()
        }
        fn generate_random(&self, len: usize) -> HdiResult<Vec<u8>> {
            self.inner.generate_random(len)
        }
    }

    #[test]
    fn test_retry_recovers_from_transient_failures() {
        let m = HuksMaster::new(Arc::new(FlakyHdi::new(MAX_RETRY_TIME - 1)));
        assert!(m.generate_key(&UserAuth::default()).is_ok());
    }

    #[test]
    fn test_retry_exhaustion_is_fatal() {
        let m = HuksMaster::new(Arc::new(FlakyHdi::new(MAX_RETRY_TIME + 2)));
        let err = m.generate_key(&UserAuth::default()).unwrap_err();
        assert!(matches!(err, Error::HdiRetryExhausted { .. }));
    }

    #[test]
    fn test_retry_budget_is_tunable() {
        let m = HuksMaster::new(Arc::new(FlakyHdi::new(MAX_RETRY_TIME))).with_retry(
            MAX_RETRY_TIME + 1,
            1,
        );
        assert!(m.generate_key(&UserAuth::default()).is_ok());
    }
}
