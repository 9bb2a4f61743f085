//! HDI parameter sets
//!
//! Tag-value parameter lists passed across the HDI boundary. The tag
//! numbering keeps the HDI scheme: the top nibble encodes the value
//! type, the low bits the tag id. The builder owns its storage, so a
//! param set is released on every exit path without explicit free calls.

/// Tag type masks (upper nibble of the tag word)
pub const HKS_TAG_TYPE_UINT: u32 = 2 << 28;
pub const HKS_TAG_TYPE_ULONG: u32 = 3 << 28;
pub const HKS_TAG_TYPE_BOOL: u32 = 4 << 28;
pub const HKS_TAG_TYPE_BYTES: u32 = 5 << 28;

/// Parameter tags used by this daemon
pub const HKS_TAG_ALGORITHM: u32 = HKS_TAG_TYPE_UINT | 1;
pub const HKS_TAG_PURPOSE: u32 = HKS_TAG_TYPE_UINT | 2;
pub const HKS_TAG_KEY_SIZE: u32 = HKS_TAG_TYPE_UINT | 3;
pub const HKS_TAG_PADDING: u32 = HKS_TAG_TYPE_UINT | 5;
pub const HKS_TAG_BLOCK_MODE: u32 = HKS_TAG_TYPE_UINT | 6;
pub const HKS_TAG_ASSOCIATED_DATA: u32 = HKS_TAG_TYPE_BYTES | 8;
pub const HKS_TAG_NONCE: u32 = HKS_TAG_TYPE_BYTES | 9;
pub const HKS_TAG_USER_AUTH_TYPE: u32 = HKS_TAG_TYPE_UINT | 304;
pub const HKS_TAG_AUTH_TIMEOUT: u32 = HKS_TAG_TYPE_UINT | 305;
pub const HKS_TAG_AUTH_TOKEN: u32 = HKS_TAG_TYPE_BYTES | 306;
pub const HKS_TAG_USER_AUTH_SECURE_UID: u32 = HKS_TAG_TYPE_ULONG | 307;
pub const HKS_TAG_CHALLENGE_TYPE: u32 = HKS_TAG_TYPE_UINT | 309;
pub const HKS_TAG_KEY_VERSION: u32 = HKS_TAG_TYPE_UINT | 515;
pub const HKS_TAG_IS_KEY_ALIAS: u32 = HKS_TAG_TYPE_BOOL | 1001;

/// Parameter values
pub const HKS_ALG_AES: u32 = 20;
pub const HKS_AES_KEY_SIZE_256: u32 = 256;
pub const HKS_KEY_PURPOSE_ENCRYPT: u32 = 1;
pub const HKS_KEY_PURPOSE_DECRYPT: u32 = 2;
pub const HKS_PADDING_NONE: u32 = 0;
pub const HKS_MODE_GCM: u32 = 32;
pub const HKS_USER_AUTH_TYPE_PIN: u32 = 1 << 0;
pub const HKS_USER_AUTH_TYPE_FACE: u32 = 1 << 1;
pub const HKS_USER_AUTH_TYPE_FINGERPRINT: u32 = 1 << 2;
pub const HKS_CHALLENGE_TYPE_NONE: u32 = 2;
/// Secure-access window after a successful authentication, seconds
pub const HKS_AUTH_TIMEOUT_SECS: u32 = 30;

/// One tagged parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HksValue {
    Uint(u32),
    Ulong(u64),
    Bool(bool),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct HksParam {
    pub tag: u32,
    pub value: HksValue,
}

/// Ordered parameter list for one HDI call
#[derive(Debug, Clone, Default)]
pub struct HksParamSet {
    params: Vec<HksParam>,
}

impl HksParamSet {
    pub fn new() -> Self {
        HksParamSet { params: Vec::new() }
    }

    pub fn add_uint(&mut self, tag: u32, value: u32) -> &mut Self {
        self.params.push(HksParam {
            tag,
            value: HksValue::Uint(value),
        });
        self
    }

    pub fn add_ulong(&mut self, tag: u32, value: u64) -> &mut Self {
        self.params.push(HksParam {
            tag,
            value: HksValue::Ulong(value),
        });
        self
    }

    pub fn add_bool(&mut self, tag: u32, value: bool) -> &mut Self {
        self.params.push(HksParam {
            tag,
            value: HksValue::Bool(value),
        });
        self
    }

    pub fn add_bytes(&mut self, tag: u32, value: &[u8]) -> &mut Self {
        self.params.push(HksParam {
            tag,
            value: HksValue::Bytes(value.to_vec()),
        });
        self
    }

    pub fn get(&self, tag: u32) -> Option<&HksValue> {
        self.params.iter().find(|p| p.tag == tag).map(|p| &p.value)
    }

    pub fn get_uint(&self, tag: u32) -> Option<u32> {
        match self.get(tag) {
            Some(HksValue::Uint(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_ulong(&self, tag: u32) -> Option<u64> {
        match self.get(tag) {
            Some(HksValue::Ulong(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bytes(&self, tag: u32) -> Option<&[u8]> {
        match self.get(tag) {
            Some(HksValue::Bytes(v)) => Some(v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}
