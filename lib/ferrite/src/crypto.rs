use ctor::ctor;
use libsodium_sys;
use std::ffi::c_void;
use std::ops::Deref;

pub const SHA256_SIZE: usize = libsodium_sys::crypto_hash_sha256_BYTES as usize;
pub const HMAC_SHA256_SIZE: usize = libsodium_sys::crypto_auth_hmacsha256_BYTES as usize;

/// Initialize the sodium infrastructure
#[ctor]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

/// Computes the SHA-256 digest of `data` into `out`.
#[inline]
pub fn sha256(out: &mut [u8; SHA256_SIZE], data: &[u8]) {
    unsafe {
        libsodium_sys::crypto_hash_sha256(out.as_mut_ptr(), data.as_ptr(), data.len() as u64);
    }
}

/// Computes HMAC-SHA256 over `data` with an arbitrary-length `key` into `out`.
#[inline]
pub fn hmac_sha256(out: &mut [u8; HMAC_SHA256_SIZE], key: &[u8], data: &[u8]) {
    unsafe {
        let mut state = std::mem::MaybeUninit::<libsodium_sys::crypto_auth_hmacsha256_state>::uninit();

        libsodium_sys::crypto_auth_hmacsha256_init(state.as_mut_ptr(), key.as_ptr(), key.len());
        libsodium_sys::crypto_auth_hmacsha256_update(
            state.as_mut_ptr(),
            data.as_ptr(),
            data.len() as u64,
        );
        libsodium_sys::crypto_auth_hmacsha256_final(state.as_mut_ptr(), out.as_mut_ptr());

        // The state holds a keyed hash mid-state derived from the key.
        libsodium_sys::sodium_memzero(
            state.as_mut_ptr() as *mut c_void,
            std::mem::size_of::<libsodium_sys::crypto_auth_hmacsha256_state>(),
        );
    }
}

/// HKDF-SHA256 (RFC 5869) composed from the HMAC primitive. Fills the whole
/// of `okm`, which must not exceed 255 hash blocks (8160 bytes).
pub fn hkdf_sha256(okm: &mut [u8], ikm: &[u8], salt: &[u8], info: &[u8]) {
    if okm.len() > 255 * HMAC_SHA256_SIZE {
        panic!("HKDF output length {} exceeds the RFC 5869 bound", okm.len());
    }

    // Extract
    let mut prk = [0u8; HMAC_SHA256_SIZE];
    hmac_sha256(&mut prk, salt, ikm);

    // Expand
    let mut block = [0u8; HMAC_SHA256_SIZE];
    let mut filled = 0usize;
    let mut counter = 1u8;

    while filled < okm.len() {
        let mut message = Vec::with_capacity(HMAC_SHA256_SIZE + info.len() + 1);
        if counter > 1 {
            message.extend_from_slice(&block);
        }
        message.extend_from_slice(info);
        message.push(counter);

        hmac_sha256(&mut block, &prk, &message);

        let take = std::cmp::min(HMAC_SHA256_SIZE, okm.len() - filled);
        okm[filled..filled + take].copy_from_slice(&block[..take]);

        filled += take;
        counter += 1;
        wipe(&mut message);
    }

    wipe(&mut prk);
    wipe(&mut block);
}

/// Constant-time comparison of two byte slices. Slices of unequal length
/// compare unequal without touching the contents.
#[inline]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    unsafe {
        libsodium_sys::sodium_memcmp(
            a.as_ptr() as *const c_void,
            b.as_ptr() as *const c_void,
            a.len(),
        ) == 0
    }
}

/// Overwrites the buffer with zeros through a barrier the compiler cannot
/// elide.
#[inline]
pub fn wipe(buf: &mut [u8]) {
    unsafe {
        libsodium_sys::sodium_memzero(buf.as_mut_ptr() as *mut c_void, buf.len());
    }
}

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut c_void, out.len());
    }
}

/// Shared-secret container that wipes its storage on drop.
pub struct SecretKey {
    data: Vec<u8>,
}

impl SecretKey {
    #[inline]
    pub fn new(data: Vec<u8>) -> SecretKey {
        SecretKey { data }
    }

    #[inline]
    pub fn from_str(secret: &str) -> SecretKey {
        SecretKey::new(secret.as_bytes().to_vec())
    }
}

impl Deref for SecretKey {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        wipe(&mut self.data);
    }
}

impl Clone for SecretKey {
    fn clone(&self) -> SecretKey {
        SecretKey::new(self.data.clone())
    }
}

/// Which known-answer test failed during `self_test`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SelfTestFailure {
    Sha256,
    HmacSha256,
    HkdfSha256,
}

// NIST FIPS 180-2 appendix B.1
const KAT_SHA256_ABC: [u8; 32] = [
    0xba, 0x78, 0x16, 0xbf, 0x8f, 0x01, 0xcf, 0xea, 0x41, 0x41, 0x40, 0xde, 0x5d, 0xae, 0x22,
    0x23, 0xb0, 0x03, 0x61, 0xa3, 0x96, 0x17, 0x7a, 0x9c, 0xb4, 0x10, 0xff, 0x61, 0xf2, 0x00,
    0x15, 0xad,
];

// RFC 4231 test case 2
const KAT_HMAC_JEFE: [u8; 32] = [
    0x5b, 0xdc, 0xc1, 0x46, 0xbf, 0x60, 0x75, 0x4e, 0x6a, 0x04, 0x24, 0x26, 0x08, 0x95, 0x75,
    0xc7, 0x5a, 0x00, 0x3f, 0x08, 0x9d, 0x27, 0x39, 0x83, 0x9d, 0xec, 0x58, 0xb9, 0x64, 0xec,
    0x38, 0x43,
];

// RFC 5869 test case 1
const KAT_HKDF_OKM: [u8; 42] = [
    0x3c, 0xb2, 0x5f, 0x25, 0xfa, 0xac, 0xd5, 0x7a, 0x90, 0x43, 0x4f, 0x64, 0xd0, 0x36, 0x2f,
    0x2a, 0x2d, 0x2d, 0x0a, 0x90, 0xcf, 0x1a, 0x5a, 0x4c, 0x5d, 0xb0, 0x2d, 0x56, 0xec, 0xc4,
    0xc5, 0xbf, 0x34, 0x00, 0x72, 0x08, 0xd5, 0xb8, 0x87, 0x18, 0x58, 0x65,
];

/// Runs the known-answer tests for every primitive the handshake relies on.
/// Callers refuse to start when this fails.
pub fn self_test() -> Result<(), SelfTestFailure> {
    let mut digest = [0u8; SHA256_SIZE];
    sha256(&mut digest, b"abc");
    if !ct_eq(&digest, &KAT_SHA256_ABC) {
        return Err(SelfTestFailure::Sha256);
    }

    let mut tag = [0u8; HMAC_SHA256_SIZE];
    hmac_sha256(&mut tag, b"Jefe", b"what do ya want for nothing?");
    if !ct_eq(&tag, &KAT_HMAC_JEFE) {
        return Err(SelfTestFailure::HmacSha256);
    }

    let ikm = [0x0bu8; 22];
    let salt: Vec<u8> = (0x00u8..=0x0c).collect();
    let info: Vec<u8> = (0xf0u8..=0xf9).collect();
    let mut okm = [0u8; 42];
    hkdf_sha256(&mut okm, &ikm, &salt, &info);
    if !ct_eq(&okm, &KAT_HKDF_OKM) {
        return Err(SelfTestFailure::HkdfSha256);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_test_passes() {
        self_test().unwrap();
    }

    #[test]
    fn test_hmac_rfc4231_case_1() {
        // Key of twenty 0x0b bytes, data "Hi There".
        let key = [0x0bu8; 20];
        let expected: [u8; 32] = [
            0xb0, 0x34, 0x4c, 0x61, 0xd8, 0xdb, 0x38, 0x53, 0x5c, 0xa8, 0xaf, 0xce, 0xaf, 0x0b,
            0xf1, 0x2b, 0x88, 0x1d, 0xc2, 0x00, 0xc9, 0x83, 0x3d, 0xa7, 0x26, 0xe9, 0x37, 0x6c,
            0x2e, 0x32, 0xcf, 0xf7,
        ];

        let mut tag = [0u8; HMAC_SHA256_SIZE];
        hmac_sha256(&mut tag, &key, b"Hi There");

        assert_eq!(tag, expected);
    }

    #[test]
    fn test_ct_eq_lengths_and_content() {
        assert!(ct_eq(b"same", b"same"));
        assert!(!ct_eq(b"same", b"sam"));
        assert!(!ct_eq(b"same", b"sane"));
        assert!(ct_eq(b"", b""));
    }

    #[test]
    fn test_wipe_clears_contents() {
        let mut buf = vec![0xffu8; 64];
        wipe(&mut buf);
        assert!(buf.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn test_random_bytes_fills() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        random_bytes(&mut a);
        random_bytes(&mut b);
        // Two 256-bit draws colliding means the RNG is broken.
        assert_ne!(a, b);
    }

    #[test]
    fn test_hkdf_differs_by_label() {
        let mut tag_a = [0u8; 16];
        let mut tag_b = [0u8; 16];
        hkdf_sha256(&mut tag_a, b"secret", b"nonce", b"label-a");
        hkdf_sha256(&mut tag_b, b"secret", b"nonce", b"label-b");
        assert_ne!(tag_a, tag_b);
    }

    #[test]
    fn test_secret_key_derefs() {
        let key = SecretKey::from_str("hunter2");
        assert_eq!(&*key, b"hunter2");
    }
}
