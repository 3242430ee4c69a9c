use rand::RngCore;
use sha2::{Digest, Sha256};

/// Marker prefix for admin secrets that have already been hashed in
/// `config.yaml`. The scheme is an unsalted sha256 kept for compatibility
/// with existing config files; see the warning in
/// `modules::system::config`.
pub const ENCRYPT_PREFIX: &str = "$encrypt$";

pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    format!("{:x}", digest)
}

pub fn encrypt_secret(plain: &str) -> String {
    format!("{}{}", ENCRYPT_PREFIX, sha256_hex(plain))
}

pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPT_PREFIX)
}

/// Compares a submitted plaintext secret against a stored value that may be
/// either plaintext (pre-first-boot) or `$encrypt$<sha256hex>`.
pub fn verify_secret(submitted: &str, stored: &str) -> bool {
    if let Some(hash) = stored.strip_prefix(ENCRYPT_PREFIX) {
        constant_time_str_eq(&sha256_hex(submitted), hash)
    } else {
        constant_time_str_eq(submitted, stored)
    }
}

pub fn constant_time_str_eq(left: &str, right: &str) -> bool {
    let left_bytes = left.as_bytes();
    let right_bytes = right.as_bytes();
    let max_len = left_bytes.len().max(right_bytes.len());
    let mut diff = left_bytes.len() ^ right_bytes.len();

    for i in 0..max_len {
        let l = left_bytes.get(i).copied().unwrap_or(0);
        let r = right_bytes.get(i).copied().unwrap_or(0);
        diff |= (l ^ r) as usize;
    }

    diff == 0
}

/// Opaque session id for the management surface cookie.
pub fn random_session_id() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(48);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
