//! # Secret Generation
//!
//! Random passwords and tokens, and constant-time comparison for every
//! secret the control plane checks.

use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Characters used in generated database passwords.
pub const PASSWORD_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!#%*+-=_";

/// Generate a random password of `length` characters from
/// [`PASSWORD_CHARSET`], using the OS random source.
pub fn generate_password(length: usize) -> String {
    (0..length)
        .map(|_| PASSWORD_CHARSET[OsRng.gen_range(0..PASSWORD_CHARSET.len())] as char)
        .collect()
}

/// Generate a cryptographically secure random token
///
/// Returns a 256-bit (32-byte) random value as base64.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes)
}

/// Hash a secret for storage using SHA-256
///
/// Peer keys are stored hashed; only the peer holds the raw key.
pub fn hash_secret(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, digest)
}

/// Short fingerprint of a secret, safe to log.
pub fn fingerprint(secret: &str) -> String {
    hash_secret(secret)[..12].to_string()
}

/// Constant-time comparison of two strings
pub fn constant_time_str_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_length_and_charset() {
        let password = generate_password(32);
        assert_eq!(password.len(), 32);
        assert!(password.bytes().all(|b| PASSWORD_CHARSET.contains(&b)));
        assert_ne!(password, generate_password(32));
    }

    #[test]
    fn test_token_generation() {
        let token1 = generate_token();
        let token2 = generate_token();

        assert_ne!(token1, token2);
        // 32 bytes base64 without padding
        assert_eq!(token1.len(), 43);
    }

    #[test]
    fn test_hash_secret() {
        let hash = hash_secret("key");
        assert_ne!(hash, "key");
        assert_eq!(hash, hash_secret("key"));
        assert!(hash.starts_with(&fingerprint("key")));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(fingerprint("key"), fingerprint("key"));
        assert_ne!(fingerprint("key"), fingerprint("other"));
        assert_eq!(fingerprint("key").len(), 12);
    }

    #[test]
    fn test_constant_time_str_eq() {
        assert!(constant_time_str_eq("abc", "abc"));
        assert!(!constant_time_str_eq("abc", "abd"));
        assert!(!constant_time_str_eq("abc", "abcd"));
    }
}
