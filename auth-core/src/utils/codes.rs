//! Generation and hashing of one-time codes and opaque tokens.
//!
//! Plaintext codes are handed to the caller exactly once; only sha256 hashes
//! are ever persisted.

use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Alphabet for backup codes. Excludes 0/O/1/I to survive transcription.
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const BACKUP_CODE_LEN: usize = 10;
const BACKUP_CODE_GROUP_SIZE: usize = 4;

/// Generate a random numeric code of the given length.
pub fn generate_numeric_code(length: usize) -> String {
    let mut rng = OsRng;
    (0..length).map(|_| rng.gen_range(0..10).to_string()).collect()
}

/// Generate an opaque, unguessable token: `bytes` of CSPRNG output, hex encoded.
pub fn generate_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Generate a single backup code in grouped display form (`XXXX-XXXX-XX`).
pub fn generate_backup_code() -> String {
    let mut rng = OsRng;
    let normalized: String = (0..BACKUP_CODE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..BACKUP_CODE_ALPHABET.len());
            BACKUP_CODE_ALPHABET[idx] as char
        })
        .collect();
    format_backup_code(&normalized)
}

/// Strip separators and uppercase a submitted backup code. Returns `None`
/// when the result could not have been produced by [`generate_backup_code`].
pub fn normalize_backup_code(input: &str) -> Option<String> {
    let normalized: String = input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_uppercase())
        .collect();

    if normalized.len() != BACKUP_CODE_LEN {
        return None;
    }
    if !normalized
        .bytes()
        .all(|ch| BACKUP_CODE_ALPHABET.contains(&ch))
    {
        return None;
    }
    Some(normalized)
}

fn format_backup_code(normalized: &str) -> String {
    normalized
        .as_bytes()
        .chunks(BACKUP_CODE_GROUP_SIZE)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("-")
}

/// One-way hash for codes and tokens, hex encoded.
pub fn hash_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time string equality, used for every hash comparison on a
/// request path.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_code_has_requested_length() {
        let code = generate_numeric_code(6);
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn tokens_are_unique_and_hex() {
        let a = generate_token(32);
        let b = generate_token(32);
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn backup_code_round_trips_through_normalization() {
        let code = generate_backup_code();
        assert_eq!(code.len(), BACKUP_CODE_LEN + 2);
        let normalized = normalize_backup_code(&code).expect("generated code must normalize");
        assert_eq!(normalized.len(), BACKUP_CODE_LEN);
        assert_eq!(normalize_backup_code(&normalized.to_lowercase()), Some(normalized));
    }

    #[test]
    fn normalization_rejects_foreign_input() {
        assert!(normalize_backup_code("too-short").is_none());
        assert!(normalize_backup_code("0000-0000-00").is_none());
    }

    #[test]
    fn hash_is_stable_and_comparison_constant_time() {
        let h1 = hash_code("123456");
        let h2 = hash_code("123456");
        assert_eq!(h1, h2);
        assert!(constant_time_eq(&h1, &h2));
        assert!(!constant_time_eq(&h1, &hash_code("654321")));
    }
}
