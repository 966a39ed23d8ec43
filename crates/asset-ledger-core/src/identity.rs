use sha2::{Digest, Sha256};

use crate::LedgerError;

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

/// Checks that `value` is a well-formed 256-bit digest in lowercase hex.
///
/// Keys are stored as given, so the uppercase spelling of a digest is refused
/// rather than treated as a second key.
///
/// # Errors
/// Returns [`LedgerError::InvalidIdentifier`] naming `field` otherwise.
pub fn validate_hash(field: &str, value: &str) -> Result<(), LedgerError> {
    if value.len() != HASH_HEX_LEN {
        return Err(LedgerError::InvalidIdentifier(format!(
            "invalid length of {field} {value:?}: expected {HASH_HEX_LEN} hex characters, got {}",
            value.len()
        )));
    }

    if !value
        .bytes()
        .all(|byte| matches!(byte, b'0'..=b'9' | b'a'..=b'f'))
    {
        return Err(LedgerError::InvalidIdentifier(format!(
            "{field} {value:?} is not a lowercase hex digest"
        )));
    }

    Ok(())
}

/// Splits a comma-joined key list, ignoring whitespace and empty segments.
#[must_use]
pub fn parse_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| {
            item.chars()
                .filter(|ch| !ch.is_whitespace())
                .collect::<String>()
        })
        .filter(|item| !item.is_empty())
        .collect()
}

/// Parses a comma-joined list of digests, validating every entry.
///
/// # Errors
/// Returns [`LedgerError::InvalidArgument`] for an empty, oversized or
/// duplicated list and [`LedgerError::InvalidIdentifier`] for a malformed entry.
pub fn parse_hash_list(field: &str, raw: &str, max_len: usize) -> Result<Vec<String>, LedgerError> {
    let keys = parse_key_list(raw);
    if keys.is_empty() {
        return Err(LedgerError::InvalidArgument(format!("{field} MUST contain at least one key")));
    }

    if keys.len() > max_len {
        return Err(LedgerError::InvalidArgument(format!(
            "{field} contains {} keys, the maximum is {max_len}",
            keys.len()
        )));
    }

    for (idx, key) in keys.iter().enumerate() {
        validate_hash(field, key)?;
        if keys[..idx].contains(key) {
            return Err(LedgerError::InvalidArgument(format!("{field} lists {key} more than once")));
        }
    }

    Ok(keys)
}

/// Key of a traintuple: a deterministic function of its defining inputs.
#[must_use]
pub fn traintuple_key(
    challenge_key: &str,
    algo_key: &str,
    start_model_hash: &str,
    train_data_keys: &[String],
    creator: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(challenge_key.as_bytes());
    hasher.update(algo_key.as_bytes());
    hasher.update(start_model_hash.as_bytes());
    hasher.update(train_data_keys.join(",").as_bytes());
    hasher.update(creator.as_bytes());
    hex::encode(hasher.finalize())
}
