//! Token estimation. Uses the chars/4 heuristic — deterministic, cheap,
//! monotonic in length. The rest of the crate tolerates ±25% error, so
//! counting Unicode scalar values (not bytes) is fine for mixed content.

/// Estimate the token count of a string. Any non-empty string is at least
/// one token; empty input is zero.
pub fn estimate_tokens(text: &str) -> i64 {
    if text.is_empty() {
        return 0;
    }
    ((text.chars().count() / 4) as i64).max(1)
}
