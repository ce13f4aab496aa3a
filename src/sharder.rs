//! Deterministic bucketing of distinct ids for rollouts and variants.
use sha1::{Digest, Sha1};

use crate::models::FlagDefinition;

/// Largest value representable by 15 hex digits.
const LONG_SCALE: f64 = 0xfffffffffffffff_u64 as f64;

/// Salt used when choosing a variant, so variant assignment is independent of rollout.
pub(crate) const VARIANT_SALT: &str = "variant";

/// Maps a subject to a deterministic point used for rollout and variant bucketing.
pub trait Sharder {
    /// Map `(flag_key, distinct_id, salt)` to a point in `[0, 1]`.
    fn hash(&self, flag_key: &str, distinct_id: &str, salt: &str) -> f64;
}

/// The default (and only) sharder. Reproduces the server's assignment.
pub struct Sha1Sharder;

impl Sharder for Sha1Sharder {
    fn hash(&self, flag_key: &str, distinct_id: &str, salt: &str) -> f64 {
        let mut hasher = Sha1::new();
        hasher.update(flag_key.as_bytes());
        hasher.update(b".");
        hasher.update(distinct_id.as_bytes());
        hasher.update(salt.as_bytes());
        let digest = hasher.finalize();

        // First 60 bits of the digest, i.e. the first 15 hex digits.
        let head = digest[..8]
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
        (head >> 4) as f64 / LONG_SCALE
    }
}

/// Returns `true` if `distinct_id` falls within `rollout_percentage` (0-100) of `flag_key`.
pub(crate) fn is_in_rollout(
    sharder: &impl Sharder,
    flag_key: &str,
    distinct_id: &str,
    rollout_percentage: f64,
) -> bool {
    sharder.hash(flag_key, distinct_id, "") <= rollout_percentage / 100.0
}

/// Pick the variant whose cumulative `[min, max)` range contains the variant hash.
pub(crate) fn matching_variant<'a>(
    sharder: &impl Sharder,
    flag: &'a FlagDefinition,
    distinct_id: &str,
) -> Option<&'a str> {
    let variants = &flag.filters.multivariate.as_ref()?.variants;
    let hash = sharder.hash(&flag.key, distinct_id, VARIANT_SALT);

    let mut min = 0.0;
    for variant in variants {
        let max = min + variant.rollout_percentage / 100.0;
        if hash >= min && hash < max {
            return Some(&variant.key);
        }
        min = max;
    }
    None
}
