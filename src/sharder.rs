//! Deterministic hashing used by rollout strategies and variant selection.

/// Maps strings to shards. Used for percentage rollouts and variant assignment.
pub trait Sharder {
    /// Map `input` to a shard in `0..total_shards`. `total_shards` must be non-zero.
    fn get_shard(&self, input: &str, total_shards: u64) -> u64;
}

/// The default sharder.
pub struct Md5Sharder;

impl Sharder for Md5Sharder {
    fn get_shard(&self, input: &str, total_shards: u64) -> u64 {
        let hash = md5::compute(input);
        let int_from_hash = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
        u64::from(int_from_hash) % total_shards
    }
}

/// Hash `identifier` within `group_id` into `1..=normalizer`.
///
/// A rollout percentage `p` includes exactly the identifiers whose normalized hash is `<= p`, so the
/// same identifier stays included as the percentage grows.
pub(crate) fn normalized_hash(
    sharder: &impl Sharder,
    identifier: &str,
    group_id: &str,
    normalizer: u64,
) -> u64 {
    sharder.get_shard(&format!("{group_id}:{identifier}"), normalizer) + 1
}

#[cfg(test)]
pub(crate) struct DeterministicSharder(pub std::collections::HashMap<String, u64>);

#[cfg(test)]
impl Sharder for DeterministicSharder {
    fn get_shard(&self, input: &str, total_shards: u64) -> u64 {
        self.0.get(input).copied().unwrap_or(0) % total_shards
    }
}
