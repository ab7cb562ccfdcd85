use sha2::{Digest, Sha256};

/// Stable identity for a raw record: the same source position and payload always hash the same,
/// which makes replaying a micro-batch a no-op for the raw tier.
pub fn compute_record_id(
    source_id: &str,
    source_partition: &str,
    offset: u64,
    canonical_fields_json: &str,
) -> String {
    let mut s = String::new();
    s.push_str(source_id);
    s.push('|');
    s.push_str(source_partition);
    s.push('|');
    s.push_str(&offset.to_string());
    s.push('|');
    s.push_str(canonical_fields_json);
    sha256_hex(s.as_bytes())
}

/// Hash of normalized field content, used to detect exact duplicate observations.
pub fn compute_content_hash(entity_key: &str, canonical_fields_json: &str) -> String {
    let mut s = String::with_capacity(entity_key.len() + canonical_fields_json.len() + 1);
    s.push_str(entity_key);
    s.push('|');
    s.push_str(canonical_fields_json);
    sha256_hex(s.as_bytes())
}

/// Stable shard assignment for an entity key.
pub fn shard_for(entity_key: &str, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    let digest = Sha256::digest(entity_key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % shards as u64) as usize
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
