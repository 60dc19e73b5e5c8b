use rand::Rng;
use sha2::{Digest, Sha256};

/// SHA-256 of arbitrary bytes as a lowercase 64-char hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Derive the obfuscated endpoint UUID for a provider within the current
/// rotation window.
///
/// The value is a pure function of `(provider, floor(now / interval), secret)`,
/// so every instance computes the same UUID inside one epoch bucket and all
/// instances flip together at the boundary. No coordination store is needed.
pub fn endpoint_uuid(provider: &str, now_ms: i64, interval_ms: i64, secret: &str) -> String {
    let bucket = epoch_bucket(now_ms, interval_ms);
    let material = format!("{provider}:{bucket}:{secret}");
    let mut uuid = sha256_hex(material.as_bytes());
    uuid.truncate(32);
    uuid
}

/// Integer time slice used for UUID rotation: `floor(now / interval)`.
pub fn epoch_bucket(now_ms: i64, interval_ms: i64) -> i64 {
    now_ms / interval_ms.max(1)
}

/// Millisecond timestamp of the next rotation boundary after `now_ms`.
pub fn next_rotation_ms(now_ms: i64, interval_ms: i64) -> i64 {
    let interval = interval_ms.max(1);
    (epoch_bucket(now_ms, interval) + 1) * interval
}

/// Generate a random 128-bit secret as 32 hex chars. Used when
/// OBFUSCATION_SECRET is not configured.
pub fn default_secret() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
