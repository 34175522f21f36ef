/// Hex identifiers: persona and kex-key ids are lowercase hex digests.
///
/// Two reserved sentinels denote "use the persona's long-term key" in the
/// message format. They pass `is_hex_hash` (so they survive id plumbing)
/// but are never valid storage ids: destructive kex operations treat them
/// as no-ops and lookups redirect them.

/// Length of the short-form persona id accepted by prefix lookup.
pub const SHORT_ID_LEN: usize = 16;

/// Kex-id sentinel for RSA-encrypted messages.
pub const RSA_KEX_ID: &str = "00000000000000000000000000000000";

/// Kex-id sentinel for EC personas whose peer ran out of ephemeral keys.
pub const EC_KEX_ID: &str = "11111111111111111111111111111111";

/// Accepts lowercase hex strings of even length, at least 16 characters.
pub fn is_hex_hash(s: &str) -> bool {
    if s.len() < SHORT_ID_LEN || s.len() % 2 != 0 {
        return false;
    }
    s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

pub fn is_kex_sentinel(s: &str) -> bool {
    s == RSA_KEX_ID || s == EC_KEX_ID
}

/// Lowercase hex form of a binary blob.
pub fn blob_to_hex(blob: &[u8]) -> String {
    hex::encode(blob)
}
