use ethereum_types::H256;

/// Encodes a `u64` as a 32-byte big-endian word, the way the arbiter packs
/// scalars before hashing them into commitments.
pub fn u256_be(v: u64) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[24..].copy_from_slice(&v.to_be_bytes());
    out
}

/// Reads a `u64` out of a 32-byte big-endian word. Returns `None` if any of
/// the upper 24 bytes is set.
pub fn u64_from_word(word: &[u8; 32]) -> Option<u64> {
    if word[..24].iter().any(|b| *b != 0) {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&word[24..]);
    Some(u64::from_be_bytes(buf))
}

/// Keccak-256 over the packed concatenation of `parts`.
///
/// Equivalent to hashing the flattened byte sequence, but avoids building the
/// intermediate buffer at every call site.
pub fn keccak_packed(parts: &[&[u8]]) -> H256 {
    let mut buf = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for part in parts {
        buf.extend_from_slice(part);
    }
    keccak_hash::keccak(&buf)
}

/// Decodes a hex string, tolerating a leading `0x` prefix.
pub fn decode_hex(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s))
}

/// Encodes bytes as a `0x`-prefixed lowercase hex string.
pub fn encode_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn u256_be_places_the_value_in_the_low_bytes() {
        let word = u256_be(0x1122334455667788);
        assert_eq!(word[..24], [0u8; 24]);
        assert_eq!(word[24..], hex!("1122334455667788"));
        assert_eq!(u64_from_word(&word), Some(0x1122334455667788));
    }

    #[test]
    fn u64_from_word_rejects_oversized_values() {
        let mut word = u256_be(1);
        word[0] = 1;
        assert_eq!(u64_from_word(&word), None);
    }

    #[test]
    fn keccak_packed_matches_hashing_the_concatenation() {
        let a = b"roll".as_slice();
        let b = b"in".as_slice();
        assert_eq!(keccak_packed(&[a, b]), keccak_hash::keccak(b"rollin"));
    }

    #[test]
    fn hex_round_trip_tolerates_prefixes() {
        assert_eq!(decode_hex("0xdeadbeef").unwrap(), hex!("deadbeef"));
        assert_eq!(decode_hex("deadbeef").unwrap(), hex!("deadbeef"));
        assert_eq!(encode_hex(&hex!("deadbeef")), "0xdeadbeef");
    }
}
