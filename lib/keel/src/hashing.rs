use crc16::{State, XMODEM};

/// Number of hash slots in a redis cluster.
pub const CLUSTER_SLOTS: u32 = 16384;

/// Computes the cluster slot for a key: CRC16/XMODEM over the hash-tag
/// sub-key, modulo the slot count.
#[inline]
pub fn key_slot(key: &[u8]) -> u16 {
    State::<XMODEM>::calculate(sub_key(key)) % CLUSTER_SLOTS as u16
}

/// If a key contains `{` and `}`, everything between the first occurrence
/// is the only thing that determines the hash slot.
fn sub_key(key: &[u8]) -> &[u8] {
    key.iter()
        .position(|b| *b == b'{')
        .and_then(|open| {
            let after_open = open + 1;
            key[after_open..]
                .iter()
                .position(|b| *b == b'}')
                .and_then(|close_offset| {
                    if close_offset != 0 {
                        Some(&key[after_open..after_open + close_offset])
                    } else {
                        None
                    }
                })
        })
        .unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_slots() {
        // Reference values from the redis cluster specification.
        assert_eq!(key_slot(b"foo"), 12182);
        assert_eq!(key_slot(b"bar"), 5061);
        assert_eq!(key_slot(b""), 0);
    }

    #[test]
    fn test_hash_tag() {
        assert_eq!(key_slot(b"{user1000}.following"), key_slot(b"{user1000}.followers"));
        // An empty tag means the whole key hashes.
        assert_eq!(
            key_slot(b"foo{}{bar}"),
            State::<XMODEM>::calculate(b"foo{}{bar}") % 16384
        );
    }

    #[test]
    fn test_unterminated_tag_uses_whole_key() {
        assert_eq!(key_slot(b"{open"), State::<XMODEM>::calculate(b"{open") % 16384);
    }
}
