use std::cmp::Ordering;

/// Total order over the fixed-width keys of one index.
pub trait KeyComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Human-readable form of `key` for tree dumps. Hex by default.
    fn format_key(&self, key: &[u8]) -> String {
        key.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Orders keys whose first four bytes are a little-endian `i32`.
pub struct IntegerComparator;

impl IntegerComparator {
    /// Encodes `value` as a key of `key_size` bytes (at least 4), zero-padded.
    pub fn key(value: i32, key_size: usize) -> Vec<u8> {
        let mut key = vec![0u8; key_size.max(4)];
        key[..4].copy_from_slice(&value.to_le_bytes());
        key
    }
}

impl KeyComparator for IntegerComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        if a.len() < 4 || b.len() < 4 {
            return a.cmp(b);
        }

        let a_val = i32::from_le_bytes([a[0], a[1], a[2], a[3]]);
        let b_val = i32::from_le_bytes([b[0], b[1], b[2], b[3]]);

        a_val.cmp(&b_val)
    }

    fn format_key(&self, key: &[u8]) -> String {
        match key.get(..4) {
            Some(head) => i32::from_le_bytes([head[0], head[1], head[2], head[3]]).to_string(),
            None => key.iter().map(|b| format!("{:02x}", b)).collect(),
        }
    }
}

/// Lexicographic byte order.
pub struct BytewiseComparator;

impl KeyComparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}
