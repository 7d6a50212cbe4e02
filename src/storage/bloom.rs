//! Bloom filter used to skip sorted tables that certainly do not contain
//! a key. False positives are possible, false negatives are not.

/// Serialized layout: `[num_bits: u32 LE][num_hashes: u32 LE][bit bytes]`.
const HEADER_SIZE: usize = 8;

pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u32,
    num_hashes: u32,
}

impl BloomFilter {
    /// Create a filter sized for `expected_keys` entries at the given
    /// false-positive rate.
    pub fn new(expected_keys: usize, false_positive_rate: f64) -> Self {
        let n = expected_keys.max(1) as f64;
        let p = false_positive_rate;

        // m = -n*ln(p) / (ln 2)^2
        let m = (-n * p.ln() / (std::f64::consts::LN_2 * std::f64::consts::LN_2)).ceil() as u32;
        let m = m.max(8);
        // k = (m/n) * ln 2
        let k = ((m as f64 / n) * std::f64::consts::LN_2).ceil() as u32;
        let k = k.clamp(1, 30);

        let num_bytes = m.div_ceil(8) as usize;
        BloomFilter {
            bits: vec![0u8; num_bytes],
            num_bits: m,
            num_hashes: k,
        }
    }

    pub fn add(&mut self, key: &[u8]) {
        let (h1, h2) = base_hashes(key);
        for i in 0..self.num_hashes {
            let bit = (h1.wrapping_add(i.wrapping_mul(h2))) % self.num_bits;
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// `false` means the key is definitely absent; `true` means it may be
    /// present.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = base_hashes(key);
        for i in 0..self.num_hashes {
            let bit = (h1.wrapping_add(i.wrapping_mul(h2))) % self.num_bits;
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.bits.len());
        out.extend_from_slice(&self.num_bits.to_le_bytes());
        out.extend_from_slice(&self.num_hashes.to_le_bytes());
        out.extend_from_slice(&self.bits);
        out
    }

    /// Returns `None` when the buffer is too short to hold the header or
    /// the advertised bit array.
    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        let num_bits = u32::from_le_bytes(data[0..4].try_into().ok()?);
        let num_hashes = u32::from_le_bytes(data[4..8].try_into().ok()?);
        let num_bytes = num_bits.div_ceil(8) as usize;
        if data.len() < HEADER_SIZE + num_bytes || num_hashes == 0 {
            return None;
        }
        Some(BloomFilter {
            bits: data[HEADER_SIZE..HEADER_SIZE + num_bytes].to_vec(),
            num_bits,
            num_hashes,
        })
    }
}

/// Two independent 32-bit hashes composed into k positions by double
/// hashing: h_i(x) = h1(x) + i*h2(x).
fn base_hashes(key: &[u8]) -> (u32, u32) {
    (fnv1_32(key), fnv1a_32(key))
}

const FNV_OFFSET: u32 = 0x811c9dc5;
const FNV_PRIME: u32 = 0x01000193;

fn fnv1_32(data: &[u8]) -> u32 {
    let mut h = FNV_OFFSET;
    for &b in data {
        h = h.wrapping_mul(FNV_PRIME);
        h ^= b as u32;
    }
    h
}

fn fnv1a_32(data: &[u8]) -> u32 {
    let mut h = FNV_OFFSET;
    for &b in data {
        h ^= b as u32;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bloom_basic() {
        let mut bf = BloomFilter::new(100, 0.01);
        bf.add(b"apple");
        bf.add(b"orange");

        assert!(bf.may_contain(b"apple"));
        assert!(bf.may_contain(b"orange"));
        assert!(!bf.may_contain(b"banana"));
    }

    #[test]
    fn test_bloom_empty_filter_rejects_everything() {
        let bf = BloomFilter::new(10, 0.01);
        assert!(!bf.may_contain(b"anything"));
    }

    #[test]
    fn test_fnv_variants_differ() {
        // Double hashing needs two independent hash functions.
        assert_ne!(fnv1_32(b"some key"), fnv1a_32(b"some key"));
    }

    #[test]
    fn test_bloom_serialize_round_trip() {
        let mut bf = BloomFilter::new(1000, 0.01);
        for i in 0..1000 {
            bf.add(format!("key_{}", i).as_bytes());
        }

        let data = bf.serialize();
        let bf2 = BloomFilter::deserialize(&data).expect("deserialize should succeed");

        for i in 0..1000 {
            let key = format!("key_{}", i);
            assert_eq!(bf.may_contain(key.as_bytes()), bf2.may_contain(key.as_bytes()));
        }
        for i in 0..1000 {
            let key = format!("missing_{}", i);
            assert_eq!(bf.may_contain(key.as_bytes()), bf2.may_contain(key.as_bytes()));
        }
    }

    #[test]
    fn test_bloom_deserialize_invalid() {
        assert!(BloomFilter::deserialize(&[]).is_none());
        assert!(BloomFilter::deserialize(&[0u8; 7]).is_none());

        // Header promises more bits than the buffer carries.
        let mut data = Vec::new();
        data.extend_from_slice(&1024u32.to_le_bytes());
        data.extend_from_slice(&3u32.to_le_bytes());
        data.extend_from_slice(&[0u8; 4]);
        assert!(BloomFilter::deserialize(&data).is_none());
    }

    #[test]
    fn test_bloom_false_positive_rate_within_bound() {
        let n = 10_000;
        let p = 0.01;
        let mut bf = BloomFilter::new(n, p);
        for i in 0..n {
            bf.add(format!("key_{}", i).as_bytes());
        }

        // Inserted keys must always be reported present.
        for i in 0..n {
            assert!(bf.may_contain(format!("key_{}", i).as_bytes()));
        }

        // Observed false-positive rate on never-inserted keys stays within
        // 3x of the configured rate.
        let mut false_positives = 0;
        for i in 0..n {
            if bf.may_contain(format!("absent_{}", i).as_bytes()) {
                false_positives += 1;
            }
        }
        let observed = false_positives as f64 / n as f64;
        assert!(
            observed <= 3.0 * p,
            "false positive rate too high: {} (expected <= {})",
            observed,
            3.0 * p
        );
    }
}
