/// Per-bit Shannon entropy of an address stream over the bit range
/// `[begin, end)`. A bit that is uniformly random converges to 1.0, a
/// constant bit scores 0.0.
#[must_use]
pub fn bits_entropy(addresses: &[u64], begin: u32, end: u32) -> Vec<f32> {
    debug_assert!(begin <= end);
    let mut result = Vec::with_capacity((end - begin) as usize);
    for bit in begin..end {
        let ones = addresses
            .iter()
            .filter(|&&addr| (addr >> bit) & 1 == 1)
            .count();
        result.push(single_bit_entropy(ones, addresses.len()));
    }
    result
}

fn single_bit_entropy(ones: usize, total: usize) -> f32 {
    if total == 0 {
        return 0.0;
    }
    let p1 = ones as f32 / total as f32;
    let p0 = 1.0 - p1;
    let mut h = 0.0f32;
    for p in [p0, p1] {
        if p > 0.0 {
            h -= p * p.log2();
        }
    }
    h
}

#[cfg(test)]
mod tests {
    use super::bits_entropy;

    #[test]
    fn alternating_bits_have_full_entropy() {
        // bits 0..3 alternate {0,1}, bits 4+ are constant zero
        let stream = [0x0u64, 0xF, 0x0, 0xF];
        let entropy = bits_entropy(&stream, 0, 4);
        assert!(entropy.iter().all(|&h| (h - 1.0).abs() < 1e-6));

        let upper = bits_entropy(&stream, 4, 8);
        assert!(upper.iter().all(|&h| h == 0.0));
    }

    #[test]
    fn empty_stream_is_flat() {
        assert!(bits_entropy(&[], 0, 4).iter().all(|&h| h == 0.0));
    }
}
