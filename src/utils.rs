//! Small numeric helpers shared by the allocator and the containers

/// Ascending bucket counts used by the hash containers
pub const PRIME_TABLE: [u64; 28] = [
    53, 97, 193, 389, 769, 1543, 3079, 6151, 12289, 24593, 49157, 98317, 196613, 393241, 786433,
    1572869, 3145739, 6291469, 12582917, 25165843, 50331653, 100663319, 201326611, 402653189,
    805306457, 1610612741, 3221225473, 4294967291,
];

/// Smallest table prime that is `>= n`, or the largest table prime
pub fn next_prime(n: u64) -> u64 {
    PRIME_TABLE
        .iter()
        .copied()
        .find(|&p| p >= n)
        .unwrap_or(PRIME_TABLE[PRIME_TABLE.len() - 1])
}

/// Smallest power of two `>= value`; 0 and 1 both map to 1
pub fn next_pow2(value: u64) -> u64 {
    value.max(1).next_power_of_two()
}

/// `ceil(log2(value))`, with 0 and 1 mapping to 0
pub fn ceil_log2(value: u64) -> u32 {
    next_pow2(value).trailing_zeros()
}

/// Align a value up to the given power-of-two alignment
pub fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
