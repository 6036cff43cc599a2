//! Key-hash partition selection compatible with Kafka's default partitioner.

use murmur2::{KAFKA_SEED, murmur2};

/// Partition for `key` among `partition_count` partitions.
///
/// Same key, same partition: all records of one stream stay ordered.
pub fn compute_partition(key: &[u8], partition_count: u32) -> u32 {
    debug_assert!(partition_count > 0, "partition_count must be positive");

    // Mask the sign bit, then modulo (Kafka's toPositive(murmur2(key)) % n).
    (murmur2(key, KAFKA_SEED) & 0x7fff_ffff) % partition_count.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_based_routing_is_deterministic() {
        let key = b"6f1c2b9e-4d57-4a4e-9b7e-0c1f2d3e4a5b";
        let first = compute_partition(key, 12);
        assert_eq!(compute_partition(key, 12), first);
        assert!(first < 12);
    }

    #[test]
    fn single_partition_takes_everything() {
        assert_eq!(compute_partition(b"a", 1), 0);
        assert_eq!(compute_partition(b"", 1), 0);
    }

    #[test]
    fn keys_spread_across_partitions() {
        let partition_count = 8;
        let mut counts = vec![0u32; partition_count as usize];
        for i in 0..8000 {
            let key = format!("stream-{i}");
            counts[compute_partition(key.as_bytes(), partition_count) as usize] += 1;
        }

        for (partition, &count) in counts.iter().enumerate() {
            assert!(
                (500..=1500).contains(&count),
                "partition {partition} got {count} records, expected ~1000"
            );
        }
    }
}
