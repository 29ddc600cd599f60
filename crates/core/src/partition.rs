//! Key → partition mapping.

/// Partition number in `0..TOTAL_PARTITIONS`.
pub type PartitionNumber = u32;

/// Size of the fixed partition space shared by every instance.
pub const TOTAL_PARTITIONS: u32 = 256;

/// Deterministic mapping from a record key to its partition.
///
/// The mapping must be identical across processes and releases, so it uses
/// CRC32 over the UTF-8 bytes of the key rather than the std hasher.
#[derive(Debug, Default, Copy, Clone)]
pub struct PartitionHasher;

impl PartitionHasher {
    pub fn partition_for(key: &str) -> PartitionNumber {
        crc32fast::hash(key.as_bytes()) % TOTAL_PARTITIONS
    }

    /// Every partition number, in ascending order.
    pub fn all_partitions() -> impl Iterator<Item = PartitionNumber> {
        0..TOTAL_PARTITIONS
    }
}
