//! Chunk planner - partitions a file into fixed-size byte ranges
//!
//! Pure function, no side effects. The worker pool treats the returned
//! list as the authoritative arena of work; indices never change after
//! planning.

use playvault_types::Chunk;

/// Partition `[0, total_size)` into chunks of `chunk_size` bytes, the
/// last chunk possibly smaller. A zero-byte file yields an empty plan
/// and the transfer completes immediately.
pub fn plan_chunks(total_size: u64, chunk_size: u64, max_retries: u32) -> Vec<Chunk> {
    if total_size == 0 || chunk_size == 0 {
        return Vec::new();
    }

    let count = total_size.div_ceil(chunk_size);
    let mut chunks = Vec::with_capacity(count as usize);

    for i in 0..count {
        let start = i * chunk_size;
        let end = ((i + 1) * chunk_size).min(total_size) - 1;
        chunks.push(Chunk::new(i as u32, start, end, max_retries));
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use playvault_types::ChunkStatus;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn partitions_without_gaps_or_overlaps() {
        let total = 120 * MB;
        let chunks = plan_chunks(total, 50 * MB, 5);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].size(), 50 * MB);
        assert_eq!(chunks[1].size(), 50 * MB);
        assert_eq!(chunks[2].size(), 20 * MB);

        // Contiguous in index order, summing to the total
        let mut expected_start = 0;
        let mut sum = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i as u32);
            assert_eq!(chunk.start, expected_start);
            assert_eq!(chunk.status, ChunkStatus::Pending);
            expected_start = chunk.end + 1;
            sum += chunk.size();
        }
        assert_eq!(expected_start, total);
        assert_eq!(sum, total);
    }

    #[test]
    fn exact_multiple_has_no_short_tail() {
        let chunks = plan_chunks(100 * MB, 50 * MB, 5);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.size() == 50 * MB));
    }

    #[test]
    fn single_chunk_for_small_files() {
        let chunks = plan_chunks(10, 50 * MB, 5);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].end, 9);
    }

    #[test]
    fn zero_size_yields_empty_plan() {
        assert!(plan_chunks(0, 50 * MB, 5).is_empty());
    }

    #[test]
    fn chunk_count_matches_ceiling_division() {
        for total in [1, 49, 50, 51, 99, 100, 101, 1000] {
            let chunks = plan_chunks(total, 50, 3);
            assert_eq!(chunks.len() as u64, total.div_ceil(50));
            assert_eq!(chunks.iter().map(|c| c.size()).sum::<u64>(), total);
        }
    }
}
