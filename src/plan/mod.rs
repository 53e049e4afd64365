//! Chunk planner
//!
//! Maps (file size, chunk size) to a deterministic partition of byte
//! ranges, numbered from 1. Pure computation, no I/O.

use std::ops::Range;

/// Default chunk size (5MB) - matches the S3 minimum part size
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Deterministic partition of a file into numbered parts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    file_size: u64,
    chunk_size: u64,
    total_parts: u32,
}

impl ChunkPlan {
    /// Create a plan for a file.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is zero; callers validate chunk size at
    /// configuration load time.
    pub fn new(file_size: u64, chunk_size: u64) -> Self {
        assert!(chunk_size > 0, "chunk size must be non-zero");
        let total_parts = file_size.div_ceil(chunk_size) as u32;
        Self {
            file_size,
            chunk_size,
            total_parts,
        }
    }

    /// Total number of parts: `ceil(file_size / chunk_size)`
    pub fn total_parts(&self) -> u32 {
        self.total_parts
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Byte range of part `n`, for `n` in `[1, total_parts]`.
    ///
    /// `range_of(n) = [(n-1)*chunk_size, min(n*chunk_size, file_size))`
    pub fn range_of(&self, part_number: u32) -> Range<u64> {
        debug_assert!(part_number >= 1 && part_number <= self.total_parts);
        let start = (part_number as u64 - 1) * self.chunk_size;
        let end = (start + self.chunk_size).min(self.file_size);
        start..end
    }

    /// Part numbers not yet in `completed`, ascending.
    ///
    /// Completed part numbers outside `[1, total_parts]` are ignored
    /// here; structural validation happens on the session itself.
    pub fn pending(&self, completed: &[u32]) -> Vec<u32> {
        (1..=self.total_parts)
            .filter(|n| !completed.contains(n))
            .collect()
    }
}
