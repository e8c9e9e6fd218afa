//! Catalog chunking for the worker pool.
//!
//! The catalog is cut into contiguous chunks of `ceil(len / workers)` items;
//! only the last chunk may be shorter. Concatenating the chunks in order
//! always reproduces the input exactly once.

use snafu::prelude::*;

/// Errors raised while partitioning a catalog.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum PartitionError {
    /// At least one worker is required.
    #[snafu(display("worker count must be >= 1"))]
    NoWorkers,

    /// The chunk layout does not tile the input. Indicates a partitioner bug.
    #[snafu(display(
        "chunk layout does not cover the input: chunk {chunk} starts at {start}, expected {expected} ({total} items)"
    ))]
    InvariantViolation {
        /// Index of the first misplaced chunk.
        chunk: usize,
        /// Its recorded start offset.
        start: usize,
        /// The offset it should have started at.
        expected: usize,
        /// Total number of input items.
        total: usize,
    },
}

/// A contiguous slice of the catalog handed to one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk<T> {
    /// Position of this chunk among all chunks.
    pub index: usize,
    /// Offset of the first item in the original sequence.
    pub start: usize,
    /// The items, in catalog order.
    pub items: Vec<T>,
}

/// Split `items` into at most `workers` contiguous chunks.
///
/// Empty input yields no chunks. Chunks are never empty.
pub fn partition<T>(items: Vec<T>, workers: usize) -> Result<Vec<Chunk<T>>, PartitionError> {
    ensure!(workers >= 1, NoWorkersSnafu);

    let total = items.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    let chunk_size = total.div_ceil(workers);
    let mut chunks = Vec::with_capacity(total.div_ceil(chunk_size));
    let mut rest = items.into_iter();
    let mut start = 0;

    while start < total {
        let items: Vec<T> = rest.by_ref().take(chunk_size).collect();
        let len = items.len();
        chunks.push(Chunk {
            index: chunks.len(),
            start,
            items,
        });
        start += len;
    }

    verify_layout(&chunks, total)?;
    Ok(chunks)
}

/// Check that `chunks` tile `[0, total)` with no gap, overlap, or empty chunk.
pub fn verify_layout<T>(chunks: &[Chunk<T>], total: usize) -> Result<(), PartitionError> {
    let mut expected = 0;
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.index != i || chunk.start != expected || chunk.items.is_empty() {
            return InvariantViolationSnafu {
                chunk: i,
                start: chunk.start,
                expected,
                total,
            }
            .fail();
        }
        expected += chunk.items.len();
    }

    ensure!(
        expected == total,
        InvariantViolationSnafu {
            chunk: chunks.len(),
            start: expected,
            expected: total,
            total,
        }
    );
    Ok(())
}
