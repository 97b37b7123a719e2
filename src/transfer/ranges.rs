//! Fragment partitioning.
//!
//! A file is split into contiguous, non-overlapping half-open byte ranges
//! whose union is exactly `[0, file_size)`. Small files are capped to
//! `ceil(file_size / min_fragment_size)` fragments so a large connection
//! budget never produces tiny fragments; otherwise the file is split into
//! exactly `max_connections` fragments with the division remainder folded
//! into the last one.

/// One half-open byte range `[start, end)` of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentRange {
    pub start: u64,
    pub end: u64,
}

impl FragmentRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Partition `file_size` bytes into fragment ranges.
///
/// Returns an empty vector for a zero-size file; callers skip those before
/// queueing.
pub fn fragment_ranges(file_size: u64, max_connections: u32, min_fragment_size: u64) -> Vec<FragmentRange> {
    if file_size == 0 {
        return Vec::new();
    }
    let n = u64::from(max_connections.max(1));
    let min = min_fragment_size.max(1);

    if n * min > file_size {
        // Connection budget exceeds what min-size fragments can fill: cap
        // the count instead of shrinking below the minimum.
        let count = file_size.div_ceil(min);
        (0..count)
            .map(|i| FragmentRange {
                start: i * min,
                end: ((i + 1) * min).min(file_size),
            })
            .collect()
    } else {
        let base = file_size / n;
        (0..n)
            .map(|i| FragmentRange {
                start: i * base,
                end: if i + 1 == n { file_size } else { (i + 1) * base },
            })
            .collect()
    }
}
