//! Segment model and the segmentation plan.
//!
//! A download is split into contiguous inclusive byte ranges which are
//! fetched independently and written at their own offsets. The structures
//! here are serialized into the control sidecar to enable resuming.
use serde::{Deserialize, Serialize};

/// Lifecycle of a single segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

/// A contiguous byte range of the target file.
///
/// The range is inclusive: `start_byte` and `end_byte` are both part of the
/// segment. `downloaded_bytes` counts bytes already written for this range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    /// Position of this segment in the plan.
    pub index: usize,
    /// First byte of the range (0-based).
    pub start_byte: u64,
    /// Last byte of the range.
    pub end_byte: u64,
    /// Bytes already downloaded and written for this segment.
    #[serde(default)]
    pub downloaded_bytes: u64,
    pub status: SegmentStatus,
}

impl Segment {
    pub fn new(index: usize, start_byte: u64, end_byte: u64) -> Self {
        Self {
            index,
            start_byte,
            end_byte,
            downloaded_bytes: 0,
            status: SegmentStatus::Pending,
        }
    }

    /// Total size of this segment in bytes.
    pub fn full_size(&self) -> u64 {
        self.end_byte - self.start_byte + 1
    }

    /// Bytes still missing from this segment.
    pub fn remaining(&self) -> u64 {
        self.full_size().saturating_sub(self.downloaded_bytes)
    }

    pub fn is_completed(&self) -> bool {
        self.status == SegmentStatus::Completed
    }
}

/// Divides `total_size` bytes into at most `max_splits` segments of at least
/// roughly `segment_size` bytes each.
///
/// The segment count is `total_size / segment_size` rounded to the nearest
/// whole number (at least 1), capped by `max_splits`; every segment then gets
/// the same nominal width with the final one clamped to `total_size - 1`.
pub fn plan_segments(total_size: u64, segment_size: u64, max_splits: usize) -> Vec<Segment> {
    let segment_size = segment_size.max(1);
    let by_size = ((2 * total_size + segment_size) / (2 * segment_size)).max(1);
    let target = by_size.min(max_splits.max(1) as u64);
    let width = (total_size + target - 1) / target;

    let mut segments = Vec::with_capacity(target as usize);
    let mut start = 0u64;
    while start < total_size {
        let end = (start + width - 1).min(total_size - 1);
        segments.push(Segment::new(segments.len(), start, end));
        start = end + 1;
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_partition(segments: &[Segment], total_size: u64) {
        assert_eq!(segments[0].start_byte, 0);
        assert_eq!(segments.last().unwrap().end_byte, total_size - 1);
        for pair in segments.windows(2) {
            assert_eq!(pair[0].end_byte + 1, pair[1].start_byte);
        }
        for (i, segment) in segments.iter().enumerate() {
            assert_eq!(segment.index, i);
            assert!(segment.start_byte <= segment.end_byte);
        }
    }

    #[test]
    fn splits_into_equal_rounded_segments() {
        // 15360 / 4096 = 3.75 rounds to 4 segments of 3840 bytes each.
        let segments = plan_segments(15_360, 4096, 5);
        assert_eq!(segments.len(), 4);
        for segment in &segments {
            assert_eq!(segment.full_size(), 3840);
        }
        assert_partition(&segments, 15_360);
    }

    #[test]
    fn single_byte_file_gets_one_segment() {
        let segments = plan_segments(1, 4096, 8);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start_byte, 0);
        assert_eq!(segments[0].end_byte, 0);
    }

    #[test]
    fn split_never_exceeds_size_bound() {
        // 10 MiB at 4 MiB minimum rounds to 3 by size, even with split=16.
        let segments = plan_segments(10 * 1024 * 1024, 4 * 1024 * 1024, 16);
        assert_eq!(segments.len(), 3);
        assert_partition(&segments, 10 * 1024 * 1024);
    }

    #[test]
    fn split_caps_segment_count() {
        let segments = plan_segments(100 * 1024 * 1024, 1024, 4);
        assert_eq!(segments.len(), 4);
        assert_partition(&segments, 100 * 1024 * 1024);
    }

    #[test]
    fn last_segment_is_clamped() {
        let segments = plan_segments(10, 3, 3);
        assert_partition(&segments, 10);
        assert!(segments.iter().all(|s| s.end_byte <= 9));
    }

    #[test]
    fn tiny_file_below_segment_size() {
        let segments = plan_segments(100, 4096, 5);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].full_size(), 100);
    }
}
