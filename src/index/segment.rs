//! Segment metadata as seen by the merge.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Document id local to a segment.
pub type DocId = i32;

/// Segment identifier.
pub type SegmentId = i32;

/// Document id in the concatenated id space of several segments.
pub type GlobalId = i64;

pub const INVALID_DOCID: DocId = -1;
pub const INVALID_SEGMENT_ID: SegmentId = -1;

/// On-disk metadata of one segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Number of documents, deleted ones included.
    pub doc_count: u64,

    /// Timestamp of the newest document in the segment.
    pub timestamp: i64,

    /// Largest time-to-live of any document in the segment.
    #[serde(default)]
    pub max_ttl: u64,
}

impl SegmentInfo {
    pub fn new(doc_count: u64, timestamp: i64, max_ttl: u64) -> Self {
        SegmentInfo {
            doc_count,
            timestamp,
            max_ttl,
        }
    }
}

/// A source segment participating in a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMergeInfo {
    pub segment_id: SegmentId,

    pub segment_info: SegmentInfo,

    /// Number of documents marked deleted at merge planning time.
    pub deleted_doc_count: u32,

    /// First global id of this segment in the concatenated id space.
    pub base_doc_id: i64,

    /// Level of the segment in a leveled layout.
    #[serde(default)]
    pub level_idx: u32,

    /// Position of the segment inside its level.
    #[serde(default)]
    pub in_level_idx: u32,

    /// Size of the segment's data in bytes.
    #[serde(default)]
    pub segment_size: u64,
}

impl SegmentMergeInfo {
    pub fn new(
        segment_id: SegmentId,
        segment_info: SegmentInfo,
        deleted_doc_count: u32,
        base_doc_id: i64,
    ) -> Self {
        SegmentMergeInfo {
            segment_id,
            segment_info,
            deleted_doc_count,
            base_doc_id,
            level_idx: 0,
            in_level_idx: 0,
            segment_size: 0,
        }
    }

    pub fn with_level(mut self, level_idx: u32, in_level_idx: u32) -> Self {
        self.level_idx = level_idx;
        self.in_level_idx = in_level_idx;
        self
    }

    pub fn with_segment_size(mut self, segment_size: u64) -> Self {
        self.segment_size = segment_size;
        self
    }

    pub fn doc_count(&self) -> u64 {
        self.segment_info.doc_count
    }

    /// Documents that survive the merge.
    pub fn live_doc_count(&self) -> u64 {
        self.segment_info
            .doc_count
            .saturating_sub(self.deleted_doc_count as u64)
    }

    /// Order used when placing segments into a merge plan.
    pub fn level_order(&self, other: &SegmentMergeInfo) -> Ordering {
        (self.level_idx, self.in_level_idx, self.segment_id).cmp(&(
            other.level_idx,
            other.in_level_idx,
            other.segment_id,
        ))
    }
}

/// Ordered list of source segments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentMergeInfos(Vec<SegmentMergeInfo>);

impl SegmentMergeInfos {
    pub fn new() -> Self {
        SegmentMergeInfos(Vec::new())
    }

    /// Build from segment metadata, assigning base doc ids in the given order.
    pub fn from_segments<I>(segments: I) -> Self
    where
        I: IntoIterator<Item = (SegmentId, SegmentInfo, u32)>,
    {
        let mut infos = SegmentMergeInfos::new();
        let mut base = 0i64;
        for (segment_id, segment_info, deleted) in segments {
            infos.push(SegmentMergeInfo::new(segment_id, segment_info, deleted, base));
            base += segment_info.doc_count as i64;
        }
        infos
    }

    pub fn push(&mut self, info: SegmentMergeInfo) {
        self.0.push(info);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SegmentMergeInfo> {
        self.0.iter()
    }

    pub fn get(&self, idx: usize) -> Option<&SegmentMergeInfo> {
        self.0.get(idx)
    }

    pub fn as_slice(&self) -> &[SegmentMergeInfo] {
        &self.0
    }

    pub fn find(&self, segment_id: SegmentId) -> Option<&SegmentMergeInfo> {
        self.0.iter().find(|info| info.segment_id == segment_id)
    }

    pub fn position(&self, segment_id: SegmentId) -> Option<usize> {
        self.0.iter().position(|info| info.segment_id == segment_id)
    }

    pub fn total_doc_count(&self) -> u64 {
        self.0.iter().map(|info| info.doc_count()).sum()
    }

    pub fn total_live_doc_count(&self) -> u64 {
        self.0.iter().map(|info| info.live_doc_count()).sum()
    }

    pub fn total_segment_size(&self) -> u64 {
        self.0.iter().map(|info| info.segment_size).sum()
    }

    /// Insert keeping `(level, in_level, segment_id)` order. Equal keys keep
    /// insertion order.
    pub fn insert_by_level(&mut self, info: SegmentMergeInfo) {
        let pos = self
            .0
            .iter()
            .position(|existing| existing.level_order(&info) == Ordering::Greater)
            .unwrap_or(self.0.len());
        self.0.insert(pos, info);
    }

    pub fn sort_by_level(&mut self) {
        self.0.sort_by(|a, b| a.level_order(b));
    }

    /// Recompute base doc ids as the running sum of doc counts.
    pub fn rebuild_base_doc_ids(&mut self) {
        let mut base = 0i64;
        for info in &mut self.0 {
            info.base_doc_id = base;
            base += info.segment_info.doc_count as i64;
        }
    }
}

impl From<Vec<SegmentMergeInfo>> for SegmentMergeInfos {
    fn from(infos: Vec<SegmentMergeInfo>) -> Self {
        SegmentMergeInfos(infos)
    }
}

impl<'a> IntoIterator for &'a SegmentMergeInfos {
    type Item = &'a SegmentMergeInfo;
    type IntoIter = std::slice::Iter<'a, SegmentMergeInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
