//! Merge plans: which source segments merge into which target segments.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::index::segment::{INVALID_SEGMENT_ID, SegmentId, SegmentInfo, SegmentMergeInfo, SegmentMergeInfos};
use crate::storage::{Storage, join_path, read_all, write_atomic};

pub const MERGE_PLAN_FILE_NAME: &str = "merge_plan";

/// One merge unit.
///
/// The plan only records decisions taken by a merge policy. Segments are kept
/// in `(level, in_level, segment_id)` order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergePlan {
    segment_merge_infos: SegmentMergeInfos,
    sub_segment_merge_infos: SegmentMergeInfos,
    target_segment_ids: Vec<SegmentId>,
    target_segment_infos: BTreeMap<usize, SegmentInfo>,
    sub_target_segment_infos: BTreeMap<usize, SegmentInfo>,
}

impl MergePlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert in level order. Base doc ids are recomputed to follow it.
    pub fn add_segment(&mut self, info: SegmentMergeInfo) {
        self.segment_merge_infos.insert_by_level(info);
        self.segment_merge_infos.rebuild_base_doc_ids();
    }

    pub fn segment_merge_infos(&self) -> &SegmentMergeInfos {
        &self.segment_merge_infos
    }

    pub fn sub_segment_merge_infos(&self) -> &SegmentMergeInfos {
        &self.sub_segment_merge_infos
    }

    pub fn set_sub_segment_merge_infos(&mut self, infos: SegmentMergeInfos) {
        self.sub_segment_merge_infos = infos;
    }

    pub fn has_sub_segments(&self) -> bool {
        !self.sub_segment_merge_infos.is_empty()
    }

    pub fn has_segment(&self, segment_id: SegmentId) -> bool {
        self.segment_merge_infos.find(segment_id).is_some()
    }

    pub fn segments_count(&self) -> usize {
        self.segment_merge_infos.len()
    }

    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.segment_merge_infos
            .iter()
            .map(|info| info.segment_id)
            .collect()
    }

    pub fn set_target_segment_id(&mut self, idx: usize, segment_id: SegmentId) {
        if self.target_segment_ids.len() <= idx {
            self.target_segment_ids.resize(idx + 1, INVALID_SEGMENT_ID);
        }
        self.target_segment_ids[idx] = segment_id;
    }

    pub fn target_segment_id(&self, idx: usize) -> SegmentId {
        self.target_segment_ids
            .get(idx)
            .copied()
            .unwrap_or(INVALID_SEGMENT_ID)
    }

    pub fn target_segment_ids(&self) -> &[SegmentId] {
        &self.target_segment_ids
    }

    /// Number of target segments, at least one.
    pub fn target_segment_count(&self) -> usize {
        self.target_segment_ids.len().max(1)
    }

    pub fn set_target_segment_info(&mut self, idx: usize, info: SegmentInfo) {
        self.target_segment_infos.insert(idx, info);
    }

    pub fn set_sub_target_segment_info(&mut self, idx: usize, info: SegmentInfo) {
        self.sub_target_segment_infos.insert(idx, info);
    }

    /// Segment info of target `idx`.
    ///
    /// Without an explicitly set info this aggregates the whole plan: live doc
    /// count summed, `max_ttl` and `timestamp` as maxima.
    pub fn target_segment_info(&self, idx: usize) -> SegmentInfo {
        self.target_segment_infos
            .get(&idx)
            .copied()
            .unwrap_or_else(|| aggregate(&self.segment_merge_infos))
    }

    pub fn sub_target_segment_info(&self, idx: usize) -> SegmentInfo {
        self.sub_target_segment_infos
            .get(&idx)
            .copied()
            .unwrap_or_else(|| aggregate(&self.sub_segment_merge_infos))
    }

    pub fn store(&self, storage: &dyn Storage, dir: &str) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(storage, &join_path(dir, MERGE_PLAN_FILE_NAME), &bytes)
    }

    pub fn load(storage: &dyn Storage, dir: &str) -> Result<MergePlan> {
        let bytes = read_all(storage, &join_path(dir, MERGE_PLAN_FILE_NAME))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn aggregate(infos: &SegmentMergeInfos) -> SegmentInfo {
    let timestamp = infos
        .iter()
        .map(|info| info.segment_info.timestamp)
        .max()
        .unwrap_or(0);
    infos.iter().fold(SegmentInfo::new(0, timestamp, 0), |mut acc, info| {
        acc.doc_count += info.live_doc_count();
        acc.max_ttl = acc.max_ttl.max(info.segment_info.max_ttl);
        acc
    })
}
