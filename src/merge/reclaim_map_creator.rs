//! Builds [`ReclaimMap`]s from segment metadata and deletion maps.

use log::debug;

use crate::error::{MergeError, Result};
use crate::index::deletion::DeletionMapReader;
use crate::index::segment::{DocId, INVALID_DOCID, SegmentId, SegmentMergeInfos};
use crate::merge::reclaim_map::{ReclaimMap, ReclaimMapBuilder, SubReclaimMap};

/// Routes each live source document to one of several target segments.
pub trait SegmentSplitHandler: Send + Sync {
    fn target_segment_count(&self) -> usize;

    /// Target bucket of a live document, in `0..target_segment_count()`.
    fn target_segment_index(&self, segment_id: SegmentId, local_doc_id: DocId) -> usize;
}

/// Split handler backed by a closure.
pub struct FnSplitHandler<F> {
    target_count: usize,
    f: F,
}

impl<F> FnSplitHandler<F>
where
    F: Fn(SegmentId, DocId) -> usize + Send + Sync,
{
    pub fn new(target_count: usize, f: F) -> Self {
        FnSplitHandler { target_count, f }
    }
}

impl<F> SegmentSplitHandler for FnSplitHandler<F>
where
    F: Fn(SegmentId, DocId) -> usize + Send + Sync,
{
    fn target_segment_count(&self) -> usize {
        self.target_count
    }

    fn target_segment_index(&self, segment_id: SegmentId, local_doc_id: DocId) -> usize {
        (self.f)(segment_id, local_doc_id)
    }
}

/// Join values between main documents and their sub documents.
pub trait JoinValueReader: Send + Sync {
    /// Exclusive end of the sub docs owned by `main_local_doc_id`, in the
    /// segment-local sub doc space.
    fn sub_doc_end(&self, segment_id: SegmentId, main_local_doc_id: DocId) -> DocId;
}

/// Join values held in memory, one vector per segment.
#[derive(Debug, Clone, Default)]
pub struct VecJoinValueReader {
    ends: ahash::AHashMap<SegmentId, Vec<DocId>>,
}

impl VecJoinValueReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_segment(&mut self, segment_id: SegmentId, sub_doc_ends: Vec<DocId>) {
        self.ends.insert(segment_id, sub_doc_ends);
    }
}

impl JoinValueReader for VecJoinValueReader {
    fn sub_doc_end(&self, segment_id: SegmentId, main_local_doc_id: DocId) -> DocId {
        self.ends
            .get(&segment_id)
            .and_then(|ends| ends.get(main_local_doc_id as usize))
            .copied()
            .unwrap_or(INVALID_DOCID)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReclaimMapCreator {
    with_reverse: bool,
}

impl ReclaimMapCreator {
    /// `with_reverse` builds the [`DocOrder`](super::reclaim_map::DocOrder)
    /// needed by truncated indexes.
    pub fn new(with_reverse: bool) -> Self {
        ReclaimMapCreator { with_reverse }
    }

    pub fn with_reverse(&self) -> bool {
        self.with_reverse
    }

    /// Build the reclaim map of `infos`, taken in the given order.
    pub fn create(
        &self,
        infos: &SegmentMergeInfos,
        deletion_reader: &dyn DeletionMapReader,
        split_handler: Option<&dyn SegmentSplitHandler>,
    ) -> Result<ReclaimMap> {
        let total = infos.total_doc_count();
        check_doc_space(total)?;
        let target_count = split_handler.map_or(1, |h| h.target_segment_count());
        check_target_count(target_count)?;

        let mut builder = ReclaimMapBuilder::new(total as usize, target_count);
        for info in infos {
            let doc_count = info.doc_count() as u32;
            builder.begin_segment(info.segment_id, doc_count);
            for local in 0..doc_count as DocId {
                if deletion_reader.is_deleted(info.segment_id, local) {
                    builder.push_deleted();
                    continue;
                }
                let target = match split_handler {
                    Some(handler) => {
                        let target = handler.target_segment_index(info.segment_id, local);
                        if target >= target_count {
                            return Err(MergeError::out_of_range(format!(
                                "split handler sent doc {local} of segment {} to target {target}, \
                                 only {target_count} targets exist",
                                info.segment_id
                            )));
                        }
                        target
                    }
                    None => 0,
                };
                builder.push_live(target);
            }
        }

        let map = builder.finish(self.with_reverse);
        debug!(
            "Created reclaim map over {} segments: {} docs, {} deleted, {} targets",
            infos.len(),
            map.new_doc_count(),
            map.deleted_doc_count(),
            map.target_segment_count()
        );
        Ok(map)
    }

    /// Build the reclaim map of sub documents.
    ///
    /// A sub doc survives when its main doc survives and it is not deleted
    /// itself. Surviving sub docs go to their main doc's target.
    pub fn create_sub(
        &self,
        main_map: &ReclaimMap,
        main_infos: &SegmentMergeInfos,
        sub_infos: &SegmentMergeInfos,
        join: &dyn JoinValueReader,
        sub_deletions: &dyn DeletionMapReader,
    ) -> Result<SubReclaimMap> {
        if main_infos.len() != sub_infos.len() {
            return Err(MergeError::invalid_argument(format!(
                "{} main segments but {} sub segments",
                main_infos.len(),
                sub_infos.len()
            )));
        }
        let total = sub_infos.total_doc_count();
        check_doc_space(total)?;

        let target_count = main_map.target_segment_count();
        let mut builder = ReclaimMapBuilder::new(total as usize, target_count);
        let mut main_to_sub_end: Vec<Vec<DocId>> = (0..target_count)
            .map(|t| Vec::with_capacity(main_map.target_doc_count(t) as usize))
            .collect();
        let mut sub_to_main: Vec<Vec<DocId>> = vec![Vec::new(); target_count];

        for (main_info, sub_info) in main_infos.iter().zip(sub_infos.iter()) {
            if main_info.segment_id != sub_info.segment_id {
                return Err(MergeError::invalid_argument(format!(
                    "main segment {} paired with sub segment {}",
                    main_info.segment_id, sub_info.segment_id
                )));
            }
            let segment_id = main_info.segment_id;
            let sub_count = sub_info.doc_count() as DocId;
            builder.begin_segment(segment_id, sub_count as u32);

            let mut prev_end: DocId = 0;
            for main_local in 0..main_info.doc_count() as DocId {
                let end = join.sub_doc_end(segment_id, main_local);
                if end < prev_end || end > sub_count {
                    return Err(MergeError::corrupted(format!(
                        "join value {end} of doc {main_local} in segment {segment_id} \
                         outside [{prev_end}, {sub_count}]"
                    )));
                }
                let old_main = main_map.old_global_id(segment_id, main_local)?;
                let target = main_map.get_target(old_main);
                for sub_local in prev_end..end {
                    match target {
                        Some((t, new_main)) if !sub_deletions.is_deleted(segment_id, sub_local) => {
                            builder.push_live(t);
                            sub_to_main[t].push(new_main);
                        }
                        _ => builder.push_deleted(),
                    }
                }
                if let Some((t, _)) = target {
                    main_to_sub_end[t].push(sub_to_main[t].len() as DocId);
                }
                prev_end = end;
            }
            if prev_end != sub_count {
                return Err(MergeError::corrupted(format!(
                    "segment {segment_id} has {} sub docs without a main doc",
                    sub_count - prev_end
                )));
            }
        }

        debug_assert_eq!(builder.target_count(), target_count);
        Ok(SubReclaimMap {
            map: builder.finish(self.with_reverse),
            main_to_sub_end,
            sub_to_main,
        })
    }
}

fn check_doc_space(total: u64) -> Result<()> {
    if total > DocId::MAX as u64 {
        return Err(MergeError::out_of_range(format!(
            "{total} docs exceed the doc id space"
        )));
    }
    Ok(())
}

fn check_target_count(target_count: usize) -> Result<()> {
    if target_count == 0 || target_count > u16::MAX as usize {
        return Err(MergeError::invalid_argument(format!(
            "target segment count {target_count} must be in [1, {}]",
            u16::MAX
        )));
    }
    Ok(())
}
