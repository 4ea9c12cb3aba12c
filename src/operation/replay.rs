//! Replay of deferred operations against a merged target segment.

use std::collections::{BTreeSet, HashMap};

use log::debug;

use crate::attribute::patch::AttributePatchFile;
use crate::error::{MergeError, Result};
use crate::index::segment::{DocId, SegmentId};
use crate::operation::{Operation, OperationIterator, PrimaryKey};

/// Primary key lookup in the doc space of the merged target.
pub trait PrimaryKeyIndex<K>: Send + Sync {
    fn lookup(&self, pk: &K) -> Option<DocId>;
}

impl<K: PrimaryKey> PrimaryKeyIndex<K> for HashMap<K, DocId> {
    fn lookup(&self, pk: &K) -> Option<DocId> {
        self.get(pk).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplayResult {
    pub deleted: BTreeSet<DocId>,
    pub patch: AttributePatchFile,
    pub sub_deleted: BTreeSet<DocId>,
    pub sub_patch: AttributePatchFile,
    pub applied: usize,
    /// Operations on keys missing from the target or already removed.
    pub skipped: usize,
}

pub struct OperationReplayer<'a, K> {
    main_index: &'a dyn PrimaryKeyIndex<K>,
    sub_index: Option<&'a dyn PrimaryKeyIndex<K>>,
    target_segment_id: SegmentId,
    patch_segment_idx: u32,
}

impl<'a, K: PrimaryKey> OperationReplayer<'a, K> {
    /// Patches produced by the replay are recorded as coming from
    /// `patch_segment_idx` and apply to `target_segment_id`.
    pub fn new(
        main_index: &'a dyn PrimaryKeyIndex<K>,
        target_segment_id: SegmentId,
        patch_segment_idx: u32,
    ) -> Self {
        OperationReplayer {
            main_index,
            sub_index: None,
            target_segment_id,
            patch_segment_idx,
        }
    }

    pub fn with_sub_index(mut self, sub_index: &'a dyn PrimaryKeyIndex<K>) -> Self {
        self.sub_index = Some(sub_index);
        self
    }

    /// Replay operations in iterator order. A removed doc ignores later
    /// updates. Removing a main doc does not touch its sub docs; they are
    /// reclaimed with it by the next merge.
    pub fn replay(&self, operations: OperationIterator<'_, K>) -> Result<ReplayResult> {
        let mut result = ReplayResult {
            patch: AttributePatchFile::new(self.patch_segment_idx, self.target_segment_id),
            sub_patch: AttributePatchFile::new(self.patch_segment_idx, self.target_segment_id),
            ..ReplayResult::default()
        };
        for (seg_idx, offset, record) in operations {
            match &record.op {
                Operation::SubDoc { main_pk, sub_ops } => {
                    let sub_index = self.sub_index.ok_or_else(|| {
                        MergeError::invalid_argument(format!(
                            "sub doc operation at {seg_idx}:{offset} without a sub doc index"
                        ))
                    })?;
                    let main_live = self
                        .main_index
                        .lookup(main_pk)
                        .is_some_and(|doc| !result.deleted.contains(&doc));
                    if !main_live {
                        result.skipped += 1;
                        continue;
                    }
                    for sub_op in sub_ops {
                        if matches!(sub_op, Operation::SubDoc { .. }) {
                            return Err(MergeError::invalid_argument(format!(
                                "nested sub doc operation at {seg_idx}:{offset}"
                            )));
                        }
                        let applied = apply(
                            sub_index,
                            sub_op,
                            &mut result.sub_deleted,
                            &mut result.sub_patch,
                        );
                        count(&mut result, applied);
                    }
                }
                op => {
                    let applied = apply(
                        self.main_index,
                        op,
                        &mut result.deleted,
                        &mut result.patch,
                    );
                    count(&mut result, applied);
                }
            }
        }
        debug!(
            "Replayed operations onto segment {}: {} applied, {} skipped, {} removed",
            self.target_segment_id,
            result.applied,
            result.skipped,
            result.deleted.len()
        );
        Ok(result)
    }
}

fn count(result: &mut ReplayResult, applied: bool) {
    if applied {
        result.applied += 1;
    } else {
        result.skipped += 1;
    }
}

/// Apply a remove or update. Returns false when the doc is unknown or gone.
fn apply<K: PrimaryKey>(
    index: &dyn PrimaryKeyIndex<K>,
    op: &Operation<K>,
    deleted: &mut BTreeSet<DocId>,
    patch: &mut AttributePatchFile,
) -> bool {
    let Some(doc_id) = index.lookup(&op.pk()) else {
        return false;
    };
    if deleted.contains(&doc_id) {
        return false;
    }
    match op {
        Operation::Remove { .. } => {
            deleted.insert(doc_id);
        }
        Operation::UpdateField { fields, .. } => {
            for (field_id, value) in fields {
                patch.push(doc_id, *field_id, value.clone());
            }
        }
        Operation::SubDoc { .. } => return false,
    }
    true
}
