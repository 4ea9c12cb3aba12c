//! Merging of uniq-encoded pack attributes with pending patches.

use std::collections::BTreeMap;

use log::debug;

use crate::attribute::pack::{
    PackAttributeFormat, PackAttributeReader, PackValue, UniqEncodedPackSegment,
    UniqEncodedPackWriter,
};
use crate::attribute::patch::{AttributePatchFile, PatchBuffer, PatchedDocInfo};
use crate::error::{MergeError, Result};
use crate::index::segment::{DocId, SegmentMergeInfos};
use crate::merge::reclaim_map::ReclaimMap;

/// Pending field values of one new doc: `field_id -> (start, len)` in the
/// patch buffer.
type FieldPatches = BTreeMap<u16, (usize, usize)>;

pub struct UniqEncodedPackAttributeMerger {
    format: PackAttributeFormat,
    buffer: PatchBuffer,
}

impl UniqEncodedPackAttributeMerger {
    pub fn new(format: PackAttributeFormat) -> Self {
        UniqEncodedPackAttributeMerger {
            format,
            buffer: PatchBuffer::default(),
        }
    }

    pub fn format(&self) -> &PackAttributeFormat {
        &self.format
    }

    /// Merge the pack data of the plan's source segments, one output per
    /// target segment.
    ///
    /// `base_readers` follow the order of `infos`.
    pub fn merge(
        &mut self,
        reclaim_map: &ReclaimMap,
        infos: &SegmentMergeInfos,
        base_readers: &[&dyn PackAttributeReader],
        patches: &[AttributePatchFile],
    ) -> Result<Vec<UniqEncodedPackSegment>> {
        if base_readers.len() != infos.len() {
            return Err(MergeError::invalid_argument(format!(
                "{} pack readers for {} segments",
                base_readers.len(),
                infos.len()
            )));
        }
        for (info, reader) in infos.iter().zip(base_readers) {
            if reader.doc_count() as u64 != info.doc_count() {
                return Err(MergeError::corrupted(format!(
                    "pack data of segment {} holds {} docs, segment has {}",
                    info.segment_id,
                    reader.doc_count(),
                    info.doc_count()
                )));
            }
        }

        self.buffer.clear();
        let target_count = reclaim_map.target_segment_count();
        let patched = self.collect_patches(reclaim_map, patches, target_count)?;
        let mut pending: Vec<_> = patched.into_iter().map(|m| m.into_iter().peekable()).collect();
        let mut writers: Vec<UniqEncodedPackWriter> =
            (0..target_count).map(|_| UniqEncodedPackWriter::new()).collect();

        // Both streams advance in new doc order inside each target.
        let mut patched_docs = 0usize;
        for (info, reader) in infos.iter().zip(base_readers) {
            for local in 0..info.doc_count() as DocId {
                let old_global = reclaim_map.old_global_id(info.segment_id, local)?;
                let Some((target, new_id)) = reclaim_map.get_target(old_global) else {
                    continue;
                };
                let base = reader.read(local)?;
                let patch = pending[target].next_if(|(doc, _)| *doc == new_id);
                match patch {
                    Some((_, fields)) => {
                        let mut value = PackValue::decode(&self.format, base)?;
                        for (field_id, (start, len)) in fields {
                            value.set_field(field_id, Some(self.buffer.slice(start, len).to_vec()))?;
                        }
                        writers[target].push(&value.encode());
                        patched_docs += 1;
                    }
                    None => writers[target].push(base),
                }
            }
        }

        for (target, rest) in pending.iter_mut().enumerate() {
            if let Some((doc, _)) = rest.peek() {
                return Err(MergeError::internal(format!(
                    "patch for doc {doc} of target {target} was not applied"
                )));
            }
        }
        debug!(
            "Merged pack attribute into {target_count} targets, {patched_docs} docs patched, \
             {} patch bytes buffered",
            self.buffer.len()
        );
        Ok(writers.into_iter().map(UniqEncodedPackWriter::finish).collect())
    }

    /// Translate patches of live docs to the new doc space, fold them per doc
    /// in write order so the last writer of each field wins.
    fn collect_patches(
        &mut self,
        reclaim_map: &ReclaimMap,
        patches: &[AttributePatchFile],
        target_count: usize,
    ) -> Result<Vec<BTreeMap<DocId, FieldPatches>>> {
        let mut infos: Vec<Vec<PatchedDocInfo>> = vec![Vec::new(); target_count];
        for patch in patches {
            for (offset, entry) in patch.entries.iter().enumerate() {
                self.format.check_field(entry.field_id)?;
                let old_global = reclaim_map
                    .old_global_id(patch.target_segment_id, entry.doc_id)
                    .map_err(|e| {
                        MergeError::corrupted(format!(
                            "patch {} of segment {}: {e}",
                            patch.patch_segment_idx, patch.target_segment_id
                        ))
                    })?;
                let Some((target, new_doc_id)) = reclaim_map.get_target(old_global) else {
                    continue;
                };
                let (data_start, data_len) = self.buffer.append(&entry.value);
                infos[target].push(PatchedDocInfo {
                    new_doc_id,
                    old_doc_id: entry.doc_id,
                    seg_idx: patch.patch_segment_idx,
                    offset: offset as u32,
                    field_id: entry.field_id,
                    data_start,
                    data_len,
                });
            }
        }

        Ok(infos
            .into_iter()
            .map(|mut target_infos| {
                target_infos.sort_by_key(PatchedDocInfo::sort_key);
                let mut folded: BTreeMap<DocId, FieldPatches> = BTreeMap::new();
                for info in target_infos {
                    folded
                        .entry(info.new_doc_id)
                        .or_default()
                        .insert(info.field_id, (info.data_start, info.data_len));
                }
                folded
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::deletion::BitmapDeletionMapReader;
    use crate::index::segment::SegmentInfo;
    use crate::merge::reclaim_map_creator::{FnSplitHandler, ReclaimMapCreator};

    fn value(format: &PackAttributeFormat, fields: &[&[u8]]) -> Vec<u8> {
        let mut value = PackValue::empty(format);
        for (i, f) in fields.iter().enumerate() {
            value.set_field(i as u16, Some(f.to_vec())).unwrap();
        }
        value.encode()
    }

    fn segment(values: &[Vec<u8>]) -> UniqEncodedPackSegment {
        let mut writer = UniqEncodedPackWriter::new();
        for v in values {
            writer.push(v);
        }
        writer.finish()
    }

    fn setup() -> (PackAttributeFormat, SegmentMergeInfos, Vec<UniqEncodedPackSegment>) {
        let format = PackAttributeFormat::new(2);
        let infos = SegmentMergeInfos::from_segments(vec![
            (0, SegmentInfo::new(3, 0, 0), 1),
            (1, SegmentInfo::new(2, 0, 0), 0),
        ]);
        let segments = vec![
            segment(&[
                value(&format, &[b"a0", b"x"]),
                value(&format, &[b"a1", b"x"]),
                value(&format, &[b"a2", b"x"]),
            ]),
            segment(&[value(&format, &[b"b0", b"y"]), value(&format, &[b"b1", b"y"])]),
        ];
        (format, infos, segments)
    }

    #[test]
    fn test_merge_applies_last_writer() {
        let (format, infos, segments) = setup();
        let deletions = BitmapDeletionMapReader::from_deleted_docs(vec![(0, 3, vec![1])]).unwrap();
        let map = ReclaimMapCreator::new(false)
            .create(&infos, &deletions, None)
            .unwrap();

        let mut early = AttributePatchFile::new(1, 0);
        early.push(2, 0, b"early".to_vec());
        early.push(2, 0, b"later".to_vec());
        early.push(1, 0, b"deleted".to_vec());
        let mut late = AttributePatchFile::new(2, 0);
        late.push(2, 1, b"z".to_vec());
        let mut other = AttributePatchFile::new(2, 1);
        other.push(0, 1, b"w".to_vec());

        let readers: Vec<&dyn PackAttributeReader> = segments.iter().map(|s| s as &dyn PackAttributeReader).collect();
        let mut merger = UniqEncodedPackAttributeMerger::new(format);
        // Late patch listed first: write order comes from the patch index.
        let merged = merger
            .merge(&map, &infos, &readers, &[late, other, early])
            .unwrap();

        assert_eq!(merged.len(), 1);
        let out = &merged[0];
        assert_eq!(out.doc_count(), 4);
        assert_eq!(out.read(0).unwrap(), value(&format, &[b"a0", b"x"]).as_slice());
        assert_eq!(out.read(1).unwrap(), value(&format, &[b"later", b"z"]).as_slice());
        assert_eq!(out.read(2).unwrap(), value(&format, &[b"b0", b"w"]).as_slice());
        assert_eq!(out.read(3).unwrap(), value(&format, &[b"b1", b"y"]).as_slice());
    }

    #[test]
    fn test_merge_into_split_targets() {
        let (format, infos, segments) = setup();
        let none = BitmapDeletionMapReader::new();
        let handler = FnSplitHandler::new(2, |segment_id, _| segment_id as usize);
        let map = ReclaimMapCreator::new(false)
            .create(&infos, &none, Some(&handler))
            .unwrap();

        let mut patch = AttributePatchFile::new(5, 1);
        patch.push(1, 0, b"p".to_vec());
        let readers: Vec<&dyn PackAttributeReader> = segments.iter().map(|s| s as &dyn PackAttributeReader).collect();
        let merged = UniqEncodedPackAttributeMerger::new(format)
            .merge(&map, &infos, &readers, &[patch])
            .unwrap();

        assert_eq!(merged[0].doc_count(), 3);
        assert_eq!(merged[0].unique_count(), 3);
        assert_eq!(merged[1].read(1).unwrap(), value(&format, &[b"p", b"y"]).as_slice());
    }

    #[test]
    fn test_patch_errors() {
        let (format, infos, segments) = setup();
        let none = BitmapDeletionMapReader::new();
        let map = ReclaimMapCreator::new(false).create(&infos, &none, None).unwrap();
        let readers: Vec<&dyn PackAttributeReader> = segments.iter().map(|s| s as &dyn PackAttributeReader).collect();
        let mut merger = UniqEncodedPackAttributeMerger::new(format);

        let mut bad_field = AttributePatchFile::new(0, 0);
        bad_field.push(0, 2, b"v".to_vec());
        assert!(matches!(
            merger.merge(&map, &infos, &readers, &[bad_field]),
            Err(MergeError::InvalidArgument(_))
        ));

        let mut bad_segment = AttributePatchFile::new(0, 7);
        bad_segment.push(0, 0, b"v".to_vec());
        assert!(matches!(
            merger.merge(&map, &infos, &readers, &[bad_segment]),
            Err(MergeError::Corrupted(_))
        ));

        let mut bad_doc = AttributePatchFile::new(0, 1);
        bad_doc.push(2, 0, b"v".to_vec());
        assert!(matches!(
            merger.merge(&map, &infos, &readers, &[bad_doc]),
            Err(MergeError::Corrupted(_))
        ));
    }
}
