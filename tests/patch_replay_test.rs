use std::collections::{BTreeSet, HashMap};

use segmerge::attribute::{
    AttributePatchFile, PackAttributeFormat, PackAttributeReader, PackValue, UniqEncodedPackAttributeMerger,
    UniqEncodedPackWriter,
};
use segmerge::index::{BitmapDeletionMapReader, DocId, SegmentInfo, SegmentMergeInfos};
use segmerge::merge::ReclaimMapCreator;
use segmerge::operation::{Operation, OperationIterator, OperationLog, OperationReplayer};
use segmerge::storage::memory::MemoryStorageConfig;
use segmerge::storage::{StorageConfig, StorageFactory};

fn update(pk: u64, field_id: u16, value: &[u8]) -> Operation<u64> {
    Operation::UpdateField {
        pk,
        fields: vec![(field_id, value.to_vec())],
    }
}

fn pack(format: &PackAttributeFormat, first: &[u8], second: &[u8]) -> Vec<u8> {
    let mut value = PackValue::empty(format);
    value.set_field(0, Some(first.to_vec())).unwrap();
    value.set_field(1, Some(second.to_vec())).unwrap();
    value.encode()
}

#[test]
fn test_replayed_operations_patch_merged_segment() -> segmerge::Result<()> {
    let storage = StorageFactory::create(StorageConfig::Memory(MemoryStorageConfig::default()))?;
    let format = PackAttributeFormat::new(2);

    // Segments 0 and 1 were merged into segment 5; pk 10 was deleted.
    let sources: Vec<(i32, Vec<u64>)> = vec![(0, vec![10, 11, 12]), (1, vec![20, 21])];
    let infos = SegmentMergeInfos::from_segments(vec![
        (0, SegmentInfo::new(3, 0, 0), 1),
        (1, SegmentInfo::new(2, 0, 0), 0),
    ]);
    let deletions = BitmapDeletionMapReader::from_deleted_docs(vec![(0, 3, vec![0])])?;
    let map = ReclaimMapCreator::new(false).create(&infos, &deletions, None)?;

    let mut pk_index: HashMap<u64, DocId> = HashMap::new();
    for (segment_id, pks) in &sources {
        for (local, pk) in pks.iter().enumerate() {
            let new_id = map.get_new_id_in_segment(*segment_id, local as DocId)?;
            if new_id >= 0 {
                pk_index.insert(*pk, new_id);
            }
        }
    }
    assert_eq!(pk_index.len(), 4);

    // Operations written by later segments while the merge ran.
    let mut first = OperationLog::new();
    first.append(3, update(11, 0, b"stale"));
    first.append(5, update(12, 0, b"x"));
    first.append(6, Operation::Remove { pk: 20 });
    let mut second = OperationLog::new();
    second.append(7, update(12, 0, b"y"));
    second.append(8, update(21, 1, b"z"));
    second.append(9, update(10, 0, b"gone"));
    first.store(storage.as_ref(), "segment_6/operation_log")?;
    second.store(storage.as_ref(), "segment_7/operation_log")?;
    let logs = vec![
        OperationLog::<u64>::load(storage.as_ref(), "segment_6/operation_log")?,
        OperationLog::<u64>::load(storage.as_ref(), "segment_7/operation_log")?,
    ];

    let replay = OperationReplayer::<u64>::new(&pk_index, 5, 6).replay(OperationIterator::new(&logs, 5))?;
    assert_eq!(replay.deleted, BTreeSet::from([2]));
    assert_eq!(replay.applied, 4);
    assert_eq!(replay.skipped, 1);
    replay
        .patch
        .store(storage.as_ref(), &AttributePatchFile::file_name(6, 5))?;
    let patch = AttributePatchFile::load(storage.as_ref(), &AttributePatchFile::file_name(6, 5))?;

    // Next merge of segment 5 folds the replayed patch in.
    let mut writer = UniqEncodedPackWriter::new();
    for (a, b) in [(b"11", b"p"), (b"12", b"p"), (b"20", b"q"), (b"21", b"q")] {
        writer.push(&pack(&format, a, b));
    }
    let base = writer.finish();
    let target_infos = SegmentMergeInfos::from_segments(vec![(5, SegmentInfo::new(4, 0, 0), 1)]);
    let target_deletions =
        BitmapDeletionMapReader::from_deleted_docs(vec![(5, 4, replay.deleted.iter().copied().collect::<Vec<_>>())])?;
    let target_map = ReclaimMapCreator::new(false).create(&target_infos, &target_deletions, None)?;

    let mut merger = UniqEncodedPackAttributeMerger::new(format.clone());
    let merged = merger.merge(&target_map, &target_infos, &[&base as &dyn PackAttributeReader], &[patch])?;
    assert_eq!(merged.len(), 1);

    let values: Vec<PackValue> = (0..merged[0].doc_count() as DocId)
        .map(|doc| PackValue::decode(&format, merged[0].read(doc).unwrap()).unwrap())
        .collect();
    assert_eq!(values.len(), 3);
    assert_eq!(values[0].field(0), Some(&b"11"[..]));
    assert_eq!(values[1].field(0), Some(&b"y"[..]));
    assert_eq!(values[1].field(1), Some(&b"p"[..]));
    assert_eq!(values[2].field(0), Some(&b"21"[..]));
    assert_eq!(values[2].field(1), Some(&b"z"[..]));
    Ok(())
}
