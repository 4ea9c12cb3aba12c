use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use segmerge::index::{BitmapDeletionMapReader, DeletionMapReader, INVALID_DOCID, SegmentInfo, SegmentMergeInfos};
use segmerge::merge::{FnSplitHandler, ReclaimMap, ReclaimMapCreator};
use segmerge::storage::file::FileStorageConfig;
use segmerge::storage::{StorageConfig, StorageFactory};

type Segments = Vec<(i32, u32, Vec<i32>)>;

fn build(segments: &Segments) -> (SegmentMergeInfos, BitmapDeletionMapReader) {
    let infos = SegmentMergeInfos::from_segments(
        segments
            .iter()
            .map(|(id, docs, deleted)| (*id, SegmentInfo::new(*docs as u64, 0, 0), deleted.len() as u32)),
    );
    let deletions = BitmapDeletionMapReader::from_deleted_docs(segments.clone()).unwrap();
    (infos, deletions)
}

fn random_segments(rng: &mut StdRng) -> Segments {
    let count = rng.random_range(1..6);
    (0..count)
        .map(|id| {
            let docs = rng.random_range(0..200u32);
            let deleted = (0..docs as i32).filter(|_| rng.random_bool(0.3)).collect();
            (id * 3 + 1, docs, deleted)
        })
        .collect()
}

#[test]
fn test_three_segments_with_deletions() -> segmerge::Result<()> {
    let segments = vec![(0, 5, vec![2]), (1, 10, vec![]), (2, 2, vec![1])];
    let (infos, deletions) = build(&segments);
    let map = ReclaimMapCreator::new(false).create(&infos, &deletions, None)?;

    assert_eq!(map.new_doc_count(), 15);
    assert_eq!(map.deleted_doc_count(), 2);
    assert_eq!(map.get_new_id_in_segment(0, 0)?, 0);
    assert_eq!(map.get_new_id_in_segment(0, 1)?, 1);
    assert_eq!(map.get_new_id_in_segment(0, 2)?, INVALID_DOCID);
    assert_eq!(map.get_new_id_in_segment(0, 3)?, 2);
    assert_eq!(map.get_new_id_in_segment(0, 4)?, 3);
    assert_eq!(map.get_new_id_in_segment(1, 0)?, 4);
    assert_eq!(map.get_new_id_in_segment(2, 0)?, 14);
    assert_eq!(map.get_new_id_in_segment(2, 1)?, INVALID_DOCID);
    Ok(())
}

#[test]
fn test_live_docs_map_onto_dense_range() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..50 {
        let segments = random_segments(&mut rng);
        let (infos, deletions) = build(&segments);
        let map = ReclaimMapCreator::new(false)
            .create(&infos, &deletions, None)
            .unwrap();

        let mut seen = BTreeSet::new();
        let mut previous = None;
        for info in infos.iter() {
            for local in 0..info.doc_count() as i32 {
                let new_id = map.get_new_id_in_segment(info.segment_id, local).unwrap();
                if deletions.is_deleted(info.segment_id, local) {
                    assert_eq!(new_id, INVALID_DOCID);
                    continue;
                }
                assert!(seen.insert(new_id), "duplicate new id {new_id}");
                // Source order is kept.
                if let Some(prev) = previous {
                    assert!(new_id > prev);
                }
                previous = Some(new_id);
            }
        }
        let expected: BTreeSet<i32> = (0..map.new_doc_count() as i32).collect();
        assert_eq!(seen, expected);
    }
}

#[test]
fn test_split_keeps_order_inside_each_target() {
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..20 {
        let segments = random_segments(&mut rng);
        let (infos, deletions) = build(&segments);
        let split = FnSplitHandler::new(3, |segment, local| ((segment + local) % 3) as usize);
        let map = ReclaimMapCreator::new(true)
            .create(&infos, &deletions, Some(&split))
            .unwrap();

        let mut last: Vec<Option<i32>> = vec![None; 3];
        let mut per_target: Vec<BTreeSet<i32>> = vec![BTreeSet::new(); 3];
        for info in infos.iter() {
            for local in 0..info.doc_count() as i32 {
                let old = map.old_global_id(info.segment_id, local).unwrap();
                let Some((target, new_id)) = map.get_target(old) else {
                    assert!(deletions.is_deleted(info.segment_id, local));
                    continue;
                };
                assert_eq!(target, ((info.segment_id + local) % 3) as usize);
                if let Some(prev) = last[target] {
                    assert!(new_id > prev);
                }
                last[target] = Some(new_id);
                per_target[target].insert(new_id);

                let new_global = map.target_base(target) + new_id as i64;
                assert_eq!(map.get_old_doc(new_global).unwrap(), (info.segment_id, local));
            }
        }
        for (target, ids) in per_target.iter().enumerate() {
            let expected: BTreeSet<i32> = (0..map.target_doc_count(target) as i32).collect();
            assert_eq!(ids, &expected);
        }
    }
}

#[test]
fn test_create_is_deterministic() {
    let mut rng = StdRng::seed_from_u64(3);
    let segments = random_segments(&mut rng);
    let (infos, deletions) = build(&segments);
    let creator = ReclaimMapCreator::new(true);

    let first = creator.create(&infos, &deletions, None).unwrap();
    let second = creator.create(&infos, &deletions, None).unwrap();
    assert_eq!(first, second);

    let temp_dir = TempDir::new().unwrap();
    let storage = StorageFactory::create(StorageConfig::File(FileStorageConfig::new(temp_dir.path()))).unwrap();
    first.store(storage.as_ref(), "a/reclaim_map").unwrap();
    second.store(storage.as_ref(), "b/reclaim_map").unwrap();
    let a = std::fs::read(temp_dir.path().join("a/reclaim_map")).unwrap();
    let b = std::fs::read(temp_dir.path().join("b/reclaim_map")).unwrap();
    assert_eq!(a, b);
    assert_eq!(ReclaimMap::load(storage.as_ref(), "a/reclaim_map").unwrap(), first);
}
