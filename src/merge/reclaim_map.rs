//! Doc id remapping from source segments to merged target segments.
//!
//! A [`ReclaimMap`] is indexed by the *old global id*: the position of a
//! document in the concatenation of the plan's source segments, in plan
//! order. Each slot holds the document's new id inside its target segment, or
//! [`INVALID_DOCID`] when the document is deleted. The live slots of one
//! target segment hold exactly `0..target_doc_count` in increasing order, so
//! the merge is a stable compaction.
//!
//! Maps are built once per merge plan by
//! [`ReclaimMapCreator`](super::reclaim_map_creator::ReclaimMapCreator) and are
//! immutable afterwards; every parallel task item of the plan reads the same
//! `Arc<ReclaimMap>` without locking.

use std::io::{Cursor, Read};

use ahash::AHashMap;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{MergeError, Result};
use crate::index::segment::{DocId, GlobalId, INVALID_DOCID, SegmentId};
use crate::storage::{Storage, read_all, write_atomic};

const RECLAIM_MAP_MAGIC: u32 = 0x524C_434D; // "RCLM"
const RECLAIM_MAP_VERSION: u32 = 1;
const SUB_RECLAIM_MAP_MAGIC: u32 = 0x5342_524D; // "SBRM"

/// Position of one source segment in the old global id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSlot {
    pub segment_id: SegmentId,
    pub base: GlobalId,
    pub doc_count: u32,
}

/// Original order of the merged documents.
///
/// Entry `i` is the old global id of the document with new global id `i`.
/// Truncated secondary indexes use it to rebuild postings in a consistent
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocOrder {
    new_to_old: Vec<GlobalId>,
}

impl DocOrder {
    pub fn old_global_id(&self, new_global_id: GlobalId) -> Option<GlobalId> {
        usize::try_from(new_global_id)
            .ok()
            .and_then(|idx| self.new_to_old.get(idx))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.new_to_old.len()
    }

    pub fn is_empty(&self) -> bool {
        self.new_to_old.is_empty()
    }

    /// True when the new order equals the source order, which is the case
    /// for merges with a single target segment.
    pub fn is_identity(&self) -> bool {
        self.new_to_old.windows(2).all(|w| w[0] < w[1])
    }

    pub fn as_slice(&self) -> &[GlobalId] {
        &self.new_to_old
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimMap {
    old_to_new: Vec<DocId>,
    /// Target segment of each old doc; empty when there is a single target.
    target_indexes: Vec<u16>,
    segments: Vec<SegmentSlot>,
    segment_positions: AHashMap<SegmentId, usize>,
    target_doc_counts: Vec<u32>,
    target_bases: Vec<GlobalId>,
    deleted_doc_count: u32,
    doc_order: Option<DocOrder>,
}

impl ReclaimMap {
    /// Bytes a map over `total_doc_count` old docs is expected to occupy.
    pub fn estimate_memory_use(total_doc_count: u64, target_count: usize, with_reverse: bool) -> i64 {
        let mut per_doc = std::mem::size_of::<DocId>() as u64;
        if target_count > 1 {
            per_doc += std::mem::size_of::<u16>() as u64;
        }
        if with_reverse {
            per_doc += std::mem::size_of::<GlobalId>() as u64;
        }
        total_doc_count.saturating_mul(per_doc).min(i64::MAX as u64) as i64
    }

    /// New id of `old_global_id` inside its target segment, or
    /// [`INVALID_DOCID`] for a deleted document.
    ///
    /// `old_global_id` must lie in `0..total_old_doc_count()`.
    #[inline]
    pub fn get_new_id(&self, old_global_id: GlobalId) -> DocId {
        debug_assert!(
            old_global_id >= 0 && (old_global_id as usize) < self.old_to_new.len(),
            "old global id {old_global_id} outside reclaim map"
        );
        self.old_to_new
            .get(old_global_id as usize)
            .copied()
            .unwrap_or(INVALID_DOCID)
    }

    /// Target segment index of a live document.
    #[inline]
    pub fn target_segment_index(&self, old_global_id: GlobalId) -> usize {
        if self.target_indexes.is_empty() {
            0
        } else {
            self.target_indexes[old_global_id as usize] as usize
        }
    }

    /// `(target segment index, new local id)` of a live document.
    pub fn get_target(&self, old_global_id: GlobalId) -> Option<(usize, DocId)> {
        if old_global_id < 0 {
            return None;
        }
        let new_id = *self.old_to_new.get(old_global_id as usize)?;
        if new_id == INVALID_DOCID {
            return None;
        }
        Some((self.target_segment_index(old_global_id), new_id))
    }

    /// New id in the concatenation of all target segments.
    pub fn get_new_global_id(&self, old_global_id: GlobalId) -> Option<GlobalId> {
        self.get_target(old_global_id)
            .map(|(target, new_id)| self.target_bases[target] + new_id as GlobalId)
    }

    pub fn get_new_id_in_segment(&self, segment_id: SegmentId, local_doc_id: DocId) -> Result<DocId> {
        let old_global_id = self.old_global_id(segment_id, local_doc_id)?;
        Ok(self.old_to_new[old_global_id as usize])
    }

    /// Old global id of a local doc of a source segment.
    pub fn old_global_id(&self, segment_id: SegmentId, local_doc_id: DocId) -> Result<GlobalId> {
        let slot = self.segment_slot(segment_id)?;
        if local_doc_id < 0 || local_doc_id as u32 >= slot.doc_count {
            return Err(MergeError::out_of_range(format!(
                "doc {local_doc_id} outside segment {segment_id} with {} docs",
                slot.doc_count
            )));
        }
        Ok(slot.base + local_doc_id as GlobalId)
    }

    pub fn segment_slot(&self, segment_id: SegmentId) -> Result<&SegmentSlot> {
        self.segment_positions
            .get(&segment_id)
            .map(|pos| &self.segments[*pos])
            .ok_or_else(|| {
                MergeError::not_found(format!("segment {segment_id} is not part of the reclaim map"))
            })
    }

    pub fn segments(&self) -> &[SegmentSlot] {
        &self.segments
    }

    /// Reverse lookup from a new global id to its source location.
    ///
    /// Only available for maps built with reverse tables.
    pub fn get_old_doc(&self, new_global_id: GlobalId) -> Result<(SegmentId, DocId)> {
        let order = self.doc_order.as_ref().ok_or_else(|| {
            MergeError::invalid_argument("reclaim map was built without reverse lookup tables")
        })?;
        let old_global_id = order.old_global_id(new_global_id).ok_or_else(|| {
            MergeError::out_of_range(format!(
                "new doc id {new_global_id} outside [0, {})",
                order.len()
            ))
        })?;
        let pos = self
            .segments
            .partition_point(|slot| slot.base + slot.doc_count as GlobalId <= old_global_id);
        let slot = self.segments.get(pos).ok_or_else(|| {
            MergeError::internal(format!("old global id {old_global_id} has no segment"))
        })?;
        Ok((slot.segment_id, (old_global_id - slot.base) as DocId))
    }

    pub fn doc_order(&self) -> Option<&DocOrder> {
        self.doc_order.as_ref()
    }

    pub fn has_reverse(&self) -> bool {
        self.doc_order.is_some()
    }

    /// Live documents across all target segments.
    pub fn new_doc_count(&self) -> u32 {
        self.target_doc_counts.iter().sum()
    }

    pub fn target_doc_count(&self, target_idx: usize) -> u32 {
        self.target_doc_counts.get(target_idx).copied().unwrap_or(0)
    }

    pub fn target_doc_counts(&self) -> &[u32] {
        &self.target_doc_counts
    }

    pub fn target_segment_count(&self) -> usize {
        self.target_doc_counts.len()
    }

    /// First new global id of a target segment.
    pub fn target_base(&self, target_idx: usize) -> GlobalId {
        self.target_bases.get(target_idx).copied().unwrap_or(0)
    }

    pub fn deleted_doc_count(&self) -> u32 {
        self.deleted_doc_count
    }

    pub fn total_old_doc_count(&self) -> usize {
        self.old_to_new.len()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn store(&self, storage: &dyn Storage, path: &str) -> Result<()> {
        let mut buf = Vec::with_capacity(64 + self.old_to_new.len() * 4);
        buf.write_u32::<LittleEndian>(RECLAIM_MAP_MAGIC)?;
        buf.write_u32::<LittleEndian>(RECLAIM_MAP_VERSION)?;
        self.encode(&mut buf)?;
        let checksum = crc32fast::hash(&buf);
        buf.write_u32::<LittleEndian>(checksum)?;
        write_atomic(storage, path, &buf)
    }

    pub fn load(storage: &dyn Storage, path: &str) -> Result<ReclaimMap> {
        let bytes = read_all(storage, path)?;
        let payload = verify_checksum(&bytes, RECLAIM_MAP_MAGIC, path)?;
        let mut cursor = Cursor::new(payload);
        ReclaimMap::decode(&mut cursor)
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u32::<LittleEndian>(self.segments.len() as u32)?;
        for slot in &self.segments {
            buf.write_i32::<LittleEndian>(slot.segment_id)?;
            buf.write_i64::<LittleEndian>(slot.base)?;
            buf.write_u32::<LittleEndian>(slot.doc_count)?;
        }
        write_u32s(buf, &self.target_doc_counts)?;
        buf.write_u32::<LittleEndian>(self.deleted_doc_count)?;
        write_i32s(buf, &self.old_to_new)?;
        buf.write_u64::<LittleEndian>(self.target_indexes.len() as u64)?;
        for idx in &self.target_indexes {
            buf.write_u16::<LittleEndian>(*idx)?;
        }
        match &self.doc_order {
            Some(order) => {
                buf.write_u8(1)?;
                buf.write_u64::<LittleEndian>(order.new_to_old.len() as u64)?;
                for old in &order.new_to_old {
                    buf.write_i64::<LittleEndian>(*old)?;
                }
            }
            None => buf.write_u8(0)?,
        }
        Ok(())
    }

    fn decode(cursor: &mut Cursor<&[u8]>) -> Result<ReclaimMap> {
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != RECLAIM_MAP_VERSION {
            return Err(MergeError::corrupted(format!(
                "unsupported reclaim map version: {version}"
            )));
        }
        let segment_count = cursor.read_u32::<LittleEndian>()? as usize;
        let mut segments = Vec::with_capacity(segment_count);
        for _ in 0..segment_count {
            segments.push(SegmentSlot {
                segment_id: cursor.read_i32::<LittleEndian>()?,
                base: cursor.read_i64::<LittleEndian>()?,
                doc_count: cursor.read_u32::<LittleEndian>()?,
            });
        }
        let target_doc_counts = read_u32s(cursor)?;
        let deleted_doc_count = cursor.read_u32::<LittleEndian>()?;
        let old_to_new = read_i32s(cursor)?;
        let index_len = cursor.read_u64::<LittleEndian>()? as usize;
        let mut target_indexes = Vec::with_capacity(index_len);
        for _ in 0..index_len {
            target_indexes.push(cursor.read_u16::<LittleEndian>()?);
        }
        let doc_order = if cursor.read_u8()? == 1 {
            let len = cursor.read_u64::<LittleEndian>()? as usize;
            let mut new_to_old = Vec::with_capacity(len);
            for _ in 0..len {
                new_to_old.push(cursor.read_i64::<LittleEndian>()?);
            }
            Some(DocOrder { new_to_old })
        } else {
            None
        };

        let total: u64 = segments.iter().map(|s| s.doc_count as u64).sum();
        if total != old_to_new.len() as u64 {
            return Err(MergeError::corrupted(format!(
                "reclaim map covers {} docs but segments hold {total}",
                old_to_new.len()
            )));
        }
        Ok(ReclaimMap::from_parts(
            old_to_new,
            target_indexes,
            segments,
            target_doc_counts,
            deleted_doc_count,
            doc_order,
        ))
    }

    fn from_parts(
        old_to_new: Vec<DocId>,
        target_indexes: Vec<u16>,
        segments: Vec<SegmentSlot>,
        target_doc_counts: Vec<u32>,
        deleted_doc_count: u32,
        doc_order: Option<DocOrder>,
    ) -> Self {
        let segment_positions = segments
            .iter()
            .enumerate()
            .map(|(pos, slot)| (slot.segment_id, pos))
            .collect();
        let mut target_bases = Vec::with_capacity(target_doc_counts.len());
        let mut base = 0;
        for count in &target_doc_counts {
            target_bases.push(base);
            base += *count as GlobalId;
        }
        ReclaimMap {
            old_to_new,
            target_indexes,
            segments,
            segment_positions,
            target_doc_counts,
            target_bases,
            deleted_doc_count,
            doc_order,
        }
    }
}

/// Incremental construction of a [`ReclaimMap`] in old global id order.
#[derive(Debug)]
pub(crate) struct ReclaimMapBuilder {
    old_to_new: Vec<DocId>,
    target_indexes: Vec<u16>,
    segments: Vec<SegmentSlot>,
    counters: Vec<DocId>,
    deleted_doc_count: u32,
    split: bool,
}

impl ReclaimMapBuilder {
    pub(crate) fn new(total_doc_count: usize, target_count: usize) -> Self {
        let split = target_count > 1;
        ReclaimMapBuilder {
            old_to_new: Vec::with_capacity(total_doc_count),
            target_indexes: if split {
                Vec::with_capacity(total_doc_count)
            } else {
                Vec::new()
            },
            segments: Vec::new(),
            counters: vec![0; target_count],
            deleted_doc_count: 0,
            split,
        }
    }

    pub(crate) fn begin_segment(&mut self, segment_id: SegmentId, doc_count: u32) {
        self.segments.push(SegmentSlot {
            segment_id,
            base: self.old_to_new.len() as GlobalId,
            doc_count,
        });
    }

    pub(crate) fn push_deleted(&mut self) {
        self.old_to_new.push(INVALID_DOCID);
        if self.split {
            self.target_indexes.push(0);
        }
        self.deleted_doc_count += 1;
    }

    /// Assign the next new id of `target`. `target` must be a valid bucket.
    pub(crate) fn push_live(&mut self, target: usize) -> DocId {
        let new_id = self.counters[target];
        self.counters[target] += 1;
        self.old_to_new.push(new_id);
        if self.split {
            self.target_indexes.push(target as u16);
        }
        new_id
    }

    pub(crate) fn target_count(&self) -> usize {
        self.counters.len()
    }

    pub(crate) fn finish(self, with_reverse: bool) -> ReclaimMap {
        let target_doc_counts: Vec<u32> = self.counters.iter().map(|c| *c as u32).collect();
        let mut map = ReclaimMap::from_parts(
            self.old_to_new,
            self.target_indexes,
            self.segments,
            target_doc_counts,
            self.deleted_doc_count,
            None,
        );
        if with_reverse {
            let mut new_to_old = vec![0 as GlobalId; map.new_doc_count() as usize];
            for (old, new_id) in map.old_to_new.iter().enumerate() {
                if *new_id == INVALID_DOCID {
                    continue;
                }
                let target = map.target_segment_index(old as GlobalId);
                let new_global = map.target_bases[target] + *new_id as GlobalId;
                new_to_old[new_global as usize] = old as GlobalId;
            }
            map.doc_order = Some(DocOrder { new_to_old });
        }
        map
    }
}

/// Reclaim map of sub documents together with the rewritten join values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubReclaimMap {
    /// Sub doc remapping; live sub docs follow their main doc's target.
    pub map: ReclaimMap,

    /// Per target: exclusive end of each new main doc's sub docs.
    pub main_to_sub_end: Vec<Vec<DocId>>,

    /// Per target: new main doc id of each new sub doc.
    pub sub_to_main: Vec<Vec<DocId>>,
}

impl SubReclaimMap {
    pub fn store(&self, storage: &dyn Storage, path: &str) -> Result<()> {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(SUB_RECLAIM_MAP_MAGIC)?;
        buf.write_u32::<LittleEndian>(RECLAIM_MAP_VERSION)?;
        self.map.encode(&mut buf)?;
        for joins in [&self.main_to_sub_end, &self.sub_to_main] {
            buf.write_u32::<LittleEndian>(joins.len() as u32)?;
            for values in joins {
                write_i32s(&mut buf, values)?;
            }
        }
        let checksum = crc32fast::hash(&buf);
        buf.write_u32::<LittleEndian>(checksum)?;
        write_atomic(storage, path, &buf)
    }

    pub fn load(storage: &dyn Storage, path: &str) -> Result<SubReclaimMap> {
        let bytes = read_all(storage, path)?;
        let payload = verify_checksum(&bytes, SUB_RECLAIM_MAP_MAGIC, path)?;
        let mut cursor = Cursor::new(payload);
        let map = ReclaimMap::decode(&mut cursor)?;
        let mut joins = Vec::with_capacity(2);
        for _ in 0..2 {
            let targets = cursor.read_u32::<LittleEndian>()? as usize;
            let mut values = Vec::with_capacity(targets);
            for _ in 0..targets {
                values.push(read_i32s(&mut cursor)?);
            }
            joins.push(values);
        }
        let sub_to_main = joins.pop().unwrap_or_default();
        let main_to_sub_end = joins.pop().unwrap_or_default();
        Ok(SubReclaimMap {
            map,
            main_to_sub_end,
            sub_to_main,
        })
    }
}

/// Check magic and trailing crc32, returning the bytes between them.
fn verify_checksum<'a>(bytes: &'a [u8], magic: u32, path: &str) -> Result<&'a [u8]> {
    if bytes.len() < 12 {
        return Err(MergeError::corrupted(format!("{path} is truncated")));
    }
    let (body, tail) = bytes.split_at(bytes.len() - 4);
    let stored = (&tail[..]).read_u32::<LittleEndian>()?;
    if crc32fast::hash(body) != stored {
        return Err(MergeError::corrupted(format!("{path} checksum mismatch")));
    }
    let mut head = &body[..4];
    if head.read_u32::<LittleEndian>()? != magic {
        return Err(MergeError::corrupted(format!("{path} has an invalid magic")));
    }
    Ok(&body[4..])
}

fn write_i32s(buf: &mut Vec<u8>, values: &[i32]) -> Result<()> {
    buf.write_u64::<LittleEndian>(values.len() as u64)?;
    for value in values {
        buf.write_i32::<LittleEndian>(*value)?;
    }
    Ok(())
}

fn write_u32s(buf: &mut Vec<u8>, values: &[u32]) -> Result<()> {
    buf.write_u64::<LittleEndian>(values.len() as u64)?;
    for value in values {
        buf.write_u32::<LittleEndian>(*value)?;
    }
    Ok(())
}

fn read_i32s<R: Read>(reader: &mut R) -> Result<Vec<i32>> {
    let len = reader.read_u64::<LittleEndian>()? as usize;
    let mut values = Vec::with_capacity(len.min(1 << 24));
    for _ in 0..len {
        values.push(reader.read_i32::<LittleEndian>()?);
    }
    Ok(values)
}

fn read_u32s<R: Read>(reader: &mut R) -> Result<Vec<u32>> {
    let len = reader.read_u64::<LittleEndian>()? as usize;
    let mut values = Vec::with_capacity(len.min(1 << 24));
    for _ in 0..len {
        values.push(reader.read_u32::<LittleEndian>()?);
    }
    Ok(values)
}
