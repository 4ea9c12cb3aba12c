//! Deletion maps of source segments.
//!
//! The merge only needs to ask "is local doc D of segment S deleted"; the
//! [`DeletionMapReader`] trait is that seam. [`BitmapDeletionMapReader`] is the
//! bitmap-backed implementation persisted as `<segment_id>.delmap` files.

use std::collections::HashMap;
use std::io::{Read, Write};

use bit_vec::BitVec;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{MergeError, Result};
use crate::index::segment::{DocId, SegmentId};
use crate::storage::{Storage, join_path};

const DELETION_BITMAP_MAGIC: u32 = 0x4445_4C42; // "DELB"
const DELETION_BITMAP_VERSION: u32 = 1;
const DELMAP_SUFFIX: &str = ".delmap";

/// Answers deletion queries for the segments of a merge.
pub trait DeletionMapReader: Send + Sync {
    /// Whether `local_doc_id` of `segment_id` is deleted.
    ///
    /// Callers guarantee the doc id lies inside the segment.
    fn is_deleted(&self, segment_id: SegmentId, local_doc_id: DocId) -> bool;

    fn deleted_doc_count(&self, segment_id: SegmentId) -> u32;
}

/// Deletion bitmap of one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletionBitmap {
    segment_id: SegmentId,
    bits: BitVec,
    deleted_count: u32,
}

impl DeletionBitmap {
    pub fn new(segment_id: SegmentId, doc_count: u32) -> Self {
        DeletionBitmap {
            segment_id,
            bits: BitVec::from_elem(doc_count as usize, false),
            deleted_count: 0,
        }
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn doc_count(&self) -> u32 {
        self.bits.len() as u32
    }

    /// Mark a document as deleted. Returns false if it already was.
    pub fn delete(&mut self, doc_id: DocId) -> Result<bool> {
        if doc_id < 0 || doc_id as usize >= self.bits.len() {
            return Err(MergeError::out_of_range(format!(
                "document {doc_id} is out of range [0, {}) for segment {}",
                self.bits.len(),
                self.segment_id
            )));
        }
        if self.bits[doc_id as usize] {
            return Ok(false);
        }
        self.bits.set(doc_id as usize, true);
        self.deleted_count += 1;
        Ok(true)
    }

    pub fn is_deleted(&self, doc_id: DocId) -> bool {
        doc_id >= 0 && self.bits.get(doc_id as usize).unwrap_or(false)
    }

    pub fn deleted_count(&self) -> u32 {
        self.deleted_count
    }

    pub fn deletion_ratio(&self) -> f64 {
        if self.bits.is_empty() {
            0.0
        } else {
            self.deleted_count as f64 / self.bits.len() as f64
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(DELETION_BITMAP_MAGIC)?;
        writer.write_u32::<LittleEndian>(DELETION_BITMAP_VERSION)?;
        writer.write_i32::<LittleEndian>(self.segment_id)?;
        writer.write_u32::<LittleEndian>(self.bits.len() as u32)?;
        let bytes = self.bits.to_bytes();
        writer.write_u32::<LittleEndian>(bytes.len() as u32)?;
        writer.write_all(&bytes)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != DELETION_BITMAP_MAGIC {
            return Err(MergeError::corrupted("invalid deletion bitmap magic"));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != DELETION_BITMAP_VERSION {
            return Err(MergeError::corrupted(format!(
                "unsupported deletion bitmap version: {version}"
            )));
        }
        let segment_id = reader.read_i32::<LittleEndian>()?;
        let doc_count = reader.read_u32::<LittleEndian>()? as usize;
        let byte_len = reader.read_u32::<LittleEndian>()? as usize;
        if byte_len != doc_count.div_ceil(8) {
            return Err(MergeError::corrupted(format!(
                "deletion bitmap of segment {segment_id} has {byte_len} bytes for {doc_count} docs"
            )));
        }
        let mut bytes = vec![0u8; byte_len];
        reader.read_exact(&mut bytes)?;

        let mut bits = BitVec::from_bytes(&bytes);
        bits.truncate(doc_count);
        let deleted_count = bits.iter().filter(|b| *b).count() as u32;
        Ok(DeletionBitmap {
            segment_id,
            bits,
            deleted_count,
        })
    }
}

/// Bitmap-per-segment deletion reader.
///
/// Segments without a bitmap have no deleted documents.
#[derive(Debug, Clone, Default)]
pub struct BitmapDeletionMapReader {
    bitmaps: HashMap<SegmentId, DeletionBitmap>,
}

impl BitmapDeletionMapReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bitmap(&mut self, bitmap: DeletionBitmap) {
        self.bitmaps.insert(bitmap.segment_id(), bitmap);
    }

    /// Build a reader from explicit deleted doc ids per segment.
    pub fn from_deleted_docs<I, D>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = (SegmentId, u32, D)>,
        D: IntoIterator<Item = DocId>,
    {
        let mut reader = BitmapDeletionMapReader::new();
        for (segment_id, doc_count, deleted) in segments {
            let mut bitmap = DeletionBitmap::new(segment_id, doc_count);
            for doc_id in deleted {
                bitmap.delete(doc_id)?;
            }
            reader.add_bitmap(bitmap);
        }
        Ok(reader)
    }

    pub fn bitmap(&self, segment_id: SegmentId) -> Option<&DeletionBitmap> {
        self.bitmaps.get(&segment_id)
    }

    pub fn bitmap_mut(&mut self, segment_id: SegmentId) -> Option<&mut DeletionBitmap> {
        self.bitmaps.get_mut(&segment_id)
    }

    /// Write one `<segment_id>.delmap` file per bitmap under `dir`.
    pub fn store(&self, storage: &dyn Storage, dir: &str) -> Result<()> {
        for bitmap in self.bitmaps.values() {
            let path = join_path(dir, &format!("{}{DELMAP_SUFFIX}", bitmap.segment_id()));
            let mut output = storage.create_output(&path)?;
            bitmap.write_to(&mut output)?;
            output.close()?;
        }
        Ok(())
    }

    /// Load every `.delmap` file under `dir`.
    pub fn load(storage: &dyn Storage, dir: &str) -> Result<Self> {
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir.trim_end_matches('/'))
        };
        let mut reader = BitmapDeletionMapReader::new();
        for file in storage.list_files()? {
            let Some(name) = file.strip_prefix(&prefix) else {
                continue;
            };
            if name.contains('/') || !name.ends_with(DELMAP_SUFFIX) {
                continue;
            }
            let mut input = storage.open_input(&file)?;
            let bitmap = DeletionBitmap::read_from(&mut input)?;
            input.close()?;
            reader.add_bitmap(bitmap);
        }
        Ok(reader)
    }
}

impl DeletionMapReader for BitmapDeletionMapReader {
    fn is_deleted(&self, segment_id: SegmentId, local_doc_id: DocId) -> bool {
        self.bitmaps
            .get(&segment_id)
            .is_some_and(|bitmap| bitmap.is_deleted(local_doc_id))
    }

    fn deleted_doc_count(&self, segment_id: SegmentId) -> u32 {
        self.bitmaps
            .get(&segment_id)
            .map(|bitmap| bitmap.deleted_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    #[test]
    fn test_deletion_bitmap_operations() {
        let mut bitmap = DeletionBitmap::new(1, 100);

        assert!(bitmap.delete(5).unwrap());
        assert!(bitmap.delete(10).unwrap());
        assert!(bitmap.delete(15).unwrap());

        assert!(bitmap.is_deleted(5));
        assert!(bitmap.is_deleted(15));
        assert!(!bitmap.is_deleted(20));
        assert_eq!(bitmap.deleted_count(), 3);
        assert_eq!(bitmap.deletion_ratio(), 0.03);

        // Deleting twice does not count twice.
        assert!(!bitmap.delete(5).unwrap());
        assert_eq!(bitmap.deleted_count(), 3);
    }

    #[test]
    fn test_deletion_bitmap_out_of_range() {
        let mut bitmap = DeletionBitmap::new(1, 10);
        assert!(matches!(bitmap.delete(10), Err(MergeError::OutOfRange(_))));
        assert!(bitmap.delete(-1).is_err());
        assert!(!bitmap.is_deleted(150));
    }

    #[test]
    fn test_bitmap_persistence() {
        let mut bitmap = DeletionBitmap::new(3, 13);
        bitmap.delete(0).unwrap();
        bitmap.delete(12).unwrap();

        let mut bytes = Vec::new();
        bitmap.write_to(&mut bytes).unwrap();
        let restored = DeletionBitmap::read_from(&mut bytes.as_slice()).unwrap();

        assert_eq!(restored, bitmap);
        assert_eq!(restored.doc_count(), 13);
    }

    #[test]
    fn test_corrupted_magic() {
        let bytes = vec![0u8; 16];
        let err = DeletionBitmap::read_from(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, MergeError::Corrupted(_)));
    }

    #[test]
    fn test_reader_store_and_load() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let reader =
            BitmapDeletionMapReader::from_deleted_docs(vec![(0, 5, vec![2]), (2, 2, vec![1])])
                .unwrap();
        reader.store(&storage, "deletionmap").unwrap();

        let loaded = BitmapDeletionMapReader::load(&storage, "deletionmap").unwrap();
        assert!(loaded.is_deleted(0, 2));
        assert!(!loaded.is_deleted(0, 3));
        assert!(loaded.is_deleted(2, 1));
        assert!(!loaded.is_deleted(1, 0));
        assert_eq!(loaded.deleted_doc_count(0), 1);
        assert_eq!(loaded.deleted_doc_count(1), 0);
    }
}
