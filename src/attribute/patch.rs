//! Attribute patches: field updates recorded after a segment was built.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};
use crate::index::segment::{DocId, SegmentId};
use crate::storage::{Storage, read_all, write_atomic};
use crate::util::varint;

const PATCH_FILE_MAGIC: u32 = 0x4150_4348; // "APCH"

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchEntry {
    pub doc_id: DocId,
    pub field_id: u16,
    pub value: Vec<u8>,
}

/// Updates of one segment's docs produced by one later segment.
///
/// `patch_segment_idx` orders patch files: a larger index was written later.
/// Inside a file the entry index is the write order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttributePatchFile {
    pub patch_segment_idx: u32,
    pub target_segment_id: SegmentId,
    pub entries: Vec<PatchEntry>,
}

impl AttributePatchFile {
    pub fn new(patch_segment_idx: u32, target_segment_id: SegmentId) -> Self {
        AttributePatchFile {
            patch_segment_idx,
            target_segment_id,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, doc_id: DocId, field_id: u16, value: Vec<u8>) {
        self.entries.push(PatchEntry {
            doc_id,
            field_id,
            value,
        });
    }

    /// Conventional file name `<patch_segment>_<target_segment>.patch`.
    pub fn file_name(patch_segment_idx: u32, target_segment_id: SegmentId) -> String {
        format!("{patch_segment_idx}_{target_segment_id}.patch")
    }

    pub fn store(&self, storage: &dyn Storage, path: &str) -> Result<()> {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(PATCH_FILE_MAGIC)?;
        buf.write_u32::<LittleEndian>(self.patch_segment_idx)?;
        buf.write_i32::<LittleEndian>(self.target_segment_id)?;
        buf.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        for entry in &self.entries {
            buf.write_i32::<LittleEndian>(entry.doc_id)?;
            buf.write_u16::<LittleEndian>(entry.field_id)?;
            varint::write_u64(&mut buf, entry.value.len() as u64);
            buf.extend_from_slice(&entry.value);
        }
        write_atomic(storage, path, &buf)
    }

    pub fn load(storage: &dyn Storage, path: &str) -> Result<Self> {
        let bytes = read_all(storage, path)?;
        let mut reader = bytes.as_slice();
        if reader.read_u32::<LittleEndian>()? != PATCH_FILE_MAGIC {
            return Err(MergeError::corrupted(format!("{path} is not a patch file")));
        }
        let patch_segment_idx = reader.read_u32::<LittleEndian>()?;
        let target_segment_id = reader.read_i32::<LittleEndian>()?;
        let count = reader.read_u32::<LittleEndian>()? as usize;
        let mut entries = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            let doc_id = reader.read_i32::<LittleEndian>()?;
            let field_id = reader.read_u16::<LittleEndian>()?;
            let (len, read) = varint::decode_u64(reader)?;
            reader = &reader[read..];
            let len = usize::try_from(len)
                .ok()
                .filter(|len| *len <= reader.len())
                .ok_or_else(|| {
                    MergeError::corrupted(format!("patch value of doc {doc_id} runs past {path}"))
                })?;
            let (value, rest) = reader.split_at(len);
            let value = value.to_vec();
            reader = rest;
            entries.push(PatchEntry {
                doc_id,
                field_id,
                value,
            });
        }
        Ok(AttributePatchFile {
            patch_segment_idx,
            target_segment_id,
            entries,
        })
    }
}

/// Owned byte buffer holding patch values of one merge, reused across merges
/// by keeping its capacity.
#[derive(Debug, Default)]
pub struct PatchBuffer {
    buf: Vec<u8>,
}

impl PatchBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        PatchBuffer {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Append `bytes`, returning `(start, len)`.
    pub fn append(&mut self, bytes: &[u8]) -> (usize, usize) {
        let start = self.buf.len();
        self.buf.extend_from_slice(bytes);
        (start, bytes.len())
    }

    pub fn slice(&self, start: usize, len: usize) -> &[u8] {
        &self.buf[start..start + len]
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }
}

/// A patch translated into the new doc id space of its target segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchedDocInfo {
    pub new_doc_id: DocId,
    pub old_doc_id: DocId,
    pub seg_idx: u32,
    pub offset: u32,
    pub field_id: u16,
    pub data_start: usize,
    pub data_len: usize,
}

impl PatchedDocInfo {
    /// Write order of the patch, ties broken by new doc id.
    pub fn sort_key(&self) -> (u32, u32, DocId) {
        (self.seg_idx, self.offset, self.new_doc_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    #[test]
    fn test_patch_file_store_and_load() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut patch = AttributePatchFile::new(3, 1);
        patch.push(4, 0, b"new".to_vec());
        patch.push(0, 2, Vec::new());
        let path = AttributePatchFile::file_name(3, 1);
        assert_eq!(path, "3_1.patch");
        patch.store(&storage, &path).unwrap();

        assert_eq!(AttributePatchFile::load(&storage, &path).unwrap(), patch);
    }

    #[test]
    fn test_truncated_patch_file() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut patch = AttributePatchFile::new(0, 0);
        patch.push(1, 0, b"value".to_vec());
        patch.store(&storage, "p").unwrap();

        let bytes = read_all(&storage, "p").unwrap();
        write_atomic(&storage, "p", &bytes[..bytes.len() - 2]).unwrap();
        assert!(AttributePatchFile::load(&storage, "p").is_err());
    }

    #[test]
    fn test_oversized_value_length() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(PATCH_FILE_MAGIC).unwrap();
        bytes.write_u32::<LittleEndian>(0).unwrap();
        bytes.write_i32::<LittleEndian>(1).unwrap();
        bytes.write_u32::<LittleEndian>(1).unwrap();
        bytes.write_i32::<LittleEndian>(0).unwrap();
        bytes.write_u16::<LittleEndian>(0).unwrap();
        varint::write_u64(&mut bytes, 1 << 44);
        bytes.extend_from_slice(b"abc");
        write_atomic(&storage, "0_1.patch", &bytes).unwrap();

        assert!(matches!(
            AttributePatchFile::load(&storage, "0_1.patch"),
            Err(MergeError::Corrupted(_))
        ));
    }

    #[test]
    fn test_patch_buffer_reuse() {
        let mut buffer = PatchBuffer::with_capacity(4);
        let (start, len) = buffer.append(b"abc");
        let (start2, len2) = buffer.append(b"de");
        assert_eq!(buffer.slice(start, len), b"abc");
        assert_eq!(buffer.slice(start2, len2), b"de");

        let capacity = buffer.capacity();
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), capacity);
    }

    #[test]
    fn test_sort_key_orders_by_write_order() {
        let info = |seg_idx, offset, new_doc_id| PatchedDocInfo {
            new_doc_id,
            old_doc_id: 0,
            seg_idx,
            offset,
            field_id: 0,
            data_start: 0,
            data_len: 0,
        };
        let mut infos = vec![info(1, 0, 0), info(0, 5, 9), info(0, 5, 2), info(0, 1, 7)];
        infos.sort_by_key(PatchedDocInfo::sort_key);
        let keys: Vec<_> = infos.iter().map(PatchedDocInfo::sort_key).collect();
        assert_eq!(keys, vec![(0, 1, 7), (0, 5, 2), (0, 5, 9), (1, 0, 0)]);
    }
}
