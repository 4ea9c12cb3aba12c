//! Pack attributes: several sub fields stored as one value per document.
//!
//! A pack value is a sequence of `field_count` entries. Each entry is a varint
//! of `len + 1` followed by `len` bytes, or a single `0` for an absent field.
//!
//! Segment data is uniq-encoded: equal values are stored once and every doc
//! points at the offset of its value in the data file.

use ahash::AHashMap;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{MergeError, Result};
use crate::index::segment::DocId;
use crate::storage::{Storage, join_path, read_all, write_atomic};
use crate::util::varint;

pub const DATA_FILE_NAME: &str = "data";
pub const OFFSET_FILE_NAME: &str = "offset";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackAttributeFormat {
    pub field_count: usize,
}

impl PackAttributeFormat {
    pub fn new(field_count: usize) -> Self {
        PackAttributeFormat { field_count }
    }

    pub fn check_field(&self, field_id: u16) -> Result<()> {
        if field_id as usize >= self.field_count {
            return Err(MergeError::invalid_argument(format!(
                "field {field_id} outside pack of {} fields",
                self.field_count
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackValue {
    fields: Vec<Option<Vec<u8>>>,
}

impl PackValue {
    pub fn empty(format: &PackAttributeFormat) -> Self {
        PackValue {
            fields: vec![None; format.field_count],
        }
    }

    pub fn field(&self, field_id: u16) -> Option<&[u8]> {
        self.fields
            .get(field_id as usize)
            .and_then(|f| f.as_deref())
    }

    pub fn set_field(&mut self, field_id: u16, value: Option<Vec<u8>>) -> Result<()> {
        let slot = self.fields.get_mut(field_id as usize).ok_or_else(|| {
            MergeError::invalid_argument(format!("field {field_id} outside pack value"))
        })?;
        *slot = value;
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        for field in &self.fields {
            match field {
                Some(bytes) => {
                    varint::write_u64(out, bytes.len() as u64 + 1);
                    out.extend_from_slice(bytes);
                }
                None => out.push(0),
            }
        }
    }

    pub fn decode(format: &PackAttributeFormat, bytes: &[u8]) -> Result<Self> {
        let mut fields = Vec::with_capacity(format.field_count);
        let mut pos = 0;
        for _ in 0..format.field_count {
            let (tag, read) = varint::decode_u64(&bytes[pos..])?;
            pos += read;
            if tag == 0 {
                fields.push(None);
                continue;
            }
            let len = (tag - 1) as usize;
            let end = pos
                .checked_add(len)
                .filter(|end| *end <= bytes.len())
                .ok_or_else(|| MergeError::corrupted("pack field runs past the value"))?;
            fields.push(Some(bytes[pos..end].to_vec()));
            pos = end;
        }
        if pos != bytes.len() {
            return Err(MergeError::corrupted(format!(
                "{} trailing bytes after pack value",
                bytes.len() - pos
            )));
        }
        Ok(PackValue { fields })
    }
}

/// Random access to the encoded pack values of one segment.
pub trait PackAttributeReader: Send + Sync {
    fn doc_count(&self) -> u32;

    fn read(&self, local_doc_id: DocId) -> Result<&[u8]>;
}

/// Uniq-encoded pack attribute data of one segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniqEncodedPackSegment {
    data: Vec<u8>,
    offsets: Vec<u64>,
}

impl UniqEncodedPackSegment {
    /// Number of distinct values stored.
    pub fn unique_count(&self) -> usize {
        let mut offsets = self.offsets.clone();
        offsets.sort_unstable();
        offsets.dedup();
        offsets.len()
    }

    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Write `<dir>/data` and `<dir>/offset`.
    pub fn store(&self, storage: &dyn Storage, dir: &str) -> Result<()> {
        let mut offsets = Vec::with_capacity(8 + self.offsets.len() * 8);
        offsets.write_u64::<LittleEndian>(self.offsets.len() as u64)?;
        for offset in &self.offsets {
            offsets.write_u64::<LittleEndian>(*offset)?;
        }
        write_atomic(storage, &join_path(dir, DATA_FILE_NAME), &self.data)?;
        write_atomic(storage, &join_path(dir, OFFSET_FILE_NAME), &offsets)
    }

    pub fn load(storage: &dyn Storage, dir: &str) -> Result<Self> {
        let data = read_all(storage, &join_path(dir, DATA_FILE_NAME))?;
        let offset_bytes = read_all(storage, &join_path(dir, OFFSET_FILE_NAME))?;
        let mut reader = offset_bytes.as_slice();
        let count = reader.read_u64::<LittleEndian>()?;
        let count = usize::try_from(count)
            .ok()
            .filter(|count| count.checked_mul(8) == Some(reader.len()))
            .ok_or_else(|| {
                MergeError::corrupted(format!(
                    "offset file of {dir} holds {} bytes for {count} docs",
                    reader.len()
                ))
            })?;
        let mut offsets = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = reader.read_u64::<LittleEndian>()?;
            if offset as usize >= data.len() {
                return Err(MergeError::corrupted(format!(
                    "offset {offset} outside data of {dir}"
                )));
            }
            offsets.push(offset);
        }
        Ok(UniqEncodedPackSegment { data, offsets })
    }
}

impl PackAttributeReader for UniqEncodedPackSegment {
    fn doc_count(&self) -> u32 {
        self.offsets.len() as u32
    }

    fn read(&self, local_doc_id: DocId) -> Result<&[u8]> {
        let offset = usize::try_from(local_doc_id)
            .ok()
            .and_then(|idx| self.offsets.get(idx))
            .copied()
            .ok_or_else(|| {
                MergeError::out_of_range(format!(
                    "doc {local_doc_id} outside pack data of {} docs",
                    self.offsets.len()
                ))
            })? as usize;
        let tail = self
            .data
            .get(offset..)
            .ok_or_else(|| MergeError::corrupted(format!("offset {offset} outside pack data")))?;
        let (len, read) = varint::decode_u64(tail)?;
        let start = offset + read;
        let end = usize::try_from(len)
            .ok()
            .and_then(|len| start.checked_add(len))
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                MergeError::corrupted(format!("pack value of doc {local_doc_id} runs past the data"))
            })?;
        Ok(&self.data[start..end])
    }
}

/// Appends values in doc order, storing each distinct value once.
#[derive(Debug, Default)]
pub struct UniqEncodedPackWriter {
    data: Vec<u8>,
    offsets: Vec<u64>,
    dedup: AHashMap<Vec<u8>, u64>,
}

impl UniqEncodedPackWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: &[u8]) {
        if let Some(offset) = self.dedup.get(value) {
            self.offsets.push(*offset);
            return;
        }
        let offset = self.data.len() as u64;
        varint::write_u64(&mut self.data, value.len() as u64);
        self.data.extend_from_slice(value);
        self.dedup.insert(value.to_vec(), offset);
        self.offsets.push(offset);
    }

    pub fn doc_count(&self) -> usize {
        self.offsets.len()
    }

    pub fn finish(self) -> UniqEncodedPackSegment {
        UniqEncodedPackSegment {
            data: self.data,
            offsets: self.offsets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    #[test]
    fn test_pack_value_encoding() {
        let format = PackAttributeFormat::new(3);
        let mut value = PackValue::empty(&format);
        value.set_field(0, Some(b"abc".to_vec())).unwrap();
        value.set_field(2, Some(Vec::new())).unwrap();

        let bytes = value.encode();
        assert_eq!(bytes, vec![4, b'a', b'b', b'c', 0, 1]);
        let decoded = PackValue::decode(&format, &bytes).unwrap();
        assert_eq!(decoded.field(0), Some(&b"abc"[..]));
        assert_eq!(decoded.field(1), None);
        assert_eq!(decoded.field(2), Some(&b""[..]));
        assert!(value.set_field(3, None).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let format = PackAttributeFormat::new(1);
        assert!(matches!(
            PackValue::decode(&format, &[0, 7]),
            Err(MergeError::Corrupted(_))
        ));
        assert!(PackValue::decode(&format, &[5, 1]).is_err());
    }

    #[test]
    fn test_writer_deduplicates() {
        let mut writer = UniqEncodedPackWriter::new();
        writer.push(b"red");
        writer.push(b"blue");
        writer.push(b"red");
        let segment = writer.finish();

        assert_eq!(segment.doc_count(), 3);
        assert_eq!(segment.unique_count(), 2);
        assert_eq!(segment.data_len(), 9);
        assert_eq!(segment.read(2).unwrap(), b"red");
        assert_eq!(segment.read(1).unwrap(), b"blue");
        assert!(segment.read(3).is_err());
    }

    #[test]
    fn test_store_and_load() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut writer = UniqEncodedPackWriter::new();
        for value in [&b"a"[..], b"bb", b"a"] {
            writer.push(value);
        }
        let segment = writer.finish();
        segment.store(&storage, "segment_1/attribute/pack").unwrap();

        let loaded = UniqEncodedPackSegment::load(&storage, "segment_1/attribute/pack").unwrap();
        assert_eq!(loaded, segment);
    }

    #[test]
    fn test_load_rejects_oversized_lengths() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut offsets = Vec::new();
        offsets.write_u64::<LittleEndian>(u64::MAX / 4).unwrap();
        offsets.write_u64::<LittleEndian>(0).unwrap();
        write_atomic(&storage, "bad/data", b"x").unwrap();
        write_atomic(&storage, "bad/offset", &offsets).unwrap();
        assert!(matches!(
            UniqEncodedPackSegment::load(&storage, "bad"),
            Err(MergeError::Corrupted(_))
        ));

        let mut data = Vec::new();
        varint::write_u64(&mut data, u64::MAX);
        let mut offsets = Vec::new();
        offsets.write_u64::<LittleEndian>(1).unwrap();
        offsets.write_u64::<LittleEndian>(0).unwrap();
        write_atomic(&storage, "huge/data", &data).unwrap();
        write_atomic(&storage, "huge/offset", &offsets).unwrap();
        let segment = UniqEncodedPackSegment::load(&storage, "huge").unwrap();
        assert!(matches!(segment.read(0), Err(MergeError::Corrupted(_))));
    }
}
