//! Index versions: the set of segments visible to readers.

use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};
use crate::index::segment::SegmentId;
use crate::storage::{Storage, read_all, write_atomic};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub version_id: i64,

    /// Segment ids in ascending order.
    pub segments: Vec<SegmentId>,

    /// Timestamp of the newest document covered by this version.
    pub timestamp: i64,
}

impl Version {
    pub fn new(version_id: i64, segments: Vec<SegmentId>, timestamp: i64) -> Self {
        let mut version = Version {
            version_id,
            segments,
            timestamp,
        };
        version.segments.sort_unstable();
        version.segments.dedup();
        version
    }

    pub fn file_name(version_id: i64) -> String {
        format!("version.{version_id}")
    }

    pub fn has_segment(&self, segment_id: SegmentId) -> bool {
        self.segments.binary_search(&segment_id).is_ok()
    }

    pub fn last_segment_id(&self) -> Option<SegmentId> {
        self.segments.last().copied()
    }

    /// Next version with `removed` dropped and `added` inserted.
    ///
    /// Every removed segment must be part of this version.
    pub fn apply_merge(
        &self,
        removed: &[SegmentId],
        added: &[SegmentId],
        timestamp: i64,
    ) -> Result<Version> {
        for segment_id in removed {
            if !self.has_segment(*segment_id) {
                return Err(MergeError::not_found(format!(
                    "segment {segment_id} is not part of version {}",
                    self.version_id
                )));
            }
        }
        let mut segments: Vec<SegmentId> = self
            .segments
            .iter()
            .copied()
            .filter(|id| !removed.contains(id))
            .collect();
        segments.extend_from_slice(added);
        Ok(Version::new(
            self.version_id + 1,
            segments,
            self.timestamp.max(timestamp),
        ))
    }

    pub fn store(&self, storage: &dyn Storage) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(storage, &Self::file_name(self.version_id), &bytes)
    }

    pub fn load(storage: &dyn Storage, version_id: i64) -> Result<Version> {
        let bytes = read_all(storage, &Self::file_name(version_id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    #[test]
    fn test_apply_merge() {
        let version = Version::new(3, vec![4, 1, 2, 3], 100);
        let next = version.apply_merge(&[1, 2, 3], &[5], 120).unwrap();

        assert_eq!(next.version_id, 4);
        assert_eq!(next.segments, vec![4, 5]);
        assert_eq!(next.timestamp, 120);
    }

    #[test]
    fn test_apply_merge_unknown_segment() {
        let version = Version::new(0, vec![1], 0);
        assert!(version.apply_merge(&[9], &[10], 0).is_err());
    }

    #[test]
    fn test_store_and_load() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let version = Version::new(7, vec![1, 8], 42);
        version.store(&storage).unwrap();

        assert!(storage.file_exists("version.7"));
        assert_eq!(Version::load(&storage, 7).unwrap(), version);
    }
}
