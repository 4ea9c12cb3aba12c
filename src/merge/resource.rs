//! Artifacts shared between the parallel instances of a task item.

use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};
use crate::index::segment::GlobalId;
use crate::storage::{Storage, join_path, read_all, write_atomic};

pub const MERGE_RESOURCE_DIR_NAME: &str = "merge_resource";
const RESOURCE_FILE_PREFIX: &str = "resource_";

/// Registry of opaque resources referenced by
/// [`ParallelMergeItem`](super::task_item::ParallelMergeItem) resource ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeTaskResourceManager {
    resources: Vec<Vec<u8>>,
}

impl MergeTaskResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource and return its id.
    pub fn declare(&mut self, data: Vec<u8>) -> i64 {
        self.resources.push(data);
        (self.resources.len() - 1) as i64
    }

    pub fn get(&self, resource_id: i64) -> Result<&[u8]> {
        usize::try_from(resource_id)
            .ok()
            .and_then(|idx| self.resources.get(idx))
            .map(Vec::as_slice)
            .ok_or_else(|| MergeError::not_found(format!("merge resource {resource_id}")))
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Write `<dir>/merge_resource/resource_<id>` for every resource.
    pub fn store(&self, storage: &dyn Storage, dir: &str) -> Result<()> {
        let resource_dir = join_path(dir, MERGE_RESOURCE_DIR_NAME);
        for (id, data) in self.resources.iter().enumerate() {
            let path = join_path(&resource_dir, &format!("{RESOURCE_FILE_PREFIX}{id}"));
            write_atomic(storage, &path, data)?;
        }
        Ok(())
    }

    /// Load resources `0..n` written by [`store`](Self::store). Ids must be
    /// contiguous.
    pub fn load(storage: &dyn Storage, dir: &str) -> Result<Self> {
        let resource_dir = join_path(dir, MERGE_RESOURCE_DIR_NAME);
        let prefix = format!("{resource_dir}/{RESOURCE_FILE_PREFIX}");
        let mut ids = Vec::new();
        for file in storage.list_files()? {
            let Some(id) = file.strip_prefix(&prefix) else {
                continue;
            };
            if let Ok(id) = id.parse::<usize>() {
                ids.push(id);
            }
        }
        ids.sort_unstable();

        let mut manager = MergeTaskResourceManager::new();
        for (expected, id) in ids.into_iter().enumerate() {
            if id != expected {
                return Err(MergeError::corrupted(format!(
                    "merge resource {expected} is missing under {resource_dir}"
                )));
            }
            let path = join_path(&resource_dir, &format!("{RESOURCE_FILE_PREFIX}{id}"));
            manager.declare(read_all(storage, &path)?);
        }
        Ok(manager)
    }
}

/// Split of a new doc id space into contiguous `[start, end)` ranges, one per
/// parallel instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRangePartition {
    pub ranges: Vec<(GlobalId, GlobalId)>,
}

impl DocRangePartition {
    /// Ranges of near equal size covering `0..doc_count`.
    pub fn even(doc_count: u64, parts: usize) -> Result<Self> {
        if parts == 0 {
            return Err(MergeError::invalid_argument("partition needs at least one range"));
        }
        let doc_count = doc_count as u128;
        let ranges = (0..parts as u128)
            .map(|i| {
                let start = doc_count * i / parts as u128;
                let end = doc_count * (i + 1) / parts as u128;
                (start as GlobalId, end as GlobalId)
            })
            .collect();
        Ok(DocRangePartition { ranges })
    }

    pub fn range(&self, instance: usize) -> Result<(GlobalId, GlobalId)> {
        self.ranges.get(instance).copied().ok_or_else(|| {
            MergeError::out_of_range(format!(
                "instance {instance} outside partition of {} ranges",
                self.ranges.len()
            ))
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
