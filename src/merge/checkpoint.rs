//! Checkpoint files marking finished task items.

use std::sync::Arc;

use log::debug;

use crate::error::Result;
use crate::merge::task_item::MergeTaskItem;
use crate::storage::{Storage, join_path, write_atomic};

const CHECKPOINT_SUFFIX: &str = ".checkpoint";

/// Records finished task items as empty files named after
/// [`MergeTaskItem::checkpoint_name`], so a rerun can skip them.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    storage: Arc<dyn Storage>,
    dir: String,
}

impl CheckpointManager {
    pub fn new(storage: Arc<dyn Storage>, dir: impl Into<String>) -> Self {
        CheckpointManager {
            storage,
            dir: dir.into(),
        }
    }

    fn path(&self, item: &MergeTaskItem) -> String {
        join_path(&self.dir, &item.checkpoint_name())
    }

    pub fn mark_done(&self, item: &MergeTaskItem) -> Result<()> {
        let path = self.path(item);
        write_atomic(self.storage.as_ref(), &path, &[])?;
        debug!("Checkpoint written: {path}");
        Ok(())
    }

    pub fn is_done(&self, item: &MergeTaskItem) -> bool {
        self.storage.file_exists(&self.path(item))
    }

    /// Items without a checkpoint, in their original order.
    pub fn pending_items(&self, items: &[MergeTaskItem]) -> Vec<MergeTaskItem> {
        items
            .iter()
            .filter(|item| {
                let done = self.is_done(item);
                if done {
                    debug!("Skipping {item}: checkpoint exists");
                }
                !done
            })
            .cloned()
            .collect()
    }

    /// Remove every checkpoint file under the directory.
    pub fn clear(&self) -> Result<()> {
        let prefix = if self.dir.is_empty() {
            String::new()
        } else {
            format!("{}/", self.dir.trim_end_matches('/'))
        };
        for file in self.storage.list_files()? {
            let Some(name) = file.strip_prefix(&prefix) else {
                continue;
            };
            if !name.contains('/') && name.ends_with(CHECKPOINT_SUFFIX) {
                self.storage.delete_file(&file)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::task_item::MergeType;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    #[test]
    fn test_pending_items_skip_checkpointed() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new(MemoryStorageConfig::default()));
        let checkpoints = CheckpointManager::new(storage.clone(), "checkpoints");
        let items = vec![
            MergeTaskItem::new(0, MergeType::ATTRIBUTE, "price", false),
            MergeTaskItem::new(0, MergeType::INDEX, "title", false),
        ];

        checkpoints.mark_done(&items[1]).unwrap();
        assert!(storage.file_exists("checkpoints/MergePlan_0_index_title_-1.checkpoint"));
        assert!(checkpoints.is_done(&items[1]));

        let pending = checkpoints.pending_items(&items);
        assert_eq!(pending, vec![items[0].clone()]);

        checkpoints.clear().unwrap();
        assert_eq!(checkpoints.pending_items(&items).len(), 2);
    }
}
