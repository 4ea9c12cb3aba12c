//! Storage abstraction for merge artifacts.
//!
//! Merge plans, reclaim maps, task items, checkpoints and merged segment data
//! are all written through [`Storage`], so the same merge code runs against an
//! in-memory backend in tests and against a directory on disk in production.
//!
//! Paths are `/`-separated and relative to the storage root.

use std::fmt::Debug;
use std::io::{Read, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod file;
pub mod memory;

use file::{FileStorage, FileStorageConfig};
use memory::{MemoryStorage, MemoryStorageConfig};

/// A readable file handle.
pub trait StorageInput: Read + Send + Debug {
    /// Total size of the file in bytes.
    fn size(&self) -> Result<u64>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A writable file handle.
pub trait StorageOutput: Write + Send + Debug {
    /// Flush buffered bytes and make them durable.
    fn flush_and_sync(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()> {
        self.flush_and_sync()
    }
}

/// A flat or hierarchical file namespace.
pub trait Storage: Send + Sync + Debug {
    /// Create (or truncate) a file for writing.
    fn create_output(&self, path: &str) -> Result<Box<dyn StorageOutput>>;

    /// Open an existing file for reading.
    fn open_input(&self, path: &str) -> Result<Box<dyn StorageInput>>;

    fn file_exists(&self, path: &str) -> bool;

    fn delete_file(&self, path: &str) -> Result<()>;

    fn rename_file(&self, from: &str, to: &str) -> Result<()>;

    /// List every file path under the root.
    fn list_files(&self) -> Result<Vec<String>>;
}

/// Storage backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageConfig {
    Memory(MemoryStorageConfig),
    File(FileStorageConfig),
}

/// Factory creating storage backends from configuration.
pub struct StorageFactory;

impl StorageFactory {
    pub fn create(config: StorageConfig) -> Result<Arc<dyn Storage>> {
        match config {
            StorageConfig::Memory(cfg) => Ok(Arc::new(MemoryStorage::new(cfg))),
            StorageConfig::File(cfg) => Ok(Arc::new(FileStorage::new(cfg)?)),
        }
    }
}

/// Write `bytes` to `name` through a temporary file so readers never observe
/// a partially written file.
pub fn write_atomic(storage: &dyn Storage, name: &str, bytes: &[u8]) -> Result<()> {
    let tmp_name = format!("{name}.tmp");
    let mut output = storage.create_output(&tmp_name)?;
    output.write_all(bytes)?;
    output.flush_and_sync()?;
    output.close()?;
    if storage.file_exists(name) {
        storage.delete_file(name)?;
    }
    storage.rename_file(&tmp_name, name)
}

/// Read a whole file into memory.
pub fn read_all(storage: &dyn Storage, name: &str) -> Result<Vec<u8>> {
    let mut input = storage.open_input(name)?;
    let mut buffer = Vec::with_capacity(input.size()? as usize);
    input.read_to_end(&mut buffer)?;
    input.close()?;
    Ok(buffer)
}

/// Join two storage path components.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_file() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        write_atomic(&storage, "plan", b"first").unwrap();
        write_atomic(&storage, "plan", b"second").unwrap();

        assert_eq!(read_all(&storage, "plan").unwrap(), b"second");
        assert!(!storage.file_exists("plan.tmp"));
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "a"), "a");
        assert_eq!(join_path("merge_meta", "a"), "merge_meta/a");
        assert_eq!(join_path("merge_meta/", "a"), "merge_meta/a");
    }
}
