//! In-memory storage used by tests and by single-process merges.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};
use crate::storage::{Storage, StorageInput, StorageOutput};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStorageConfig {
    /// Initial capacity of the file table.
    #[serde(default)]
    pub initial_capacity: usize,
}

type FileTable = Arc<RwLock<HashMap<String, Arc<Vec<u8>>>>>;

/// Storage keeping every file as a byte vector.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    files: FileTable,
}

impl MemoryStorage {
    pub fn new(config: MemoryStorageConfig) -> Self {
        MemoryStorage {
            files: Arc::new(RwLock::new(HashMap::with_capacity(
                config.initial_capacity,
            ))),
        }
    }
}

impl Storage for MemoryStorage {
    fn create_output(&self, path: &str) -> Result<Box<dyn StorageOutput>> {
        self.files
            .write()
            .insert(path.to_string(), Arc::new(Vec::new()));
        Ok(Box::new(MemoryOutput {
            path: path.to_string(),
            buffer: Vec::new(),
            files: self.files.clone(),
        }))
    }

    fn open_input(&self, path: &str) -> Result<Box<dyn StorageInput>> {
        let data = self
            .files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| MergeError::not_found(format!("file {path}")))?;
        Ok(Box::new(MemoryInput {
            cursor: Cursor::new(data),
        }))
    }

    fn file_exists(&self, path: &str) -> bool {
        self.files.read().contains_key(path)
    }

    fn delete_file(&self, path: &str) -> Result<()> {
        self.files.write().remove(path);
        Ok(())
    }

    fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        let mut files = self.files.write();
        let data = files
            .remove(from)
            .ok_or_else(|| MergeError::not_found(format!("file {from}")))?;
        files.insert(to.to_string(), data);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.files.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[derive(Debug)]
struct MemoryInput {
    cursor: Cursor<Arc<Vec<u8>>>,
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let data = self.cursor.get_ref().as_slice();
        let pos = (self.cursor.position() as usize).min(data.len());
        let n = (&data[pos..]).read(buf)?;
        self.cursor.set_position((pos + n) as u64);
        Ok(n)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }
}

/// Bytes become visible to readers on flush.
#[derive(Debug)]
struct MemoryOutput {
    path: String,
    buffer: Vec<u8>,
    files: FileTable,
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.files
            .write()
            .insert(self.path.clone(), Arc::new(self.buffer.clone()));
        Ok(())
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut output = storage.create_output("a/b").unwrap();
        output.write_all(b"hello").unwrap();
        output.close().unwrap();

        let mut input = storage.open_input("a/b").unwrap();
        assert_eq!(input.size().unwrap(), 5);
        let mut buf = String::new();
        input.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "hello");
    }

    #[test]
    fn test_rename_and_delete() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        storage.create_output("x").unwrap().close().unwrap();
        storage.rename_file("x", "y").unwrap();
        assert!(!storage.file_exists("x"));
        assert!(storage.file_exists("y"));

        storage.delete_file("y").unwrap();
        assert!(storage.list_files().unwrap().is_empty());
        assert!(storage.open_input("y").is_err());
    }
}
