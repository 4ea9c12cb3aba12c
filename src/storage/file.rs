//! Directory-backed storage.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};
use crate::storage::{Storage, StorageInput, StorageOutput};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStorageConfig {
    /// Root directory of the storage.
    pub path: PathBuf,

    /// Call `fsync` on flush.
    #[serde(default = "default_sync")]
    pub sync_on_flush: bool,
}

fn default_sync() -> bool {
    true
}

impl FileStorageConfig {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileStorageConfig {
            path: path.as_ref().to_path_buf(),
            sync_on_flush: true,
        }
    }
}

/// Storage rooted at a directory on the local file system.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    sync_on_flush: bool,
}

impl FileStorage {
    pub fn new(config: FileStorageConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Ok(FileStorage {
            root: config.path,
            sync_on_flush: config.sync_on_flush,
        })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.split('/').any(|part| part == "..") || path.starts_with('/') {
            return Err(MergeError::invalid_argument(format!(
                "path {path} escapes the storage root"
            )));
        }
        Ok(self.root.join(path))
    }

    fn collect(&self, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                self.collect(&path, out)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                let name = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(name);
            }
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn create_output(&self, path: &str) -> Result<Box<dyn StorageOutput>> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full)?;
        Ok(Box::new(FileOutput {
            writer: BufWriter::new(file),
            sync_on_flush: self.sync_on_flush,
        }))
    }

    fn open_input(&self, path: &str) -> Result<Box<dyn StorageInput>> {
        let full = self.resolve(path)?;
        let file = File::open(&full).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MergeError::not_found(format!("file {path}"))
            } else {
                MergeError::Io(e)
            }
        })?;
        let size = file.metadata()?.len();
        Ok(Box::new(FileInput { file, size }))
    }

    fn file_exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.is_file()).unwrap_or(false)
    }

    fn delete_file(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        match fs::remove_file(full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        let to_path = self.resolve(to)?;
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(self.resolve(from)?, to_path)?;
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        self.collect(&self.root, &mut names)?;
        names.sort();
        Ok(names)
    }
}

#[derive(Debug)]
struct FileInput {
    file: File,
    size: u64,
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }
}

#[derive(Debug)]
struct FileOutput {
    writer: BufWriter<File>,
    sync_on_flush: bool,
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        if self.sync_on_flush {
            self.writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_nested_paths() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(FileStorageConfig::new(dir.path())).unwrap();

        let mut output = storage.create_output("merge_meta/merge_plan_0/merge_plan").unwrap();
        output.write_all(b"{}").unwrap();
        output.close().unwrap();

        assert!(storage.file_exists("merge_meta/merge_plan_0/merge_plan"));
        assert_eq!(
            storage.list_files().unwrap(),
            vec!["merge_meta/merge_plan_0/merge_plan".to_string()]
        );
    }

    #[test]
    fn test_rejects_escaping_path() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(FileStorageConfig::new(dir.path())).unwrap();
        assert!(storage.create_output("../outside").is_err());
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(FileStorageConfig::new(dir.path())).unwrap();
        let err = storage.open_input("nope").unwrap_err();
        assert!(matches!(err, MergeError::NotFound(_)));
    }
}
