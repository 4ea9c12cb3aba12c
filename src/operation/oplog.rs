//! Per segment operation logs.
//!
//! Records are stored as `[u32: length][json: OperationRecord]`, little endian
//! length, one after another. A partially written trailing record is ignored
//! on load.

use std::io::{Read, Write};

use log::warn;

use crate::error::Result;
use crate::operation::{Operation, OperationRecord, PrimaryKey};
use crate::storage::Storage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationLog<K> {
    records: Vec<OperationRecord<K>>,
}

impl<K> Default for OperationLog<K> {
    fn default() -> Self {
        OperationLog {
            records: Vec::new(),
        }
    }
}

impl<K: PrimaryKey> OperationLog<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, timestamp: i64, op: Operation<K>) {
        self.records.push(OperationRecord { timestamp, op });
    }

    pub fn records(&self) -> &[OperationRecord<K>] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Newest timestamp in the log.
    pub fn max_timestamp(&self) -> Option<i64> {
        self.records.iter().map(|r| r.timestamp).max()
    }

    pub fn store(&self, storage: &dyn Storage, path: &str) -> Result<()> {
        let mut output = storage.create_output(path)?;
        for record in &self.records {
            let bytes = serde_json::to_vec(record)?;
            let len = bytes.len() as u32;
            output.write_all(&len.to_le_bytes())?;
            output.write_all(&bytes)?;
        }
        output.flush_and_sync()?;
        output.close()
    }

    pub fn load(storage: &dyn Storage, path: &str) -> Result<Self> {
        let mut reader = storage.open_input(path)?;
        let size = reader.size()?;
        let mut position = 0;
        let mut records = Vec::new();

        while position < size {
            if position + 4 > size {
                warn!("Ignoring truncated length at {position} in {path}");
                break;
            }
            let mut len_bytes = [0u8; 4];
            reader.read_exact(&mut len_bytes)?;
            let len = u32::from_le_bytes(len_bytes) as u64;
            position += 4;

            if position + len > size {
                warn!("Ignoring truncated record at {position} in {path}");
                break;
            }
            let mut buffer = vec![0u8; len as usize];
            reader.read_exact(&mut buffer)?;
            position += len;

            records.push(serde_json::from_slice(&buffer)?);
        }
        reader.close()?;
        Ok(OperationLog { records })
    }
}
