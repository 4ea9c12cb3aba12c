use crate::operation::{OperationLog, OperationRecord, PrimaryKey};

/// Walks several operation logs in segment order.
///
/// Yields `(seg_idx, offset, record)` where `seg_idx` is the position of the
/// log and `offset` the position of the record inside it, so the pair is the
/// original write order. Records older than `min_timestamp` are skipped.
pub struct OperationIterator<'a, K> {
    logs: &'a [OperationLog<K>],
    min_timestamp: i64,
    seg_idx: usize,
    offset: usize,
}

impl<'a, K: PrimaryKey> OperationIterator<'a, K> {
    pub fn new(logs: &'a [OperationLog<K>], min_timestamp: i64) -> Self {
        OperationIterator {
            logs,
            min_timestamp,
            seg_idx: 0,
            offset: 0,
        }
    }
}

impl<'a, K: PrimaryKey> Iterator for OperationIterator<'a, K> {
    type Item = (u32, u32, &'a OperationRecord<K>);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(log) = self.logs.get(self.seg_idx) {
            let records = log.records();
            while let Some(record) = records.get(self.offset) {
                let offset = self.offset;
                self.offset += 1;
                if record.timestamp >= self.min_timestamp {
                    return Some((self.seg_idx as u32, offset as u32, record));
                }
            }
            self.seg_idx += 1;
            self.offset = 0;
        }
        None
    }
}
