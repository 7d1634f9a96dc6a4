use std::time::{Duration, SystemTime};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use crate::error::{StorageError, StorageResult};
use crate::filer::{Filer, Record, RecordMetadata, RecordSet};

#[derive(Default)]
struct MemRecords {
    by_key: FxHashMap<Vec<u8>, Record>,
    keys_by_position: FxHashMap<u64, Vec<u8>>,
    next_position: u64,
    closed: bool,
}

impl MemRecords {
    fn check_open(&self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

/// A [Filer] that keeps its records in memory. Record sets are sorted by key like those of a
///  [crate::filer::BTreeFiler].
#[derive(Default)]
pub struct MemFiler {
    records: RwLock<MemRecords>,
}

impl MemFiler {
    pub fn new() -> MemFiler {
        MemFiler::default()
    }
}

fn unexpired(record: &Record) -> Option<Record> {
    if record.metadata.is_expired(SystemTime::now()) {
        None
    }
    else {
        Some(record.clone())
    }
}

impl Filer for MemFiler {
    fn read_record(&self, key: &[u8]) -> StorageResult<Option<Record>> {
        let records = self.records.read();
        records.check_open()?;
        Ok(records.by_key.get(key).and_then(unexpired))
    }

    fn read_record_at(&self, position: u64) -> StorageResult<Option<Record>> {
        let records = self.records.read();
        records.check_open()?;
        Ok(records.keys_by_position.get(&position)
            .and_then(|key| records.by_key.get(key))
            .and_then(unexpired))
    }

    fn write_record_with(&self, key: &[u8], value: &[u8], lifetime: Option<Duration>, expiration: Option<SystemTime>) -> StorageResult<u64> {
        let mut records = self.records.write();
        records.check_open()?;

        let previous = records.by_key.get(key)
            .map(|r| (r.position, r.metadata));
        // same precision as records that went through a file
        let metadata = RecordMetadata::for_write(previous.as_ref().map(|(_, m)| m), SystemTime::now(), lifetime, expiration)
            .truncated();

        let position = match previous {
            Some((position, _)) => position,
            None => {
                let position = records.next_position;
                records.next_position += 1;
                records.keys_by_position.insert(position, key.to_vec());
                position
            }
        };

        records.by_key.insert(key.to_vec(), Record {
            key: key.to_vec(),
            value: value.to_vec(),
            metadata,
            position,
        });
        Ok(position)
    }

    fn delete_record(&self, key: &[u8]) -> StorageResult<()> {
        let mut records = self.records.write();
        records.check_open()?;

        let record = records.by_key.remove(key)
            .ok_or(StorageError::NotFound)?;
        records.keys_by_position.remove(&record.position);
        Ok(())
    }

    fn record_count(&self) -> StorageResult<u64> {
        let records = self.records.read();
        records.check_open()?;
        Ok(records.by_key.len() as u64)
    }

    fn record_set(&self) -> StorageResult<RecordSet> {
        let records = self.records.read();
        records.check_open()?;
        let mut keys = records.by_key.keys()
            .cloned()
            .collect::<Vec<_>>();
        keys.sort();
        Ok(keys.into_iter())
    }

    fn flush(&self) -> StorageResult<()> {
        self.records.read().check_open()
    }

    fn close(&self) -> StorageResult<()> {
        let mut records = self.records.write();
        records.closed = true;
        records.by_key.clear();
        records.keys_by_position.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positions_are_not_reused() {
        let filer = MemFiler::new();
        let a = filer.write_record(b"a", b"1").unwrap();
        filer.delete_record(b"a").unwrap();
        let b = filer.write_record(b"b", b"2").unwrap();
        assert_ne!(a, b);
        assert_eq!(filer.read_record_at(a).unwrap(), None);
        assert_eq!(filer.read_record_at(b).unwrap().unwrap().key, b"b");
    }

    #[test]
    fn test_closed() {
        let filer = MemFiler::new();
        filer.write_record(b"a", b"1").unwrap();
        filer.close().unwrap();
        assert!(matches!(filer.read_record(b"a"), Err(StorageError::Closed)));
        assert!(matches!(filer.record_count(), Err(StorageError::Closed)));
        assert!(matches!(filer.flush(), Err(StorageError::Closed)));
    }
}
