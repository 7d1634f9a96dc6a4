use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use bytes::BytesMut;
use parking_lot::RwLock;
use tracing::{debug, trace};
use crate::btree::BTree;
use crate::config::PagedConfig;
use crate::error::{StorageError, StorageResult};
use crate::filer::{Filer, Record, RecordMetadata, RecordSet};
use crate::paged::Paged;
use crate::page::PageStatus;

/// A [Filer] on a paged file. Each record lives in a `RECORD` page (continued in overflow pages
///  if necessary) that holds the record's key, its metadata and its value; the file's primary
///  tree maps keys to record pages.
///
/// Writers are serialized by a lock, readers run concurrently with each other.
pub struct BTreeFiler {
    paged: Arc<Paged>,
    tree: BTree,
    write_lock: RwLock<()>,
}

impl BTreeFiler {
    pub fn open(path: &Path, config: PagedConfig) -> StorageResult<BTreeFiler> {
        let paged = Arc::new(Paged::open_or_create(path, config)?);
        let tree = BTree::open_or_create(paged.clone())?;
        debug!("opened filer {:?} with {} records", path, paged.record_count());
        Ok(BTreeFiler {
            paged,
            tree,
            write_lock: RwLock::new(()),
        })
    }

    pub fn paged(&self) -> &Arc<Paged> {
        &self.paged
    }

    fn decode(&self, position: u64, status: PageStatus, key: Vec<u8>, stored: &[u8]) -> StorageResult<Record> {
        if status != PageStatus::Record {
            return Err(StorageError::corrupt(format!("page {} with status {:?} is not a record", position, status)));
        }
        let mut buf = stored;
        let metadata = RecordMetadata::deser(&mut buf)?;
        Ok(Record {
            key,
            value: buf.to_vec(),
            metadata,
            position,
        })
    }

    fn read_at(&self, position: u64) -> StorageResult<Record> {
        let stored = self.paged.read_value(position)?;
        self.decode(position, stored.status, stored.key, &stored.value)
    }

    fn unexpired(record: Record) -> Option<Record> {
        if record.metadata.is_expired(SystemTime::now()) {
            trace!("record at {} is expired", record.position);
            None
        }
        else {
            Some(record)
        }
    }
}

impl Filer for BTreeFiler {
    fn read_record(&self, key: &[u8]) -> StorageResult<Option<Record>> {
        let _guard = self.write_lock.read();
        match self.tree.find_value(key)? {
            None => Ok(None),
            Some(position) => {
                let record = self.read_at(position)?;
                if record.key != key {
                    return Err(StorageError::corrupt(format!("record page {} does not belong to its key", position)));
                }
                Ok(BTreeFiler::unexpired(record))
            }
        }
    }

    fn read_record_at(&self, position: u64) -> StorageResult<Option<Record>> {
        let _guard = self.write_lock.read();
        if position >= self.paged.total_page_count() {
            return Ok(None);
        }
        if self.paged.get_page(position)?.lock().header.status != PageStatus::Record {
            return Ok(None);
        }
        Ok(BTreeFiler::unexpired(self.read_at(position)?))
    }

    fn write_record_with(&self, key: &[u8], value: &[u8], lifetime: Option<Duration>, expiration: Option<SystemTime>) -> StorageResult<u64> {
        let _guard = self.write_lock.write();

        let max = self.paged.max_key_size();
        if key.len() > max {
            return Err(StorageError::KeyTooLarge { len: key.len(), max });
        }

        let existing = match self.tree.find_value(key)? {
            Some(position) => Some(self.read_at(position)?),
            None => None,
        };

        let now = SystemTime::now();
        let metadata = RecordMetadata::for_write(existing.as_ref().map(|r| &r.metadata), now, lifetime, expiration);
        let mut buf = BytesMut::with_capacity(RecordMetadata::SERIALIZED_LEN + value.len());
        metadata.ser(&mut buf);
        buf.extend_from_slice(value);

        let position = match existing {
            Some(record) => {
                self.paged.write_value(record.position, &buf)?;
                trace!("replaced record at {}", record.position);
                record.position
            }
            None => {
                let position = self.paged.allocate_page(PageStatus::Record, key)?;
                self.paged.write_value(position, &buf)?;
                self.tree.add_value(key, position)?;
                self.paged.set_record_count(self.paged.record_count() + 1);
                trace!("inserted record at {}", position);
                position
            }
        };
        Ok(position)
    }

    fn delete_record(&self, key: &[u8]) -> StorageResult<()> {
        let _guard = self.write_lock.write();

        let position = self.tree.remove_value(key)?;
        self.paged.unlink_pages(position)?;
        self.paged.set_record_count(self.paged.record_count().saturating_sub(1));
        trace!("deleted record at {}", position);
        Ok(())
    }

    fn record_count(&self) -> StorageResult<u64> {
        if self.paged.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(self.paged.record_count())
    }

    fn record_set(&self) -> StorageResult<RecordSet> {
        let _guard = self.write_lock.read();
        let mut keys = Vec::new();
        self.tree.query(None, |key, _| {
            keys.push(key.to_vec());
            true
        })?;
        Ok(keys.into_iter())
    }

    fn flush(&self) -> StorageResult<()> {
        let _guard = self.write_lock.write();
        self.tree.flush()
    }

    fn close(&self) -> StorageResult<()> {
        let _guard = self.write_lock.write();
        self.tree.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PagedConfig {
        PagedConfig {
            page_size: 512,
            file_header_size: 128,
            max_key_size: 64,
            primary_page_count: 8,
            ..PagedConfig::default()
        }
    }

    #[test]
    fn test_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.dat");
        let big_value = vec![42u8; 5000];
        {
            let filer = BTreeFiler::open(&path, config()).unwrap();
            filer.write_record(b"small", b"value").unwrap();
            filer.write_record(b"big", &big_value).unwrap();
            filer.close().unwrap();
        }

        let filer = BTreeFiler::open(&path, config()).unwrap();
        assert_eq!(filer.record_count().unwrap(), 2);
        assert_eq!(filer.read_record(b"small").unwrap().unwrap().value, b"value");
        assert_eq!(filer.read_record(b"big").unwrap().unwrap().value, big_value);
    }

    #[test]
    fn test_delete_frees_pages() {
        let dir = tempfile::tempdir().unwrap();
        let filer = BTreeFiler::open(&dir.path().join("records.dat"), config()).unwrap();

        filer.write_record(b"big", &vec![1u8; 3000]).unwrap();
        let free_before = filer.paged().free_page_count().unwrap();
        filer.delete_record(b"big").unwrap();
        assert!(filer.paged().free_page_count().unwrap() > free_before + 5);
    }

    #[test]
    fn test_overwrite_keeps_position() {
        let dir = tempfile::tempdir().unwrap();
        let filer = BTreeFiler::open(&dir.path().join("records.dat"), config()).unwrap();

        let position = filer.write_record(b"k", b"v1").unwrap();
        assert_eq!(filer.write_record(b"k", b"v2").unwrap(), position);
        assert_eq!(filer.read_record_at(position).unwrap().unwrap().value, b"v2");
        assert_eq!(filer.record_count().unwrap(), 1);
    }

    #[test]
    fn test_read_record_at_non_record() {
        let dir = tempfile::tempdir().unwrap();
        let filer = BTreeFiler::open(&dir.path().join("records.dat"), config()).unwrap();

        let root = filer.paged().root_page().unwrap();
        assert_eq!(filer.read_record_at(root).unwrap(), None);
        assert_eq!(filer.read_record_at(10_000).unwrap(), None);
    }

    #[test]
    fn test_closed() {
        let dir = tempfile::tempdir().unwrap();
        let filer = BTreeFiler::open(&dir.path().join("records.dat"), config()).unwrap();
        filer.close().unwrap();

        assert!(matches!(filer.read_record(b"k"), Err(StorageError::Closed)));
        assert!(matches!(filer.write_record(b"k", b"v"), Err(StorageError::Closed)));
        assert!(matches!(filer.record_count(), Err(StorageError::Closed)));
    }
}
