//! Record-oriented key-value stores: [BTreeFiler] on a paged file, [MemFiler] in memory.

mod btree_filer;
mod mem_filer;

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use bytes::{Buf, BufMut, BytesMut};
use crate::error::{StorageError, StorageResult};

pub use btree_filer::BTreeFiler;
pub use mem_filer::MemFiler;

/// snapshot of the keys in a filer at the time it was taken
pub type RecordSet = std::vec::IntoIter<Vec<u8>>;

/// A store of records by key. Expired records are not returned by reads, but they are counted
///  and listed until they are overwritten or deleted.
pub trait Filer: Send + Sync {
    fn read_record(&self, key: &[u8]) -> StorageResult<Option<Record>>;

    /// Read a record by the position returned when it was written. Positions are stable as long
    ///  as the record exists.
    fn read_record_at(&self, position: u64) -> StorageResult<Option<Record>>;

    /// Insert or replace a record, returning its position
    fn write_record(&self, key: &[u8], value: &[u8]) -> StorageResult<u64> {
        self.write_record_with(key, value, None, None)
    }

    /// Insert or replace a record with an expiration. If only a lifetime is given, the record
    ///  expires that long after it is written.
    fn write_record_with(&self, key: &[u8], value: &[u8], lifetime: Option<Duration>, expiration: Option<SystemTime>) -> StorageResult<u64>;

    /// Fails with [StorageError::NotFound] if there is no record for the key
    fn delete_record(&self, key: &[u8]) -> StorageResult<()>;

    fn record_count(&self) -> StorageResult<u64>;

    fn record_set(&self) -> StorageResult<RecordSet>;

    fn flush(&self) -> StorageResult<()>;

    fn close(&self) -> StorageResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMetadata {
    pub created: SystemTime,
    pub modified: SystemTime,
    pub lifetime: Option<Duration>,
    pub expiration: Option<SystemTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub metadata: RecordMetadata,
    pub position: u64,
}

const NONE_MILLIS: u64 = u64::MAX;

fn to_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min((NONE_MILLIS - 1) as u128) as u64)
        .unwrap_or(0)
}

fn from_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}

impl RecordMetadata {
    /// serialized length in bytes
    pub const SERIALIZED_LEN: usize = 4 * 8;

    /// Metadata for a record that is written at `now`, replacing a previous version if there is
    ///  one.
    pub fn for_write(previous: Option<&RecordMetadata>, now: SystemTime, lifetime: Option<Duration>, expiration: Option<SystemTime>) -> RecordMetadata {
        RecordMetadata {
            created: previous.map_or(now, |p| p.created),
            modified: now,
            lifetime,
            expiration: expiration.or_else(|| lifetime.map(|l| now + l)),
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expiration.map_or(false, |e| e <= now)
    }

    /// All numbers in network byte order (BE), milliseconds since the epoch resp. milliseconds,
    ///  u64::MAX for 'none':
    ///
    /// ```ascii
    ///  0: created (u64)
    ///  8: modified (u64)
    /// 16: lifetime (u64)
    /// 24: expiration (u64)
    /// ```
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(to_millis(self.created));
        buf.put_u64(to_millis(self.modified));
        buf.put_u64(self.lifetime.map_or(NONE_MILLIS, |l| l.as_millis().min((NONE_MILLIS - 1) as u128) as u64));
        buf.put_u64(self.expiration.map_or(NONE_MILLIS, to_millis));
    }

    pub fn deser(buf: &mut impl Buf) -> StorageResult<RecordMetadata> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(StorageError::corrupt("record metadata is truncated"));
        }
        let created = from_millis(buf.get_u64());
        let modified = from_millis(buf.get_u64());
        let lifetime = match buf.get_u64() {
            NONE_MILLIS => None,
            millis => Some(Duration::from_millis(millis)),
        };
        let expiration = match buf.get_u64() {
            NONE_MILLIS => None,
            millis => Some(from_millis(millis)),
        };
        Ok(RecordMetadata { created, modified, lifetime, expiration })
    }

    /// round to the stored precision
    pub fn truncated(&self) -> RecordMetadata {
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_LEN);
        self.ser(&mut buf);
        match RecordMetadata::deser(&mut buf) {
            Ok(m) => m,
            Err(_) => *self,
        }
    }
}
