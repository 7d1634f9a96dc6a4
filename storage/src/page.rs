use std::hash::Hasher;
use std::sync::Arc;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rustc_hash::FxHasher;
use crate::error::{StorageError, StorageResult};
use crate::file_header::NO_PAGE;

/// Every page starts with this header. All numbers in network byte order (BE):
///
/// ```ascii
///  0: status (u8, see [PageStatus])
///  1: key length (u32)
///  5: key hash (u32)
///  9: data length (u32) - number of value bytes stored in this page
/// 13: record length (u32) - total length of the value across its overflow chain
/// 17: next page (u64) - next page in the overflow chain or the free list, NO_PAGE for none
/// 25: key bytes, followed by data bytes
/// ```
pub const PAGE_HEADER_SIZE: usize = 1 + 4 + 4 + 4 + 4 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PageStatus {
    Unused = b'U',
    Overflow = b'O',
    Leaf = b'L',
    Branch = b'B',
    Record = b'R',
    Deleted = b'D',
}

impl PageStatus {
    pub fn is_free(&self) -> bool {
        matches!(self, PageStatus::Unused | PageStatus::Deleted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageHeader {
    pub status: PageStatus,
    pub key_hash: u32,
    pub record_len: u32,
    pub next_page: Option<u64>,
}

impl PageHeader {
    pub fn new(status: PageStatus) -> PageHeader {
        PageHeader {
            status,
            key_hash: 0,
            record_len: 0,
            next_page: None,
        }
    }
}

/// A page's content in memory. Key and data lengths are taken from the vectors when the page
///  is serialized.
#[derive(Debug, Clone)]
pub struct Page {
    pub page_num: u64,
    pub header: PageHeader,
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

pub type PageRef = Arc<parking_lot::Mutex<Page>>;

pub fn key_hash(key: &[u8]) -> u32 {
    let mut hasher = FxHasher::default();
    hasher.write(key);
    hasher.finish() as u32
}

impl Page {
    pub fn new(page_num: u64, status: PageStatus) -> Page {
        Page {
            page_num,
            header: PageHeader::new(status),
            key: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn set_key(&mut self, key: &[u8]) {
        self.key = key.to_vec();
        self.header.key_hash = if key.is_empty() { 0 } else { key_hash(key) };
    }

    /// Reset the page to a free page with no content, keeping only its link
    pub fn clear(&mut self, status: PageStatus) {
        self.header = PageHeader {
            next_page: self.header.next_page,
            ..PageHeader::new(status)
        };
        self.key.clear();
        self.data.clear();
    }

    /// number of data bytes that fit into a page of the given size next to this page's key
    pub fn data_capacity(&self, page_size: usize) -> usize {
        page_size
            .saturating_sub(PAGE_HEADER_SIZE)
            .saturating_sub(self.key.len())
    }

    pub fn ser(&self, page_size: usize, buf: &mut BytesMut) -> StorageResult<()> {
        if PAGE_HEADER_SIZE + self.key.len() + self.data.len() > page_size {
            return Err(StorageError::InvalidArgument(format!(
                "content of page {} ({} key bytes, {} data bytes) does not fit into {} bytes",
                self.page_num, self.key.len(), self.data.len(), page_size)));
        }

        let start = buf.len();
        buf.put_u8(self.header.status.into());
        buf.put_u32(self.key.len() as u32);
        buf.put_u32(self.header.key_hash);
        buf.put_u32(self.data.len() as u32);
        buf.put_u32(self.header.record_len);
        buf.put_u64(self.header.next_page.unwrap_or(NO_PAGE));
        buf.put_slice(&self.key);
        buf.put_slice(&self.data);
        buf.put_bytes(0, page_size - (buf.len() - start));
        Ok(())
    }

    pub fn deser(page_num: u64, mut buf: &[u8]) -> StorageResult<Page> {
        let page_size = buf.len();
        if page_size < PAGE_HEADER_SIZE {
            return Err(StorageError::corrupt(format!("page {} is truncated", page_num)));
        }

        let raw_status = buf.get_u8();
        let status = PageStatus::try_from(raw_status)
            .map_err(|_| StorageError::corrupt(format!("page {} has invalid status {:#x}", page_num, raw_status)))?;
        let key_len = buf.get_u32() as usize;
        let key_hash = buf.get_u32();
        let data_len = buf.get_u32() as usize;
        let record_len = buf.get_u32();
        let next_page = match buf.get_u64() {
            NO_PAGE => None,
            n => Some(n),
        };

        if key_len + data_len > buf.remaining() {
            return Err(StorageError::corrupt(format!(
                "page {}: key length {} and data length {} exceed the page size {}",
                page_num, key_len, data_len, page_size)));
        }

        let key = buf[..key_len].to_vec();
        let data = buf[key_len..key_len + data_len].to_vec();

        Ok(Page {
            page_num,
            header: PageHeader {
                status,
                key_hash,
                record_len,
                next_page,
            },
            key,
            data,
        })
    }
}
