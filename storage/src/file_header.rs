use bytes::{Buf, BufMut, BytesMut};
use crate::error::{StorageError, StorageResult};

pub const MAGIC: u32 = 0x5047_4254; // "PGBT"
pub const FORMAT_VERSION: u16 = 1;

/// sentinel for 'no page' in page links on disk
pub const NO_PAGE: u64 = u64::MAX;

pub const FILE_HEADER_SERIALIZED_LEN: usize = 4 + 2 + 2 + 4 + 4 + 4 + 8 + 8 + 8 + 8 + 8 + 8;

/// Bookkeeping data at the start of a paged file. All numbers in network byte order (BE):
///
/// ```ascii
///  0: magic (u32)
///  4: format version (u16)
///  6: page header size (u16)
///  8: page size (u32)
/// 12: file header size (u32)
/// 16: max key size (u32)
/// 20: primary page count (u64)
/// 28: total page count (u64)
/// 36: first page of the free list (u64, NO_PAGE if the list is empty)
/// 44: last page of the free list (u64, NO_PAGE if the list is empty)
/// 52: record count (u64)
/// 60: root page of the primary tree (u64, NO_PAGE if there is none)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub page_header_size: u16,
    pub page_size: u32,
    pub file_header_size: u32,
    pub max_key_size: u32,
    pub primary_count: u64,
    pub total_count: u64,
    pub first_free: Option<u64>,
    pub last_free: Option<u64>,
    pub record_count: u64,
    pub root_page: Option<u64>,
}

fn put_page_link(buf: &mut BytesMut, link: Option<u64>) {
    buf.put_u64(link.unwrap_or(NO_PAGE));
}

fn get_page_link(buf: &mut impl Buf) -> StorageResult<Option<u64>> {
    let raw = get_u64(buf)?;
    Ok(if raw == NO_PAGE { None } else { Some(raw) })
}

fn get_u64(buf: &mut impl Buf) -> StorageResult<u64> {
    buf.try_get_u64().map_err(|_| StorageError::corrupt("file header is truncated"))
}

fn get_u32(buf: &mut impl Buf) -> StorageResult<u32> {
    buf.try_get_u32().map_err(|_| StorageError::corrupt("file header is truncated"))
}

fn get_u16(buf: &mut impl Buf) -> StorageResult<u16> {
    buf.try_get_u16().map_err(|_| StorageError::corrupt("file header is truncated"))
}

impl FileHeader {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(MAGIC);
        buf.put_u16(FORMAT_VERSION);
        buf.put_u16(self.page_header_size);
        buf.put_u32(self.page_size);
        buf.put_u32(self.file_header_size);
        buf.put_u32(self.max_key_size);
        buf.put_u64(self.primary_count);
        buf.put_u64(self.total_count);
        put_page_link(buf, self.first_free);
        put_page_link(buf, self.last_free);
        buf.put_u64(self.record_count);
        put_page_link(buf, self.root_page);
    }

    pub fn deser(buf: &mut impl Buf) -> StorageResult<FileHeader> {
        let magic = get_u32(buf)?;
        if magic != MAGIC {
            return Err(StorageError::corrupt(format!("not a paged file: magic number {:#x}", magic)));
        }
        let version = get_u16(buf)?;
        if version != FORMAT_VERSION {
            return Err(StorageError::corrupt(format!("unsupported format version {}", version)));
        }

        Ok(FileHeader {
            page_header_size: get_u16(buf)?,
            page_size: get_u32(buf)?,
            file_header_size: get_u32(buf)?,
            max_key_size: get_u32(buf)?,
            primary_count: get_u64(buf)?,
            total_count: get_u64(buf)?,
            first_free: get_page_link(buf)?,
            last_free: get_page_link(buf)?,
            record_count: get_u64(buf)?,
            root_page: get_page_link(buf)?,
        })
    }
}
