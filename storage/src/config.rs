use anyhow::bail;
use crate::page::PAGE_HEADER_SIZE;
use crate::file_header::FILE_HEADER_SERIALIZED_LEN;

#[derive(Debug, Clone)]
pub struct PagedConfig {
    /// size of every page in the file, including the page header
    pub page_size: usize,
    /// space reserved for the file header at the start of the file
    pub file_header_size: usize,
    pub max_key_size: usize,
    /// number of pages that are allocated (and put on the free list) when a file is created
    pub primary_page_count: u64,
    pub page_cache_capacity: usize,
    pub node_cache_capacity: usize,
    /// maximum number of file handles open at the same time
    pub descriptor_pool_size: usize,
}

impl Default for PagedConfig {
    fn default() -> Self {
        PagedConfig {
            page_size: 4096,
            file_header_size: 4096,
            max_key_size: 256,
            primary_page_count: 16,
            page_cache_capacity: 1024,
            node_cache_capacity: 512,
            descriptor_pool_size: 4,
        }
    }
}

impl PagedConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.page_size < 256 {
            bail!("page size must be at least 256 bytes, was {}", self.page_size);
        }
        if self.page_size > u32::MAX as usize {
            bail!("page size {} exceeds the addressable maximum", self.page_size);
        }
        if self.file_header_size < FILE_HEADER_SERIALIZED_LEN {
            bail!("file header size must be at least {} bytes, was {}", FILE_HEADER_SERIALIZED_LEN, self.file_header_size);
        }
        if self.max_key_size == 0 {
            bail!("max key size must be positive");
        }
        // a branch needs room for several keys, and a record page for its key plus some data
        if self.max_key_size > (self.page_size - PAGE_HEADER_SIZE) / 4 {
            bail!("max key size {} is too big for a page size of {}", self.max_key_size, self.page_size);
        }
        if self.page_cache_capacity == 0 || self.node_cache_capacity == 0 {
            bail!("cache capacities must be positive");
        }
        if self.descriptor_pool_size == 0 {
            bail!("descriptor pool size must be positive");
        }
        Ok(())
    }
}
