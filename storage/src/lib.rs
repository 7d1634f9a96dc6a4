//! An embedded storage engine: a file of fixed-size pages with a B+tree index and a
//!  record-oriented key-value API on top.
//!
//! ## Layers
//!
//! * [paged::Paged] manages the file: a file header followed by consecutively numbered pages.
//!   It caches pages, batches modified pages until they are flushed, recycles freed pages
//!   through a free list and chains overflow pages for values that do not fit into a single
//!   page. File handles come from a bounded pool
//! * [btree::BTree] maps byte-string keys to `u64` pointers, storing its nodes in pages. A file
//!   has a primary tree, and further trees can be nested by storing their root page in another
//!   tree
//! * [filer::Filer] stores records (key, value, created / modified / expiration metadata), with
//!   an implementation on a paged file and one in memory
//!
//! ## File layout
//!
//! ```ascii
//! 0:                               file header (see [file_header::FileHeader]), padded
//! file header size:                page #0
//! file header size + page size:    page #1
//! ...
//! ```
//!
//! Each page starts with a page header (see [page::PAGE_HEADER_SIZE]), followed by the page's
//!  key (record pages only) and its data.

pub mod btree;
pub mod config;
pub mod descriptor_pool;
pub mod error;
pub mod file_header;
pub mod filer;
pub mod page;
pub mod paged;

pub use btree::{BTree, BTreeRootInfo, IndexQuery};
pub use config::PagedConfig;
pub use error::{StorageError, StorageResult};
pub use filer::{BTreeFiler, Filer, MemFiler, Record, RecordMetadata};
pub use paged::Paged;
