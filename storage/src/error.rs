use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("I/O error on {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("storage is closed")]
    Closed,

    #[error("key of {len} bytes exceeds the maximum of {max} bytes")]
    KeyTooLarge { len: usize, max: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("flushing failed for {failed} pages: {source}")]
    FlushFailed {
        failed: usize,
        #[source]
        source: std::io::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> StorageError {
        StorageError::Io { context: context.into(), source }
    }

    pub fn corrupt(detail: impl Into<String>) -> StorageError {
        StorageError::Corrupt(detail.into())
    }
}
