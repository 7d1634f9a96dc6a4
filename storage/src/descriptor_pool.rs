use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use parking_lot::{Condvar, Mutex};
use tracing::trace;
use crate::error::{StorageError, StorageResult};

struct PoolState {
    idle: Vec<File>,
    num_open: usize,
    closed: bool,
}

/// A bounded pool of file handles for one file. Handles are opened lazily up to the pool's
///  capacity; when all of them are checked out, callers block until one is returned.
pub struct DescriptorPool {
    path: PathBuf,
    capacity: usize,
    state: Mutex<PoolState>,
    returned: Condvar,
}

impl DescriptorPool {
    pub fn new(path: &Path, capacity: usize) -> DescriptorPool {
        DescriptorPool {
            path: path.to_path_buf(),
            capacity: capacity.max(1),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                num_open: 0,
                closed: false,
            }),
            returned: Condvar::new(),
        }
    }

    pub fn checkout(&self) -> StorageResult<Descriptor<'_>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(StorageError::Closed);
            }
            if let Some(file) = state.idle.pop() {
                return Ok(Descriptor { pool: self, file: Some(file) });
            }
            if state.num_open < self.capacity {
                state.num_open += 1;
                drop(state);

                return match OpenOptions::new().read(true).write(true).open(&self.path) {
                    Ok(file) => {
                        trace!("opened file handle for {:?}", self.path);
                        Ok(Descriptor { pool: self, file: Some(file) })
                    }
                    Err(e) => {
                        self.state.lock().num_open -= 1;
                        self.returned.notify_one();
                        Err(StorageError::io(format!("opening {:?}", self.path), e))
                    }
                };
            }
            self.returned.wait(&mut state);
        }
    }

    /// Release all idle handles and refuse further checkouts. Handles that are checked out
    ///  are closed when they are returned.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        let num_idle = state.idle.len();
        state.idle.clear();
        state.num_open -= num_idle;
        self.returned.notify_all();
    }

    pub fn num_open(&self) -> usize {
        self.state.lock().num_open
    }

    fn give_back(&self, file: File) {
        let mut state = self.state.lock();
        if state.closed {
            state.num_open -= 1;
        }
        else {
            state.idle.push(file);
        }
        self.returned.notify_one();
    }
}

/// A checked out file handle, returned to its pool when dropped
pub struct Descriptor<'a> {
    pool: &'a DescriptorPool,
    file: Option<File>,
}

impl Descriptor<'_> {
    fn file(&mut self) -> StorageResult<&mut File> {
        self.file.as_mut()
            .ok_or(StorageError::Closed)
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        let len = buf.len();
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(buf))
            .map_err(|e| StorageError::io(format!("reading {} bytes at offset {}", len, offset), e))
    }

    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> StorageResult<()> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(buf))
            .map_err(|e| StorageError::io(format!("writing {} bytes at offset {}", buf.len(), offset), e))
    }

    pub fn sync(&mut self) -> StorageResult<()> {
        self.file()?
            .sync_data()
            .map_err(|e| StorageError::io("syncing", e))
    }
}

impl Drop for Descriptor<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            self.pool.give_back(file);
        }
    }
}
