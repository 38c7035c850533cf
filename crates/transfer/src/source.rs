use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::TransferError;

/// Random-access view of the bytes being uploaded.
///
/// Implementations are blocking; async callers run them on
/// `tokio::task::spawn_blocking`.
pub trait FileSource: Send + Sync {
    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Reads exactly `length` bytes starting at `offset`.
    fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>, TransferError>;
}

/// A file on the local filesystem.
pub struct LocalFile {
    file: Mutex<std::fs::File>,
    size: u64,
}

impl LocalFile {
    /// Opens `path` and records its current size.
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let file = std::fs::File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

impl FileSource for LocalFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>, TransferError> {
        check_range(self.size, offset, length)?;
        let mut buf = vec![0u8; length as usize];
        // A poisoned lock only means another reader panicked mid-read; the
        // handle itself is still usable since every read seeks first.
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// An in-memory byte buffer.
#[derive(Clone)]
pub struct MemorySource {
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }
}

impl FileSource for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>, TransferError> {
        check_range(self.size(), offset, length)?;
        let start = offset as usize;
        Ok(self.data[start..start + length as usize].to_vec())
    }
}

fn check_range(size: u64, offset: u64, length: u64) -> Result<(), TransferError> {
    match offset.checked_add(length) {
        Some(end) if end <= size => Ok(()),
        _ => Err(TransferError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("range {offset}+{length} exceeds source size {size}"),
        ))),
    }
}
