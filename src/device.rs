//! The random-access block device `spec.md` §1 names as an external
//! collaborator: "OS file I/O (treated as a random-access block device with
//! `read(off,len)`, `write(off,buf)`, `flush()`, `size()`, `grow(n)`)".

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::Mutex,
};
use tracing::instrument;

/// A random-access block device. Implementations need not be `Send`/`Sync`
/// themselves; the engine wraps them in a `Mutex` at the point it shares one
/// across [`crate::ndb::context::DbContext`] instances (`spec.md` §5).
pub trait Device {
    fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
    fn size(&mut self) -> io::Result<u64>;
    fn grow(&mut self, new_size: u64) -> io::Result<()>;
}

/// Device backed by a real file, used outside of tests.
pub struct FileDevice {
    file: File,
}

impl FileDevice {
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        Ok(Self { file })
    }

    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        Ok(Self { file })
    }
}

impl Device for FileDevice {
    fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0_u8; len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_data()
    }

    fn size(&mut self) -> io::Result<u64> {
        self.file.seek(SeekFrom::End(0))
    }

    fn grow(&mut self, new_size: u64) -> io::Result<()> {
        self.file.set_len(new_size)
    }
}

/// In-memory device used by unit and scenario tests so they don't need a
/// real filesystem to exercise commit/rebuild/crash-recovery behavior.
#[derive(Default)]
pub struct MemoryDevice {
    bytes: Vec<u8>,
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the raw bytes, as if the device had just crashed and were
    /// reopened from what had actually reached storage.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl Device for MemoryDevice {
    fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let offset = offset as usize;
        if offset + len > self.bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of device",
            ));
        }
        Ok(self.bytes[offset..offset + len].to_vec())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let offset = offset as usize;
        if offset + buf.len() > self.bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "write past end of device",
            ));
        }
        self.bytes[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.bytes.len() as u64)
    }

    fn grow(&mut self, new_size: u64) -> io::Result<()> {
        let new_size = new_size as usize;
        if new_size > self.bytes.len() {
            self.bytes.resize(new_size, 0);
        }
        Ok(())
    }
}

/// A device shared by every [`crate::ndb::context::DbContext`] descended
/// from the same root, guarded by a single mutex per `spec.md` §5's
/// "shared resources: the device ... are shared and mutex-guarded".
pub type SharedDevice = Mutex<Box<dyn Device + Send>>;
