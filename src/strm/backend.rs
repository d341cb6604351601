//! Stream backends.
//!
//! The stream core talks to storage through the [`StrmBackend`] trait: a
//! local file implementation ([`FileBackend`]) and whatever the caller
//! supplies.  [`MemBackend`] is the reference caller-supplied backend and
//! doubles as the in-memory target used by the test suite.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::err::{SsmError, SsmResult};

/// Free-space floor for the advisory disk guard.
pub const LOW_DISK_SPACE_FLOOR: u64 = 10 * 1024 * 1024;

/// Seek origin for [`StrmBackend::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMethod {
    Begin,
    Current,
    End,
}

/// Storage seam under the buffered stream.
///
/// All offsets are absolute stream offsets; a backend is used by at most
/// one thread at a time (the stream serializes access internally).
pub trait StrmBackend: Send {
    /// Write `data` at absolute offset `off`.
    fn write(&mut self, off: u64, data: &[u8]) -> SsmResult<()>;
    /// Read up to `out.len()` bytes at absolute offset `off`; returns the
    /// byte count, with 0 meaning end of stream.
    fn read(&mut self, off: u64, out: &mut [u8]) -> SsmResult<usize>;
    /// Reposition; returns the resulting absolute offset.
    fn seek(&mut self, off: i64, method: SeekMethod) -> SsmResult<u64>;
    /// Current absolute offset.
    fn tell(&self) -> u64;
    /// Total stream size.
    fn size(&mut self) -> SsmResult<u64>;
    /// Cheap liveness probe; the local-file implementation also fails with
    /// [`SsmError::LowOnDiskSpace`] when the volume is nearly full.
    fn is_ok(&mut self) -> SsmResult<()>;
    /// Release the backend.  `cancelled` signals an abandoned or failed
    /// operation so the backend can undo partial output.
    fn close(&mut self, cancelled: bool) -> SsmResult<()>;
    /// True for the local-file backend; gates the free-space guard and the
    /// partial-file delete on failure.
    fn is_file(&self) -> bool {
        false
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Local file backend
// ─────────────────────────────────────────────────────────────────────────────

/// Local-file backend.  Tracks its own position to skip redundant seeks.
pub struct FileBackend {
    file: Option<File>,
    path: PathBuf,
    pos: u64,
    write: bool,
}

impl FileBackend {
    /// Create (truncating) a file for writing.
    pub fn create(path: &Path) -> SsmResult<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(FileBackend {
            file: Some(file),
            path: path.to_path_buf(),
            pos: 0,
            write: true,
        })
    }

    /// Open an existing file for reading.
    pub fn open(path: &Path) -> SsmResult<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(FileBackend {
            file: Some(file),
            path: path.to_path_buf(),
            pos: 0,
            write: false,
        })
    }

    fn file_mut(&mut self) -> SsmResult<&mut File> {
        self.file.as_mut().ok_or(SsmError::StreamError)
    }

    fn position(&mut self, off: u64) -> SsmResult<()> {
        if self.pos != off {
            self.file_mut()?.seek(SeekFrom::Start(off))?;
            self.pos = off;
        }
        Ok(())
    }
}

impl StrmBackend for FileBackend {
    fn write(&mut self, off: u64, data: &[u8]) -> SsmResult<()> {
        self.position(off)?;
        self.file_mut()?.write_all(data)?;
        self.pos = off + data.len() as u64;
        Ok(())
    }

    fn read(&mut self, off: u64, out: &mut [u8]) -> SsmResult<usize> {
        self.position(off)?;
        let mut total = 0usize;
        while total < out.len() {
            let n = self.file_mut()?.read(&mut out[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        self.pos = off + total as u64;
        Ok(total)
    }

    fn seek(&mut self, off: i64, method: SeekMethod) -> SsmResult<u64> {
        let from = match method {
            SeekMethod::Begin => {
                if off < 0 {
                    return Err(SsmError::InvalidParameter);
                }
                SeekFrom::Start(off as u64)
            }
            SeekMethod::Current => SeekFrom::Current(off),
            SeekMethod::End => SeekFrom::End(off),
        };
        self.pos = self.file_mut()?.seek(from)?;
        Ok(self.pos)
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn size(&mut self) -> SsmResult<u64> {
        Ok(self.file_mut()?.metadata()?.len())
    }

    #[cfg(unix)]
    fn is_ok(&mut self) -> SsmResult<()> {
        if self.write {
            let file = self.file_mut()?;
            let st = nix::sys::statvfs::fstatvfs(file)
                .map_err(|_| SsmError::StreamError)?;
            let avail = st.blocks_available() as u64 * st.fragment_size() as u64;
            if avail < LOW_DISK_SPACE_FLOOR {
                return Err(SsmError::LowOnDiskSpace);
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn is_ok(&mut self) -> SsmResult<()> {
        Ok(())
    }

    fn close(&mut self, cancelled: bool) -> SsmResult<()> {
        // Drop the handle first so the unlink below works everywhere.
        self.file = None;
        if cancelled && self.write {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn is_file(&self) -> bool {
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory backend
// ─────────────────────────────────────────────────────────────────────────────

/// Growable in-memory backend.  The underlying bytes are shared so a test
/// (or an embedding) can keep a handle to the data across the stream's
/// lifetime.
#[derive(Clone)]
pub struct MemBackend {
    buf: Arc<Mutex<Vec<u8>>>,
    pos: u64,
}

impl MemBackend {
    pub fn new() -> Self {
        MemBackend {
            buf: Arc::new(Mutex::new(Vec::new())),
            pos: 0,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        MemBackend {
            buf: Arc::new(Mutex::new(bytes)),
            pos: 0,
        }
    }

    /// Shared handle to the backing bytes.
    pub fn bytes(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.buf)
    }

    /// Snapshot of the current contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.buf
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StrmBackend for MemBackend {
    fn write(&mut self, off: u64, data: &[u8]) -> SsmResult<()> {
        let mut buf = self.buf.lock().map_err(|_| SsmError::StreamError)?;
        let end = off as usize + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[off as usize..end].copy_from_slice(data);
        self.pos = end as u64;
        Ok(())
    }

    fn read(&mut self, off: u64, out: &mut [u8]) -> SsmResult<usize> {
        let buf = self.buf.lock().map_err(|_| SsmError::StreamError)?;
        let off = off as usize;
        if off >= buf.len() {
            return Ok(0);
        }
        let n = out.len().min(buf.len() - off);
        out[..n].copy_from_slice(&buf[off..off + n]);
        drop(buf);
        self.pos = (off + n) as u64;
        Ok(n)
    }

    fn seek(&mut self, off: i64, method: SeekMethod) -> SsmResult<u64> {
        let len = self.buf.lock().map_err(|_| SsmError::StreamError)?.len() as i64;
        let abs = match method {
            SeekMethod::Begin => off,
            SeekMethod::Current => self.pos as i64 + off,
            SeekMethod::End => len + off,
        };
        if abs < 0 {
            return Err(SsmError::InvalidParameter);
        }
        self.pos = abs as u64;
        Ok(self.pos)
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn size(&mut self) -> SsmResult<u64> {
        Ok(self.buf.lock().map_err(|_| SsmError::StreamError)?.len() as u64)
    }

    fn is_ok(&mut self) -> SsmResult<()> {
        Ok(())
    }

    fn close(&mut self, _cancelled: bool) -> SsmResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_backend_read_write_seek() {
        let mut be = MemBackend::new();
        be.write(0, b"hello").unwrap();
        be.write(5, b" world").unwrap();
        assert_eq!(be.size().unwrap(), 11);

        let mut out = [0u8; 5];
        assert_eq!(be.read(6, &mut out).unwrap(), 5);
        assert_eq!(&out, b"world");

        assert_eq!(be.seek(-5, SeekMethod::End).unwrap(), 6);
        assert_eq!(be.tell(), 6);

        // Reads past the end report EOF as zero bytes.
        assert_eq!(be.read(100, &mut out).unwrap(), 0);
    }

    #[test]
    fn mem_backend_sparse_write_zero_fills() {
        let mut be = MemBackend::new();
        be.write(4, b"x").unwrap();
        assert_eq!(be.to_vec(), vec![0, 0, 0, 0, b'x']);
    }

    #[test]
    fn file_backend_roundtrip_and_cancel_delete() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("strm.bin");

        let mut be = FileBackend::create(&path).unwrap();
        be.write(0, b"0123456789").unwrap();
        be.is_ok().expect("tmpfs should not be low on space");
        be.close(false).unwrap();
        assert!(path.exists());

        let mut rd = FileBackend::open(&path).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(rd.read(3, &mut out).unwrap(), 4);
        assert_eq!(&out, b"3456");
        assert_eq!(rd.size().unwrap(), 10);
        rd.close(false).unwrap();

        // A cancelled writer unlinks its partial output.
        let mut be = FileBackend::create(&path).unwrap();
        be.write(0, b"partial").unwrap();
        be.close(true).unwrap();
        assert!(!path.exists());
    }
}
