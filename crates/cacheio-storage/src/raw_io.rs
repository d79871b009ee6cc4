//! Positioned file I/O
//!
//! Thin wrapper over a host file used as the backing store of a
//! [`FileDevice`](crate::file_device::FileDevice). Reads and writes are
//! positioned (`pread`/`pwrite`), so one handle serves concurrent requests
//! without a shared seek cursor.

use cacheio_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Host file handle with positioned I/O
#[derive(Debug)]
pub struct RawFile {
    file: File,
    path: PathBuf,
}

impl RawFile {
    /// Open a file for I/O, creating it if missing
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::device(format!("failed to open {}: {e}", path.display())))?;

        Ok(Self { file, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current length of the host file
    pub fn len(&self) -> Result<u64> {
        let metadata = self.file.metadata().map_err(|e| {
            Error::device(format!("failed to get metadata for {}: {e}", self.path.display()))
        })?;
        Ok(metadata.len())
    }

    /// Read at `offset` until `buf` is full or the host file ends.
    ///
    /// Returns the number of bytes read.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match self.file.read_at(&mut buf[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(Error::device(format!(
                        "read failed on {}: {e}",
                        self.path.display()
                    )));
                }
            }
        }

        Ok(total)
    }

    /// Write all of `buf` at `offset`.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| Error::device(format!("write failed on {}: {e}", self.path.display())))
    }

    /// Set the length of the host file
    pub fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len).map_err(|e| {
            Error::device(format!("failed to set size for {}: {e}", self.path.display()))
        })
    }

    /// Sync data and metadata to disk
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::device(format!("sync failed on {}: {e}", self.path.display())))
    }

    /// Sync data only (not metadata) to disk
    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data().map_err(|e| {
            Error::device(format!("sync_data failed on {}: {e}", self.path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_raw_file_write_and_read() {
        let temp = NamedTempFile::new().unwrap();
        let file = RawFile::open(temp.path()).unwrap();

        file.write_at(4096, b"hello").unwrap();
        assert_eq!(file.len().unwrap(), 4101);

        let mut buf = [0u8; 8];
        let n = file.read_at(4096, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"hello");

        // Unwritten ranges read back as zero
        let n = file.read_at(0, &mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn test_raw_file_set_len() {
        let temp = NamedTempFile::new().unwrap();
        let file = RawFile::open(temp.path()).unwrap();
        file.write_at(0, &[1u8; 100]).unwrap();
        file.set_len(10).unwrap();
        file.sync().unwrap();

        assert_eq!(file.len().unwrap(), 10);
        let mut buf = [0u8; 20];
        assert_eq!(file.read_at(0, &mut buf).unwrap(), 10);
    }
}
