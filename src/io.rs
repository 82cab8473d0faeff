//! Positioned file I/O behind small traits so tests can inject mocks.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use crate::error::{EngineError, Result};

/// Trait for performing positioned I/O against one open file.
pub trait FileIo: Send + Sync {
    /// Reads exactly `dst.len()` bytes from the file at `off`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Reads as many bytes as the file holds at `off`, returning the count.
    ///
    /// A read past EOF returns fewer bytes than requested (possibly zero)
    /// instead of an error; the caller decides how to pad.
    fn read_at_partial(&self, off: u64, dst: &mut [u8]) -> Result<usize>;
    /// Writes all of `src` to the file at `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Synchronizes file data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
}

/// Trait over the directory-level operations the engine needs.
///
/// The buffer cache resolves versioned file names through this surface, so a
/// test can substitute an implementation that fails or lies about existence.
pub trait Vfs: Send + Sync {
    /// Opens `path` for read-write access.
    ///
    /// With `create` false, a missing file yields `Ok(None)` rather than an
    /// error; with `create` true the file (but not its parents) is created.
    fn open(&self, path: &Path, create: bool) -> Result<Option<Box<dyn FileIo>>>;
    /// Removes `path`, reporting whether a file existed.
    fn unlink(&self, path: &Path) -> Result<bool>;
    /// Creates `path` and any missing parent directories.
    fn create_dir_all(&self, path: &Path) -> Result<()>;
}

#[cfg(unix)]
mod positioned {
    use std::fs::File;
    use std::io::{self, ErrorKind};
    use std::os::unix::fs::FileExt;

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn read_partial(file: &File, mut off: u64, dst: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while total < dst.len() {
            let read = file.read_at(&mut dst[total..], off)?;
            if read == 0 {
                break;
            }
            total += read;
            off += read as u64;
        }
        Ok(total)
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod positioned {
    use std::fs::File;
    use std::io::{self, ErrorKind};
    use std::os::windows::fs::FileExt;

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn read_partial(file: &File, mut off: u64, dst: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while total < dst.len() {
            let read = file.seek_read(&mut dst[total..], off)?;
            if read == 0 {
                break;
            }
            total += read;
            off += read as u64;
        }
        Ok(total)
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

/// Standard file I/O over an `Arc<File>` handle.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an already-open file handle.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    fn file(&self) -> &File {
        &self.inner
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        positioned::read_exact(self.file(), off, dst).map_err(EngineError::from)
    }

    fn read_at_partial(&self, off: u64, dst: &mut [u8]) -> Result<usize> {
        positioned::read_partial(self.file(), off, dst).map_err(EngineError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        positioned::write_all(self.file(), off, src).map_err(EngineError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.file().sync_all().map_err(EngineError::from)
    }
}

/// [`Vfs`] implementation over the real file system.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdVfs;

impl Vfs for StdVfs {
    fn open(&self, path: &Path, create: bool) -> Result<Option<Box<dyn FileIo>>> {
        let result = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path);
        match result {
            Ok(file) => Ok(Some(Box::new(StdFileIo::new(file)))),
            Err(err) if err.kind() == ErrorKind::NotFound && !create => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn unlink(&self, path: &Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(EngineError::from)
    }
}
