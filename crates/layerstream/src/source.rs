//! Positioned-read backends for the chunked loader.
//!
//! Every read names its absolute offset, so concurrent chunks never share a
//! file cursor. [`FileSource`] can additionally keep one independently
//! opened handle per chunk.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Random-access, read-only byte source.
///
/// `read_at` has `pread` semantics: it may return fewer bytes than
/// requested, and returns `Ok(0)` at end of data. Callers loop until the
/// buffer is full.
pub trait LayerSource: Send + Sync {
    /// Read into `buf` starting at absolute `offset`, using handle `lane`.
    ///
    /// `lane` is the chunk index; backends with several handles use it to
    /// spread concurrent reads, others ignore it.
    fn read_at(&self, lane: usize, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Total size in bytes.
    fn len(&self) -> io::Result<u64>;

    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Options for opening a [`FileSource`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenConfig {
    /// Open with `O_DIRECT`, bypassing the page cache (Linux only).
    pub direct_io: bool,
    /// Number of independent handles to open; `0` or `1` shares one.
    pub handles: usize,
}

/// File-backed source using `pread` on one or more handles.
pub struct FileSource {
    path: PathBuf,
    handles: Vec<File>,
}

impl std::fmt::Debug for FileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSource")
            .field("path", &self.path)
            .field("handles", &self.handles.len())
            .finish()
    }
}

impl FileSource {
    /// Open `path` read-only with a single shared handle.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::open_with(path, OpenConfig::default())
    }

    pub fn open_with(path: impl AsRef<Path>, config: OpenConfig) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let count = config.handles.max(1);
        let handles = (0..count)
            .map(|_| open_read_only(&path, config.direct_io))
            .collect::<io::Result<Vec<_>>>()?;

        tracing::debug!(
            "FileSource: opened {} ({} handle(s), direct_io={})",
            path.display(),
            handles.len(),
            config.direct_io,
        );

        Ok(Self { path, handles })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }
}

#[cfg(target_os = "linux")]
fn open_read_only(path: &Path, direct_io: bool) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut opts = OpenOptions::new();
    opts.read(true);
    if direct_io {
        opts.custom_flags(libc::O_DIRECT);
    }
    opts.open(path)
}

#[cfg(not(target_os = "linux"))]
fn open_read_only(path: &Path, direct_io: bool) -> io::Result<File> {
    if direct_io {
        tracing::warn!("direct I/O is only supported on Linux; using buffered reads");
    }
    OpenOptions::new().read(true).open(path)
}

impl LayerSource for FileSource {
    fn read_at(&self, lane: usize, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let file = &self.handles[lane % self.handles.len()];
        pread(file, buf, offset)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.handles[0].metadata()?.len())
    }
}

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

/// In-memory source, for tests and tooling.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl LayerSource for MemorySource {
    fn read_at(&self, _lane: usize, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset exceeds usize"))?;
        if start >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }
}
