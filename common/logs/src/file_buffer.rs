use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use metrics::counter;
use thiserror::Error;
use tracing::debug;

use crate::metrics_consts::{FILE_BUFFER_BYTES_WRITTEN_COUNTER, FILE_LOCK_TIMEOUT_COUNTER};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum FileBufferError {
    #[error("timed out after {timeout:?} waiting for lock on {path}")]
    LockTimeout { path: PathBuf, timeout: Duration },
    #[error("io error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> FileBufferError + '_ {
    move |source| FileBufferError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A file opened for appending while holding an exclusive advisory lock. The lock
/// goes away with the file handle.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
}

impl Write for LockedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Open `path` for appending and take an exclusive lock on it, giving up after `timeout`.
pub fn lock_file(path: &Path, timeout: Duration) -> Result<LockedFile, FileBufferError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_error(path))?;
    let deadline = Instant::now() + timeout;
    loop {
        match try_lock_exclusive(&file) {
            Ok(true) => return Ok(LockedFile { file }),
            Ok(false) if Instant::now() < deadline => std::thread::sleep(LOCK_POLL_INTERVAL),
            Ok(false) => {
                return Err(FileBufferError::LockTimeout {
                    path: path.to_path_buf(),
                    timeout,
                })
            }
            Err(e) => return Err(io_error(path)(e)),
        }
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    use std::os::fd::AsRawFd;

    let fd = file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> io::Result<bool> {
    Ok(true)
}

/// Coalesces small appends per destination file and writes them out under an
/// exclusive lock, so several processes can append to the same files.
///
/// A file whose lock can't be taken within the timeout keeps its queued chunks;
/// [`FileBuffer::flush`] retries until everything is written, so a file that stays
/// locked forever stalls the flush.
#[derive(Debug)]
pub struct FileBuffer {
    buffers: BTreeMap<PathBuf, Vec<String>>,
    limit: usize,
    total_size: usize,
    lock_timeout: Duration,
}

impl FileBuffer {
    pub fn new(limit: usize, lock_timeout: Duration) -> Self {
        Self {
            buffers: BTreeMap::new(),
            limit,
            total_size: 0,
            lock_timeout,
        }
    }

    /// Queue `data` as one line of `path`. Crossing the size limit flushes everything.
    pub fn write(
        &mut self,
        path: impl Into<PathBuf>,
        data: impl Into<String>,
    ) -> Result<(), FileBufferError> {
        let data = data.into();
        self.total_size += data.len();
        self.buffers.entry(path.into()).or_default().push(data);
        if self.total_size >= self.limit {
            self.flush()?;
        }
        Ok(())
    }

    /// Bytes queued since the last complete flush
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn pending_paths(&self) -> impl Iterator<Item = &Path> {
        self.buffers.keys().map(PathBuf::as_path)
    }

    /// Write out everything queued, retrying files that are locked by someone else
    pub fn flush(&mut self) -> Result<(), FileBufferError> {
        while self.flush_pass()? > 0 {}
        self.total_size = 0;
        Ok(())
    }

    /// Try each queued file once. Returns how many files are still queued.
    pub fn flush_pass(&mut self) -> Result<usize, FileBufferError> {
        let paths: Vec<PathBuf> = self.buffers.keys().cloned().collect();
        for path in paths {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(io_error(parent))?;
            }
            let mut file = match lock_file(&path, self.lock_timeout) {
                Ok(file) => file,
                Err(FileBufferError::LockTimeout { .. }) => {
                    counter!(FILE_LOCK_TIMEOUT_COUNTER).increment(1);
                    debug!("Timeout writing to {}", path.display());
                    continue;
                }
                Err(e) => return Err(e),
            };
            let Some(chunks) = self.buffers.get(&path) else {
                continue;
            };
            let mut out = chunks.join("\n");
            out.push('\n');
            file.write_all(out.as_bytes()).map_err(io_error(&path))?;
            counter!(FILE_BUFFER_BYTES_WRITTEN_COUNTER).increment(out.len() as u64);
            self.buffers.remove(&path);
        }
        Ok(self.buffers.len())
    }
}
