//! Log sinks for tcplogd

use crate::config::SinkSettings;
use crate::server::rotation::{self, RetentionPolicy};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Append-only destination for records.
///
/// Only the writer calls into a sink, so implementations need no internal
/// locking for `write`. `close` may be called more than once.
pub trait LogSink: Send + 'static {
    /// Append `bytes`, returning how many were written
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;

    /// Flush and release the underlying resource
    fn close(&mut self) -> io::Result<()>;
}

/// In-memory sink whose clones share one buffer
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    buffer: Arc<Mutex<Vec<u8>>>,
    writes: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far
    pub fn contents(&self) -> Vec<u8> {
        self.buffer.lock().clone()
    }

    /// Number of write calls received
    pub fn write_calls(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl LogSink for MemorySink {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.buffer.lock().extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Log file that rotates once it would grow past a size limit.
///
/// The file is opened on the first write. An existing file is appended to if
/// the write fits, otherwise it is rotated away first. After every rotation
/// the backups are trimmed and compressed according to the retention policy.
#[derive(Debug)]
pub struct RotatingFile {
    path: PathBuf,
    max_size: u64,
    policy: RetentionPolicy,
    file: Option<File>,
    size: u64,
    last_rotation: Option<DateTime<Utc>>,
}

impl RotatingFile {
    /// Create a sink from settings; nothing touches the disk yet
    pub fn new(settings: &SinkSettings) -> Self {
        Self {
            path: settings.filename.clone(),
            max_size: settings.max_size_bytes(),
            policy: RetentionPolicy {
                max_backups: settings.max_backups,
                max_age_days: settings.max_age_days,
                compress: settings.compress,
                local_time: settings.local_time,
            },
            file: None,
            size: 0,
            last_rotation: None,
        }
    }

    /// Override the rotation threshold with an exact byte count
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_size = max_bytes.max(1);
        self
    }

    /// Bytes in the active file, as far as this sink knows
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Close the active file, move it to a backup and start a new one
    pub fn rotate(&mut self) -> io::Result<()> {
        self.close_file()?;
        self.open_new()?;
        self.apply_retention();
        Ok(())
    }

    fn open_existing_or_new(&mut self, write_len: u64) -> io::Result<()> {
        self.apply_retention();

        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return self.open_new(),
            Err(e) => return Err(e),
        };

        if meta.len() + write_len >= self.max_size {
            return self.rotate();
        }

        match OpenOptions::new().append(true).open(&self.path) {
            Ok(file) => {
                self.file = Some(file);
                self.size = meta.len();
                Ok(())
            }
            // Unreadable or vanished file: start over rather than fail the write
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot reopen log file, starting a new one");
                self.open_new()
            }
        }
    }

    fn open_new(&mut self) -> io::Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            create_dir_all(dir)?;
        }

        let mut mode = 0o600;
        match fs::metadata(&self.path) {
            Ok(meta) => {
                mode = file_mode(&meta).unwrap_or(mode);
                let at = self.next_rotation_time();
                let backup = rotation::unused_backup_path(&self.path, at, self.policy.local_time);
                fs::rename(&self.path, &backup)?;
                info!(path = %self.path.display(), backup = %backup.display(), "log file rotated");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let file = create_file(&self.path, mode)?;
        self.file = Some(file);
        self.size = 0;
        Ok(())
    }

    /// Backup timestamps must keep increasing even when retention frees an
    /// older name within the same millisecond
    fn next_rotation_time(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let at = match self.last_rotation {
            Some(last) if now <= last => last + chrono::Duration::milliseconds(1),
            _ => now,
        };
        self.last_rotation = Some(at);
        at
    }

    fn apply_retention(&self) {
        if let Err(e) = rotation::mill(&self.path, &self.policy, Utc::now()) {
            warn!(path = %self.path.display(), error = %e, "backup retention failed");
        }
    }

    fn close_file(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(mut file) => {
                file.flush()?;
                file.sync_data()
            }
            None => Ok(()),
        }
    }
}

impl LogSink for RotatingFile {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let len = bytes.len() as u64;
        if len > self.max_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "write length {} exceeds maximum file size {}",
                    len, self.max_size
                ),
            ));
        }

        if self.file.is_none() {
            self.open_existing_or_new(len)?;
        }
        if self.size + len > self.max_size {
            self.rotate()?;
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "log file is not open"))?;
        file.write_all(bytes)?;
        self.size += len;
        Ok(bytes.len())
    }

    fn close(&mut self) -> io::Result<()> {
        self.close_file()
    }
}

#[cfg(unix)]
fn create_dir_all(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o755).create(dir)
}

#[cfg(not(unix))]
fn create_dir_all(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
fn create_file(path: &Path, mode: u32) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
}

#[cfg(not(unix))]
fn create_file(path: &Path, _mode: u32) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}
