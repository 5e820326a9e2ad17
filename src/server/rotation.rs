//! Backup naming and retention for the rotating log file
//!
//! A rotated file is renamed to `<stem>-<timestamp><ext>` next to the active
//! file, e.g. `openwrt-2024-05-01T10-22-03.517.log`, and optionally gzipped to
//! `openwrt-2024-05-01T10-22-03.517.log.gz`.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Timestamp layout embedded in backup file names
pub const BACKUP_TIME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3f";

const COMPRESS_SUFFIX: &str = ".gz";

/// What happens to backups after a rotation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Keep at most this many backups (0 = unlimited)
    pub max_backups: usize,
    /// Delete backups older than this many days (0 = never)
    pub max_age_days: u32,
    /// Gzip surviving backups
    pub compress: bool,
    /// Backup timestamps are local time rather than UTC
    pub local_time: bool,
}

impl RetentionPolicy {
    fn is_noop(&self) -> bool {
        self.max_backups == 0 && self.max_age_days == 0 && !self.compress
    }
}

/// A rotated file found next to the active log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    /// Location on disk
    pub path: PathBuf,
    /// Rotation time parsed from the name
    pub timestamp: DateTime<Utc>,
    /// Whether the file is gzipped
    pub compressed: bool,
}

/// Counts from one retention pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MillReport {
    /// Backups deleted
    pub removed: usize,
    /// Backups gzipped
    pub compressed: usize,
}

fn name_parts(active: &Path) -> (String, String) {
    let stem = active
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = active
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (format!("{}-", stem), ext)
}

/// Name a backup of `active` rotated at `at`
pub fn backup_path(active: &Path, at: DateTime<Utc>, local_time: bool) -> PathBuf {
    let (prefix, ext) = name_parts(active);
    let stamp = if local_time {
        at.with_timezone(&Local).format(BACKUP_TIME_FORMAT).to_string()
    } else {
        at.format(BACKUP_TIME_FORMAT).to_string()
    };
    active.with_file_name(format!("{}{}{}", prefix, stamp, ext))
}

/// Pick a backup name that does not clash with an existing backup, moving
/// the timestamp forward a millisecond at a time
pub fn unused_backup_path(active: &Path, mut at: DateTime<Utc>, local_time: bool) -> PathBuf {
    loop {
        let candidate = backup_path(active, at, local_time);
        let mut compressed = candidate.clone().into_os_string();
        compressed.push(COMPRESS_SUFFIX);
        if !candidate.exists() && !Path::new(&compressed).exists() {
            return candidate;
        }
        at += chrono::Duration::milliseconds(1);
    }
}

fn parse_stamp(stamp: &str, local_time: bool) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(stamp, BACKUP_TIME_FORMAT).ok()?;
    if local_time {
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|t| t.with_timezone(&Utc))
    } else {
        Some(Utc.from_utc_datetime(&naive))
    }
}

/// List the backups of `active`, newest first
pub fn list_backups(active: &Path, local_time: bool) -> io::Result<Vec<Backup>> {
    let dir = match active.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let (prefix, ext) = name_parts(active);

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut backups = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        let (base, compressed) = match name.strip_suffix(COMPRESS_SUFFIX) {
            Some(base) => (base, true),
            None => (name, false),
        };
        let Some(stamp) = base
            .strip_prefix(prefix.as_str())
            .and_then(|rest| rest.strip_suffix(ext.as_str()))
        else {
            continue;
        };
        if let Some(timestamp) = parse_stamp(stamp, local_time) {
            backups.push(Backup {
                path: entry.path(),
                timestamp,
                compressed,
            });
        }
    }

    backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(backups)
}

/// Apply `policy` to the backups of `active`: trim by count, then by age,
/// then gzip what is left
pub fn mill(active: &Path, policy: &RetentionPolicy, now: DateTime<Utc>) -> io::Result<MillReport> {
    let mut report = MillReport::default();
    if policy.is_noop() {
        return Ok(report);
    }

    let mut keep = list_backups(active, policy.local_time)?;
    let mut remove = Vec::new();

    if policy.max_backups > 0 && policy.max_backups < keep.len() {
        let mut seen = HashSet::new();
        let mut survivors = Vec::new();
        for backup in keep {
            let plain = strip_gz(&backup.path);
            seen.insert(plain);
            if seen.len() > policy.max_backups {
                remove.push(backup);
            } else {
                survivors.push(backup);
            }
        }
        keep = survivors;
    }

    if policy.max_age_days > 0 {
        let cutoff = now - chrono::Duration::days(i64::from(policy.max_age_days));
        let (old, fresh): (Vec<_>, Vec<_>) =
            keep.into_iter().partition(|b| b.timestamp < cutoff);
        remove.extend(old);
        keep = fresh;
    }

    for backup in &remove {
        match fs::remove_file(&backup.path) {
            Ok(()) => report.removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }

    if policy.compress {
        for backup in keep.iter().filter(|b| !b.compressed) {
            let mut target = backup.path.clone().into_os_string();
            target.push(COMPRESS_SUFFIX);
            compress_file(&backup.path, Path::new(&target))?;
            report.compressed += 1;
        }
    }

    debug!(
        active = %active.display(),
        removed = report.removed,
        compressed = report.compressed,
        "backup retention applied"
    );
    Ok(report)
}

fn strip_gz(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    PathBuf::from(text.strip_suffix(COMPRESS_SUFFIX).unwrap_or(&text))
}

/// Gzip `src` into `dst`, then delete `src`
pub fn compress_file(src: &Path, dst: &Path) -> io::Result<()> {
    let mut input = fs::File::open(src)?;
    let output = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dst)?;

    let mut encoder = GzEncoder::new(output, Compression::default());
    let copied = io::copy(&mut input, &mut encoder).and_then(|_| encoder.finish());
    match copied {
        Ok(file) => {
            file.sync_all()?;
            fs::remove_file(src)
        }
        Err(e) => {
            let _ = fs::remove_file(dst);
            Err(e)
        }
    }
}
