//! # RotateFile
//!
//! RotateFile is an append-only file writer that rotates its file once a day.
//! At midnight the active file is renamed to `<path>.YYYY-MM-DD`, named after
//! the day whose content it holds, a fresh file is opened in its place, and the
//! archive that just fell out of the retention window is deleted. Writes,
//! closes and rotations on one writer are serialized by a single lock, so a
//! write never lands in a half-rotated file and no write is dropped.
//!
//! The writer is a plain byte sink implementing [`std::io::Write`], so it can
//! back any logging pipeline, including `tracing_appender::non_blocking`.
//!
//! ## Example
//!
//! ```rust
//! use {rotatefile::RotateFile, std::io::Write};
//!
//! fn main() -> std::io::Result<()> {
//!     # let dir = tempfile::tempdir()?;
//!     # let path = dir.path().join("app.log");
//!     // Keep a week of archives, rotate every midnight.
//!     let mut log = RotateFile::new(&path, 7, true);
//!     writeln!(log, "service started")?;
//!     log.close()?;
//!     Ok(())
//! }
//! ```
use {
    chrono::{DateTime, Days, FixedOffset, Local, NaiveDate, Utc},
    parking_lot::Mutex,
    std::{
        fmt::Debug,
        fs::{self, File, OpenOptions},
        io::{self, Write},
        path::{Path, PathBuf},
        sync::{Arc, Weak},
    },
};

#[cfg(unix)]
use std::{fs::Permissions, os::unix::fs::PermissionsExt};

mod scheduler;

pub use scheduler::{
    shared_scheduler, shared_scheduler_for, DailyJob, DailyScheduler, JobStatus, ManualScheduler, Scheduler,
};

/// Date format of archive suffixes.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Specifies the time zone that decides calendar dates, both for archive names
/// and for when a [`DailyScheduler`] considers a new day to have started.
///
/// # Examples
/// ```
/// use {chrono::FixedOffset, rotatefile::TimeZone};
///
/// // Archives roll over at UTC midnight on every host.
/// let utc = TimeZone::UTC;
///
/// // Archives roll over at the host's midnight, daylight saving included.
/// let local = TimeZone::Local;
///
/// // Archives roll over at midnight UTC-05:00 all year round.
/// let eastern = TimeZone::Fix(FixedOffset::west_opt(5 * 3600).unwrap());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeZone {
    UTC,
    /// The host's zone, re-read on every call.
    Local,
    Fix(FixedOffset),
}

impl TimeZone {
    /// The current instant in this time zone.
    pub fn now(&self) -> DateTime<FixedOffset> {
        match self {
            TimeZone::UTC => Utc::now().fixed_offset(),
            TimeZone::Local => Local::now().fixed_offset(),
            TimeZone::Fix(offset) => Utc::now().with_timezone(offset),
        }
    }
}

/// Errors from the individual steps of a rotation.
///
/// Rotation runs on the scheduler thread where there is no caller to return
/// errors to, so every failure is logged and rotation moves on to its next
/// step. [`RotateFile::rotate`] also hands the failures back to its caller.
/// Errors on the write path are plain [`io::Error`]s, returned unmodified.
#[derive(Debug, thiserror::Error)]
pub enum RotateFileError {
    #[error("Failed to close '{path}': {source}")]
    CloseFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to rename file from '{from}' to '{to}': {source}")]
    RenameFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Archive '{0}' already exists; keeping the active file in place")]
    ArchiveExists(PathBuf),
    #[error("Failed to reopen '{path}': {source}")]
    ReopenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to remove expired archive '{path}': {source}")]
    PruneFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Date out of range: {days} days before {date}")]
    DateOutOfRange { date: NaiveDate, days: u64 },
}

/// Counters of file handles opened and closed by a writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleStats {
    pub opened: u64,
    pub closed: u64,
}

impl HandleStats {
    /// Handles currently open. Always 0 or 1.
    pub fn open_handles(&self) -> u64 {
        self.opened - self.closed
    }
}

/// Static configuration of a writer.
#[derive(Clone)]
struct RotateFileMeta {
    /// The path of the active file. Archives live next to it.
    path: PathBuf,
    /// How many daily archives to keep.
    rotate: u64,
    /// Whether to register with a scheduler for midnight rotation.
    daily: bool,
    /// The time zone used to name archives.
    time_zone: TimeZone,
    /// The file permissions to set on the active file when it is opened
    /// (Unix-like systems only), in octal notation such as 0o640.
    file_mode: Option<u32>,
}

impl RotateFileMeta {
    fn new<P: AsRef<Path>>(path: P) -> Self {
        RotateFileMeta {
            path: path.as_ref().to_path_buf(),
            rotate: 7,
            daily: true,
            time_zone: TimeZone::Local,
            file_mode: None,
        }
    }

    /// Open the active file for appending, creating it if needed. If the open
    /// fails, the parent directories are created and the open is retried once.
    fn open_file(&self) -> io::Result<File> {
        let mut open_options = OpenOptions::new();
        open_options.read(true).append(true).create(true);

        let file = match open_options.open(&self.path) {
            Ok(file) => file,
            Err(err) => match self.path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => {
                    fs::create_dir_all(parent)?;
                    open_options.open(&self.path)?
                }
                _ => return Err(err),
            },
        };

        self.set_permissions()?;
        Ok(file)
    }

    /// Apply `file_mode` to the active file, if one is configured.
    fn set_permissions(&self) -> io::Result<()> {
        if let Some(mode) = self.file_mode {
            #[cfg(unix)]
            fs::set_permissions(&self.path, Permissions::from_mode(mode))?;
            #[cfg(not(unix))]
            {
                let _ = mode;
                tracing::warn!(path = %self.path.display(), "file permissions are not supported on this platform");
            }
        }
        Ok(())
    }

    /// The path of the archive holding the content of `date`.
    fn dated_path(&self, date: NaiveDate) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", date.format(DATE_FORMAT)));
        PathBuf::from(name)
    }

    /// The archive path for the day `days` before `now`'s calendar date.
    fn path_days_before(&self, now: DateTime<FixedOffset>, days: u64) -> Result<PathBuf, RotateFileError> {
        let date = now.date_naive();
        date.checked_sub_days(Days::new(days))
            .map(|day| self.dated_path(day))
            .ok_or(RotateFileError::DateOutOfRange { date, days })
    }
}

/// Mutable state, only ever touched under the writer's lock.
#[derive(Default)]
struct RotateFileState {
    /// The open handle on the active file, if any.
    file: Option<File>,
    /// Set once the rotation job has been handed to the scheduler.
    registered: bool,
    stats: HandleStats,
}

impl RotateFileState {
    /// The open handle, opening one first if the writer is closed.
    fn active_file(&mut self, meta: &RotateFileMeta) -> io::Result<&mut File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                let file = meta.open_file()?;
                self.stats.opened += 1;
                file
            }
        };
        Ok(self.file.insert(file))
    }

    /// Sync and close the open handle. The handle is released even if the
    /// sync fails.
    fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            None => Ok(()),
            Some(file) => {
                self.stats.closed += 1;
                file.sync_all()
            }
        }
    }
}

struct Inner {
    meta: RotateFileMeta,
    state: Mutex<RotateFileState>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl Inner {
    fn write_bytes(self: &Arc<Self>, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if !state.registered {
            state.registered = true;
            if self.meta.daily {
                self.register();
            }
        }
        state.active_file(&self.meta)?.write(buf)
    }

    /// Hand the daily rotation job to the scheduler. Called once, under the
    /// state lock. The job holds a weak reference so a dropped writer is not
    /// kept alive by its scheduler.
    fn register(self: &Arc<Self>) {
        let scheduler: Arc<dyn Scheduler> = match &self.scheduler {
            Some(scheduler) => Arc::clone(scheduler),
            None => shared_scheduler_for(self.meta.time_zone),
        };
        let writer: Weak<Inner> = Arc::downgrade(self);
        scheduler.register_daily(Box::new(move || match writer.upgrade() {
            Some(inner) => {
                inner.rotate(None);
                JobStatus::Keep
            }
            None => JobStatus::Retire,
        }));
        tracing::debug!(path = %self.meta.path.display(), "registered daily rotation");
    }

    /// Run the rotation sequence. `now` defaults to the current time, read
    /// after the lock is taken.
    fn rotate(&self, now: Option<DateTime<FixedOffset>>) -> Vec<RotateFileError> {
        let mut state = self.state.lock();
        let now = now.unwrap_or_else(|| self.meta.time_zone.now());
        let meta = &self.meta;
        let mut errors = Vec::new();

        // 1. Close the active handle.
        if let Err(source) = state.close() {
            errors.push(RotateFileError::CloseFailed {
                path: meta.path.clone(),
                source,
            });
        }

        // 2. Archive the active file under yesterday's date.
        match meta.path_days_before(now, 1) {
            Ok(archive) if archive.exists() => errors.push(RotateFileError::ArchiveExists(archive)),
            Ok(archive) => {
                if let Err(source) = fs::rename(&meta.path, &archive) {
                    errors.push(RotateFileError::RenameFailed {
                        from: meta.path.clone(),
                        to: archive,
                        source,
                    });
                }
            }
            Err(err) => errors.push(err),
        }

        // 3. Reopen so the next write does not pay for the open.
        if let Err(source) = state.active_file(meta) {
            errors.push(RotateFileError::ReopenFailed {
                path: meta.path.clone(),
                source,
            });
        }

        // 4. Drop the archive that just left the retention window.
        match meta.path_days_before(now, meta.rotate.saturating_add(1)) {
            Ok(expired) => match fs::remove_file(&expired) {
                Err(source) if source.kind() != io::ErrorKind::NotFound => {
                    errors.push(RotateFileError::PruneFailed { path: expired, source });
                }
                _ => {}
            },
            Err(err) => errors.push(err),
        }

        for err in &errors {
            tracing::warn!(path = %meta.path.display(), error = %err, "rotation step failed");
        }
        tracing::debug!(path = %meta.path.display(), failures = errors.len(), "rotation complete");
        errors
    }
}

/// An append-only file writer with daily rotation.
///
/// Cloning is cheap; clones share the same file handle and lock. The handle is
/// opened lazily on the first write. If daily rotation is enabled, that first
/// write also registers the writer with its [`Scheduler`].
///
/// # Examples
///
/// ```rust
/// use {
///     rotatefile::{ManualScheduler, RotateFileBuilder},
///     std::{io::Write, sync::Arc},
/// };
///
/// # let dir = tempfile::tempdir().unwrap();
/// let trigger = Arc::new(ManualScheduler::new());
/// let mut log = RotateFileBuilder::new(dir.path().join("app.log"))
///     .rotate(3)
///     .scheduler(trigger.clone())
///     .build();
///
/// writeln!(log, "before rotation").unwrap();
/// trigger.fire(); // rotate now instead of at midnight
/// writeln!(log, "after rotation").unwrap();
/// ```
#[derive(Clone)]
pub struct RotateFile {
    inner: Arc<Inner>,
}

impl RotateFile {
    /// Create a writer for `path`, keeping `rotate` daily archives, with
    /// midnight rotation on the shared scheduler if `daily` is set.
    /// No I/O happens until the first write.
    pub fn new<P: AsRef<Path>>(path: P, rotate: u64, daily: bool) -> Self {
        RotateFileBuilder::new(path).rotate(rotate).daily(daily).build()
    }

    /// The path of the active file.
    pub fn path(&self) -> &Path {
        &self.inner.meta.path
    }

    /// Close the active file. Safe to call repeatedly, and before any write;
    /// the next write reopens the file.
    pub fn close(&self) -> io::Result<()> {
        self.inner.state.lock().close()
    }

    /// Rotate now: close, archive under yesterday's date, reopen, prune.
    ///
    /// Every step runs even if an earlier one fails. The failures are logged
    /// and returned; an empty vector means a clean rotation.
    pub fn rotate(&self) -> Vec<RotateFileError> {
        self.inner.rotate(None)
    }

    /// Rotate as if the current time were `now`.
    pub fn rotate_at(&self, now: DateTime<FixedOffset>) -> Vec<RotateFileError> {
        self.inner.rotate(Some(now))
    }

    /// Handles opened and closed so far.
    pub fn stats(&self) -> HandleStats {
        self.inner.state.lock().stats
    }
}

impl Debug for RotateFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotateFile")
            .field("path", &self.inner.meta.path)
            .field("rotate", &self.inner.meta.rotate)
            .field("daily", &self.inner.meta.daily)
            .finish_non_exhaustive()
    }
}

impl Write for &RotateFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write_bytes(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.state.lock().file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Write for RotateFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self).flush()
    }
}

/// Provides a fluent interface for configuring [`RotateFile`] instances.
///
/// # Default Configuration
///
/// * Daily rotation at midnight on the [`shared_scheduler_for`] the writer's zone
/// * Keep 7 archives
/// * Local system time zone
/// * Standard file permissions
///
/// # Examples
///
/// ```rust
/// use rotatefile::{RotateFileBuilder, TimeZone};
///
/// let log = RotateFileBuilder::new("./logs/app.log")
///     .rotate(30)               // Keep a month of archives
///     .time_zone(TimeZone::UTC) // Name archives by UTC date
///     .file_mode(0o640)         // Owner rw, group r
///     .build();
/// ```
pub struct RotateFileBuilder {
    meta: RotateFileMeta,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl RotateFileBuilder {
    /// Create a builder for a writer appending to `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        RotateFileBuilder {
            meta: RotateFileMeta::new(path),
            scheduler: None,
        }
    }

    /// Set how many daily archives to keep.
    pub fn rotate(self, rotate: u64) -> Self {
        Self {
            meta: RotateFileMeta { rotate, ..self.meta },
            ..self
        }
    }

    /// Enable or disable rotation at midnight.
    pub fn daily(self, daily: bool) -> Self {
        Self {
            meta: RotateFileMeta { daily, ..self.meta },
            ..self
        }
    }

    /// Set the time zone used to date archives.
    pub fn time_zone(self, time_zone: TimeZone) -> Self {
        Self {
            meta: RotateFileMeta { time_zone, ..self.meta },
            ..self
        }
    }

    /// Permission bits (for example `0o640`) applied to the active file every
    /// time it is opened, so a freshly rotated file gets them too. Unix only.
    pub fn file_mode(self, mode: u32) -> Self {
        Self {
            meta: RotateFileMeta {
                file_mode: Some(mode),
                ..self.meta
            },
            ..self
        }
    }

    /// Register with `scheduler` instead of the shared [`DailyScheduler`] for
    /// the writer's time zone.
    pub fn scheduler(self, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            scheduler: Some(scheduler),
            ..self
        }
    }

    /// Build the writer. No file is touched until the first write.
    pub fn build(self) -> RotateFile {
        RotateFile {
            inner: Arc::new(Inner {
                meta: self.meta,
                state: Mutex::new(RotateFileState::default()),
                scheduler: self.scheduler,
            }),
        }
    }
}
