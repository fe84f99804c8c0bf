use crate::alerts::Notifier;
use crate::error::CollectorError;
use log::{debug, error, info, warn};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const MIB: f64 = 1024.0 * 1024.0;

/// Free and total space of one filesystem
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskUsage {
    /// Space available to unprivileged users, in MiB
    pub free_mb: f64,
    pub total_mb: f64,
}

impl DiskUsage {
    pub fn percent_free(&self) -> f64 {
        if self.total_mb > 0.0 {
            self.free_mb * 100.0 / self.total_mb
        } else {
            0.0
        }
    }

    /// Render as `path: X of Y (Z%) free`
    pub fn describe(&self, path: &Path) -> String {
        format!(
            "{}: {} of {} ({:.1}%) free",
            path.display(),
            format_size(self.free_mb),
            format_size(self.total_mb),
            self.percent_free()
        )
    }
}

/// Format a size given in MiB, switching to GiB above 1024 MiB
pub fn format_size(mb: f64) -> String {
    if mb > 1024.0 {
        format!("{:.1} GiB", mb / 1024.0)
    } else {
        format!("{:.1} MiB", mb)
    }
}

/// Query the filesystem containing `path`
///
/// # Errors
///
/// Returns `CollectorError::NotFound` if the path does not exist, or
/// `CollectorError::FilesystemQuery` for any other `statvfs` failure.
pub fn disk_space(path: &Path) -> Result<DiskUsage, CollectorError> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        CollectorError::FilesystemQuery(format!("invalid path {}", path.display()))
    })?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return Err(match err.kind() {
            std::io::ErrorKind::NotFound => CollectorError::NotFound(path.display().to_string()),
            _ => CollectorError::FilesystemQuery(format!("{}: {}", path.display(), err)),
        });
    }

    let block_size = stat.f_frsize as f64;
    let usage = DiskUsage {
        free_mb: stat.f_bavail as f64 * block_size / MIB,
        total_mb: stat.f_blocks as f64 * block_size / MIB,
    };
    debug!(
        "{}: free_mb={:.1} total_mb={:.1}",
        path.display(),
        usage.free_mb,
        usage.total_mb
    );
    Ok(usage)
}

/// Multi-level low-space state with hysteresis
///
/// Level 0 is healthy; level `i + 1` is entered once free space drops to
/// `thresholds[i]` or below. Leaving level `s` requires free space above
/// `thresholds[s - 1] + hysteresis`, so values in between never change level.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskState {
    /// Warning thresholds in MiB, strictly descending
    thresholds: Vec<f64>,
    hysteresis_mb: f64,
    level: usize,
}

impl DiskState {
    pub fn new(warn_mb: &[u64], hysteresis_mb: u64) -> Self {
        let mut thresholds = warn_mb.to_vec();
        thresholds.sort_unstable_by(|a, b| b.cmp(a));
        thresholds.dedup();

        Self {
            thresholds: thresholds.into_iter().map(|t| t as f64).collect(),
            hysteresis_mb: hysteresis_mb as f64,
            level: 0,
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn thresholds(&self) -> &[f64] {
        &self.thresholds
    }

    /// Apply a new free-space reading
    ///
    /// Returns the new level if the reading escalated the state.
    pub fn update(&mut self, free_mb: f64) -> Option<usize> {
        let target = self.thresholds.iter().filter(|&&t| free_mb <= t).count();

        if target > self.level {
            debug!("disk state escalates {} -> {}", self.level, target);
            self.level = target;
            return Some(target);
        }

        while self.level > 0 && free_mb > self.thresholds[self.level - 1] + self.hysteresis_mb {
            self.level -= 1;
            debug!("disk state recovers to {}", self.level);
        }
        None
    }
}

/// Escalation notice, emphasised with one row of stars per level
pub fn warning_message(level: usize, path: &Path, usage: &DiskUsage) -> String {
    let emphasis = format!("{}\n", "*".repeat(50)).repeat(level);
    format!(
        "{}DISK SPACE WARNING: {}\n{}",
        emphasis,
        usage.describe(path),
        emphasis
    )
}

type SpaceQuery = dyn Fn(&Path) -> Result<DiskUsage, CollectorError> + Send + Sync;

/// State touched by the polling thread
#[derive(Debug)]
struct MonitorState {
    disk: DiskState,
    /// Set while consecutive polls fail, so a failure streak notifies once
    failing: bool,
}

/// Periodically checks free disk space and notifies when it runs low
pub struct DiskSpaceMonitor {
    path: PathBuf,
    delay: Duration,
    state: Arc<Mutex<MonitorState>>,
    notifier: Arc<dyn Notifier>,
    query: Arc<SpaceQuery>,
    running: Arc<Mutex<bool>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl DiskSpaceMonitor {
    /// Create a monitor for the filesystem containing `path`
    ///
    /// # Arguments
    ///
    /// * `path` - Any path on the filesystem to watch
    /// * `warn_mb` - Warning thresholds in MiB (any order)
    /// * `hysteresis_mb` - Extra free space required before a level is cleared
    /// * `delay` - Time between checks
    /// * `notifier` - Destination for escalation notices
    pub fn new(
        path: impl Into<PathBuf>,
        warn_mb: &[u64],
        hysteresis_mb: u64,
        delay: Duration,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            path: path.into(),
            delay,
            state: Arc::new(Mutex::new(MonitorState {
                disk: DiskState::new(warn_mb, hysteresis_mb),
                failing: false,
            })),
            notifier,
            query: Arc::new(disk_space),
            running: Arc::new(Mutex::new(false)),
            thread_handle: None,
        }
    }

    /// Replace the filesystem query (used by tests)
    pub fn with_space_query<F>(mut self, query: F) -> Self
    where
        F: Fn(&Path) -> Result<DiskUsage, CollectorError> + Send + Sync + 'static,
    {
        self.query = Arc::new(query);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current severity level (0 = healthy)
    pub fn level(&self) -> usize {
        self.lock_state().disk.level()
    }

    /// Run one check: query free space, update the state, notify on escalation
    pub fn check_space(&self) {
        Self::poll_once(&self.path, &self.state, self.notifier.as_ref(), self.query.as_ref());
    }

    /// One-line status, queried live
    pub fn status(&self) -> String {
        match (self.query)(&self.path) {
            Ok(usage) => format!("Disk space: {}", usage.describe(&self.path)),
            Err(e) => format!("Disk space: {}: unavailable ({})", self.path.display(), e),
        }
    }

    /// Start polling on a background thread
    ///
    /// The first check runs immediately; subsequent checks follow every `delay`.
    pub fn start(&mut self) -> Result<(), CollectorError> {
        {
            let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            if *running {
                info!("Disk monitor for {} already running", self.path.display());
                return Ok(());
            }
            *running = true;
        }

        info!(
            "Starting disk monitor for {} every {:?}",
            self.path.display(),
            self.delay
        );

        let path = self.path.clone();
        let delay = self.delay;
        let state = Arc::clone(&self.state);
        let notifier = Arc::clone(&self.notifier);
        let query = Arc::clone(&self.query);
        let running = Arc::clone(&self.running);

        let handle = thread::Builder::new()
            .name(format!("disk:{}", path.display()))
            .spawn(move || {
                while *running.lock().unwrap_or_else(PoisonError::into_inner) {
                    Self::poll_once(&path, &state, notifier.as_ref(), query.as_ref());
                    thread::sleep(delay);
                }
                info!("Disk monitor for {} stopped", path.display());
            })?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    /// Ask the polling thread to stop after its current sleep
    pub fn stop(&mut self) {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = false;
        // Detach: the thread notices the flag after at most one delay
        self.thread_handle.take();
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn poll_once(
        path: &Path,
        state: &Mutex<MonitorState>,
        notifier: &dyn Notifier,
        query: &SpaceQuery,
    ) {
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);

        match query(path) {
            Ok(usage) => {
                if state.failing {
                    info!("Disk space check for {} recovered", path.display());
                    state.failing = false;
                }
                if let Some(level) = state.disk.update(usage.free_mb) {
                    warn!(
                        "Disk space for {} reached warning level {}",
                        path.display(),
                        level
                    );
                    if let Err(e) = notifier.notify(&warning_message(level, path, &usage)) {
                        error!("Failed to deliver disk space warning: {}", e);
                    }
                }
            }
            Err(e) => {
                error!("Disk space check failed for {}: {}", path.display(), e);
                if !state.failing {
                    state.failing = true;
                    let text = format!("Disk space check failed for {}: {}", path.display(), e);
                    if let Err(e) = notifier.notify(&text) {
                        error!("Failed to deliver disk space failure notice: {}", e);
                    }
                }
            }
        }
    }
}
