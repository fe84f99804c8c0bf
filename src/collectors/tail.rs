use crate::error::CollectorError;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Seek, SeekFrom};
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// A single item produced by [`PollingTail`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawLine {
    /// A complete line, terminator included
    Line(String),
    /// No new complete line arrived during the last poll cycle (non-blocking mode only)
    Idle,
}

/// Whether the tail signals idle poll cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailMode {
    /// Never yields [`RawLine::Idle`]
    Blocking,
    /// Yields one [`RawLine::Idle`] per cycle without new lines
    NonBlocking,
}

/// Position and rotation identity of the file being tailed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailCursor {
    pub path: PathBuf,
    /// Inode of the file handle currently (or last) open
    pub last_inode: Option<u64>,
    /// Byte offset consumed from the current handle
    pub offset: u64,
    /// Complete lines read over the lifetime of the tail
    pub lines_read: u64,
}

/// A polling version of `tail -F`
///
/// Follows appended lines across rotation (inode change), truncation and
/// transient absence of the file. Iterating never terminates: when no data is
/// available the iterator sleeps for the poll interval and tries again.
pub struct PollingTail {
    cursor: TailCursor,
    poll_interval: Duration,
    mode: TailMode,
    reader: Option<BufReader<File>>,
    /// Whether the open handle is a regular file (truncation can be detected)
    regular_file: bool,
    /// Bytes of a line whose terminator has not been written yet
    partial: Vec<u8>,
    pending: VecDeque<RawLine>,
    polled: bool,
}

impl PollingTail {
    /// Create a tail for `path`; nothing is opened until the first poll
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration, mode: TailMode) -> Self {
        Self {
            cursor: TailCursor {
                path: path.into(),
                last_inode: None,
                offset: 0,
                lines_read: 0,
            },
            poll_interval,
            mode,
            reader: None,
            regular_file: true,
            partial: Vec::new(),
            pending: VecDeque::new(),
            polled: false,
        }
    }

    pub fn cursor(&self) -> &TailCursor {
        &self.cursor
    }

    pub fn path(&self) -> &Path {
        &self.cursor.path
    }

    /// Run a single poll cycle and return whatever it produced
    ///
    /// Errors are never surfaced: a missing file or a failing read is logged and
    /// retried on the next cycle.
    pub fn poll(&mut self) -> Vec<RawLine> {
        match self.poll_cycle() {
            Ok(lines) => lines,
            Err(CollectorError::NotFound(path)) => {
                debug!("Waiting for {} to appear", path);
                Vec::new()
            }
            Err(e) => {
                warn!("Error tailing {}: {}", self.cursor.path.display(), e);
                self.reader = None;
                Vec::new()
            }
        }
    }

    fn poll_cycle(&mut self) -> Result<Vec<RawLine>, CollectorError> {
        if self.reader.is_none() {
            self.open()?;
        }

        // Checked before reading so lines appended to the old file are not lost
        let rotated = self.has_rotated();
        let mut lines = self.read_available()?;

        if rotated {
            if !self.partial.is_empty() {
                lines.push(self.take_partial());
            }
            info!(
                "{} was rotated or truncated, reopening",
                self.cursor.path.display()
            );
            self.reader = None;
            self.cursor.offset = 0;
        }

        if lines.is_empty() && self.mode == TailMode::NonBlocking {
            lines.push(RawLine::Idle);
        }

        Ok(lines)
    }

    fn open(&mut self) -> Result<(), CollectorError> {
        // O_NONBLOCK so a FIFO without a writer opens at once instead of hanging
        let opened = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.cursor.path);
        let file = match opened {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CollectorError::NotFound(
                    self.cursor.path.display().to_string(),
                ))
            }
            Err(e) => return Err(CollectorError::IoError(e)),
        };

        let meta = file.metadata()?;
        let inode = meta.ino();
        let mut reader = BufReader::new(file);

        let is_fifo = meta.file_type().is_fifo();
        let offset = match self.cursor.last_inode {
            // First open: skip history unless this is a pipe
            None if is_fifo => 0,
            None => reader.seek(SeekFrom::End(0))?,
            // The same pipe again: there is nothing to seek
            Some(previous) if previous == inode && is_fifo => self.cursor.offset,
            // Same file reopened after an error; an unterminated line read
            // before the error is kept and continued
            Some(previous) if previous == inode && self.cursor.offset <= meta.len() => {
                reader.seek(SeekFrom::Start(self.cursor.offset))?;
                self.cursor.offset
            }
            // A new or truncated file at this path: read it from the beginning
            Some(_) => {
                self.partial.clear();
                0
            }
        };

        debug!(
            "Opened {} (inode {}) at offset {}",
            self.cursor.path.display(),
            inode,
            offset
        );

        self.cursor.last_inode = Some(inode);
        self.cursor.offset = offset;
        self.regular_file = meta.is_file();
        self.reader = Some(reader);
        Ok(())
    }

    fn has_rotated(&self) -> bool {
        match fs::metadata(&self.cursor.path) {
            Ok(meta) => {
                Some(meta.ino()) != self.cursor.last_inode
                    || (self.regular_file && meta.len() < self.cursor.offset)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => true,
            Err(e) => {
                warn!(
                    "Failed to stat {}: {}",
                    self.cursor.path.display(),
                    e
                );
                false
            }
        }
    }

    fn read_available(&mut self) -> Result<Vec<RawLine>, CollectorError> {
        let mut lines = Vec::new();
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Ok(lines),
        };

        loop {
            let before = self.partial.len();
            let n = match reader.read_until(b'\n', &mut self.partial) {
                Ok(n) => n,
                // Empty non-blocking pipe; bytes read so far stay in `partial`
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.cursor.offset += (self.partial.len() - before) as u64;
                    break;
                }
                Err(e) => {
                    self.cursor.offset += (self.partial.len() - before) as u64;
                    return Err(CollectorError::IoError(e));
                }
            };
            if n == 0 {
                break;
            }
            self.cursor.offset += n as u64;

            if self.partial.ends_with(b"\n") {
                let line = String::from_utf8_lossy(&self.partial).into_owned();
                self.partial.clear();
                self.cursor.lines_read += 1;
                lines.push(RawLine::Line(line));
            }
        }

        Ok(lines)
    }

    fn take_partial(&mut self) -> RawLine {
        let line = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        self.cursor.lines_read += 1;
        RawLine::Line(line)
    }
}

impl Iterator for PollingTail {
    type Item = RawLine;

    fn next(&mut self) -> Option<RawLine> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(line);
            }
            if self.polled {
                thread::sleep(self.poll_interval);
            }
            self.polled = true;
            let lines = self.poll();
            self.pending.extend(lines);
        }
    }
}
