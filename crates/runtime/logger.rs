//! `log` backend writing one line per record straight to a file descriptor

use bridge_syscall as sys;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicI32, Ordering};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

// Global log file descriptor - stdout until a log file is opened
pub static LOG_FD: AtomicI32 = AtomicI32::new(1);

static LOGGER: FdLogger = FdLogger;

const LINE_CAP: usize = 512;

// Helper to write raw bytes to the log
#[inline(always)]
pub fn log_write(s: &[u8]) {
    let fd = LOG_FD.load(Ordering::Relaxed);
    let _ = sys::write(fd, s);
}

/// Install the logger writing to `fd`. Only the first call takes effect.
pub fn init(fd: i32, level: LevelFilter) -> Result<(), SetLoggerError> {
    LOG_FD.store(fd, Ordering::Relaxed);
    log::set_logger(&LOGGER).map(|()| log::set_max_level(level))
}

/// Open (append) the log file at `path`, which must be NUL-terminated.
pub fn open_log_file(path: &[u8]) -> Result<i32, sys::Errno> {
    sys::open(
        path,
        sys::O_WRONLY | sys::O_CREAT | sys::O_APPEND | sys::O_CLOEXEC,
        0o644,
    )
}

struct FdLogger;

impl Log for FdLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = LineBuf::new();
        let _ = write!(
            line,
            "[{}] {}: {}",
            record.level(),
            record.module_path().unwrap_or("?"),
            record.args()
        );
        line.finish();
        log_write(line.as_bytes());
    }

    fn flush(&self) {}
}

/// Fixed-size line buffer; output past the capacity is cut and marked.
pub struct LineBuf {
    buf: [u8; LINE_CAP],
    len: usize,
    truncated: bool,
}

impl LineBuf {
    pub fn new() -> Self {
        Self {
            buf: [0u8; LINE_CAP],
            len: 0,
            truncated: false,
        }
    }

    /// Terminate the line, replacing the tail with "...\n" if it overflowed.
    pub fn finish(&mut self) {
        if self.truncated || self.len == LINE_CAP {
            self.len = LINE_CAP - 4;
            self.buf[self.len..].copy_from_slice(b"...\n");
            self.len = LINE_CAP;
        } else {
            self.buf[self.len] = b'\n';
            self.len += 1;
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl Default for LineBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_CAP - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        if n < s.len() {
            self.truncated = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_lines_get_a_newline() {
        let mut line = LineBuf::new();
        write!(line, "[{}] {}", "INFO", 42).unwrap();
        line.finish();
        assert_eq!(line.as_bytes(), b"[INFO] 42\n");
    }

    #[test]
    fn long_lines_are_truncated_with_marker() {
        let mut line = LineBuf::new();
        for _ in 0..100 {
            write!(line, "0123456789").unwrap();
        }
        line.finish();
        assert_eq!(line.as_bytes().len(), LINE_CAP);
        assert!(line.as_bytes().ends_with(b"...\n"));
    }
}
