//! Dual-channel logging: an immediate console/file sink plus per-task
//! delayed buffers.
//!
//! Every invocation owns one timestamped log file. INFO and higher go to
//! the file and are echoed to the console (via `tracing`) as they happen.
//! DEBUG detail from concurrent tasks is buffered per task and flushed to
//! the file as one contiguous block, so a task's output never interleaves
//! with another task's within its own block.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Local;

/// The shared, immediate log sink for one invocation.
pub struct Logbook {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
    warned: AtomicBool,
}

impl Logbook {
    /// Creates `log.<invocation>` in `dir`, truncating any previous file.
    pub fn create(dir: &Path, invocation: &str) -> std::io::Result<Arc<Logbook>> {
        let path = dir.join(format!("log.{invocation}"));
        let file = BufWriter::new(File::create(&path)?);
        Ok(Arc::new(Logbook {
            path,
            file: Mutex::new(file),
            warned: AtomicBool::new(false),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once any warning has been logged; surfaced in the final verdict.
    pub fn warned(&self) -> bool {
        self.warned.load(Ordering::Relaxed)
    }

    fn write_line(&self, out: &mut BufWriter<File>, level: &str, pre: &str, msg: &str) {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let _ = writeln!(out, "{stamp} [{level}] {pre}: {msg}");
    }

    pub fn info(&self, pre: &str, msg: &str) {
        tracing::info!("{pre}: {msg}");
        if let Ok(mut out) = self.file.lock() {
            self.write_line(&mut out, "INFO", pre, msg);
            let _ = out.flush();
        }
    }

    pub fn warn(&self, pre: &str, msg: &str) {
        self.warned.store(true, Ordering::Relaxed);
        tracing::warn!("{pre}: WARNING! {msg}");
        if let Ok(mut out) = self.file.lock() {
            self.write_line(&mut out, "WARN", pre, msg);
            let _ = out.flush();
        }
    }

    pub fn error(&self, pre: &str, msg: &str) {
        tracing::error!("{pre}: ERROR: {msg}");
        if let Ok(mut out) = self.file.lock() {
            self.write_line(&mut out, "ERROR", pre, msg);
            let _ = out.flush();
        }
    }

    /// Writes a task's buffered DEBUG lines as one contiguous block.
    fn flush_block(&self, pre: &str, lines: &[String]) {
        if lines.is_empty() {
            return;
        }
        if let Ok(mut out) = self.file.lock() {
            for line in lines {
                self.write_line(&mut out, "DEBUG", pre, line);
            }
            let _ = out.flush();
        }
    }
}

/// A per-task delayed buffer over a shared [`Logbook`].
///
/// `debug` lines accumulate until [`flush`](TaskLog::flush); `info`,
/// `warn` and `error` pass straight through to the immediate sink.
pub struct TaskLog {
    book: Arc<Logbook>,
    pre: String,
    buf: Vec<String>,
}

impl TaskLog {
    pub fn new(book: Arc<Logbook>, pre: impl Into<String>) -> Self {
        Self {
            book,
            pre: pre.into(),
            buf: Vec::new(),
        }
    }

    pub fn book(&self) -> &Arc<Logbook> {
        &self.book
    }

    pub fn debug(&mut self, msg: impl Into<String>) {
        self.buf.push(msg.into());
    }

    pub fn info(&self, msg: &str) {
        self.book.info(&self.pre, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.book.warn(&self.pre, msg);
    }

    pub fn error(&self, msg: &str) {
        self.book.error(&self.pre, msg);
    }

    pub fn flush(&mut self) {
        self.book.flush_block(&self.pre, &self.buf);
        self.buf.clear();
    }
}

impl Drop for TaskLog {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn buffered_blocks_stay_contiguous() {
        let dir = TempDir::new().unwrap();
        let book = Logbook::create(dir.path(), "t1").unwrap();

        let mut a = TaskLog::new(book.clone(), "Run a");
        let mut b = TaskLog::new(book.clone(), "Run b");
        a.debug("a1");
        b.debug("b1");
        a.debug("a2");
        b.debug("b2");
        a.flush();
        b.flush();

        let text = std::fs::read_to_string(book.path()).unwrap();
        let tasks: Vec<&str> = text
            .lines()
            .map(|l| if l.contains("Run a") { "a" } else { "b" })
            .collect();
        assert_eq!(tasks, vec!["a", "a", "b", "b"]);
    }

    #[test]
    fn warn_sets_sticky_flag() {
        let dir = TempDir::new().unwrap();
        let book = Logbook::create(dir.path(), "t2").unwrap();
        assert!(!book.warned());
        book.warn("ts", "something odd");
        assert!(book.warned());
        let text = std::fs::read_to_string(book.path()).unwrap();
        assert!(text.contains("[WARN] ts: something odd"));
    }

    #[test]
    fn flush_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let book = Logbook::create(dir.path(), "t3").unwrap();
        let mut log = TaskLog::new(book.clone(), "x");
        log.debug("once");
        log.flush();
        log.flush();
        drop(log);
        let text = std::fs::read_to_string(book.path()).unwrap();
        assert_eq!(text.matches("once").count(), 1);
    }
}
