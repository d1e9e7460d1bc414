//! Append-only, newline-delimited intercept log.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;

use crate::record::{LogRecord, RecordError};

/// Errors produced by the log sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The log file could not be opened or created.
    #[error("opening intercept log {}: {source}", .path.display())]
    Open {
        /// Path that was being opened
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
    /// The record could not be encoded; nothing was written.
    #[error(transparent)]
    Record(#[from] RecordError),
    /// Appending to or flushing the log failed.
    #[error("writing intercept log: {0}")]
    Write(#[source] io::Error),
    /// The sink was already closed.
    #[error("intercept log is closed")]
    Closed,
}

/// A durable, append-only writer of [`LogRecord`]s.
///
/// Every record is encoded outside the lock and then appended, with its
/// line separator, inside a single critical section. Records from
/// concurrent writers therefore never interleave, and their order in the
/// file is the order in which writers acquired the lock.
///
/// The file is opened in append mode and never truncated, so entries from
/// earlier runs survive a restart.
///
/// ## Example
///
/// ```rust,no_run
/// use snaptap::{LogRecord, LogSink};
///
/// let sink = LogSink::open("/tmp/snapshotter-intercepts.json")?;
/// sink.write(&LogRecord::request("/svc/Stat", &serde_json::json!({"key": "abc"})))?;
/// sink.close()?;
/// # Ok::<(), snaptap::SinkError>(())
/// ```
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl LogSink {
    /// Open the log at `path`, creating it if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();

        let mut options = OpenOptions::new();
        options.read(true).append(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o644);
        }

        let file = options.open(&path).map_err(|source| SinkError::Open {
            path: path.clone(),
            source,
        })?;

        tracing::debug!(path = %path.display(), "opened intercept log");

        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    /// Path of the underlying log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether [`close`](Self::close) has already run.
    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    /// Encode `record` and append it as one line.
    ///
    /// If the append fails part way, the file is cut back to its previous
    /// length so a torn line is never left behind.
    pub fn write<M: Serialize + ?Sized>(&self, record: &LogRecord<'_, M>) -> Result<(), SinkError> {
        let mut line = record.encode()?;
        line.push(b'\n');

        let mut guard = self.lock();
        let file = guard.as_mut().ok_or(SinkError::Closed)?;

        append_line(file, &line, &self.path)
    }

    /// Flush the log to disk and release the file.
    ///
    /// Closing twice is a no-op. Writes after close fail with
    /// [`SinkError::Closed`].
    pub fn close(&self) -> Result<(), SinkError> {
        let Some(mut file) = self.lock().take() else {
            return Ok(());
        };
        file.flush().map_err(SinkError::Write)?;
        file.sync_all().map_err(SinkError::Write)?;
        tracing::debug!(path = %self.path.display(), "closed intercept log");
        Ok(())
    }

    // Writers never panic while holding the lock, but a poisoned lock still
    // guards a usable file handle.
    fn lock(&self) -> MutexGuard<'_, Option<File>> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A log handle that can be cut back after a failed append.
trait LogFile: Write {
    fn current_len(&mut self) -> io::Result<u64>;
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn current_len(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

fn append_line<F: LogFile>(file: &mut F, line: &[u8], path: &Path) -> Result<(), SinkError> {
    let len_before = file.current_len().map_err(SinkError::Write)?;
    if let Err(e) = file.write_all(line).and_then(|()| file.flush()) {
        if let Err(rollback) = file.truncate_to(len_before) {
            tracing::error!(
                path = %path.display(),
                error = %rollback,
                "failed to roll back partial intercept log entry"
            );
        }
        return Err(SinkError::Write(e));
    }
    Ok(())
}

impl Drop for LogSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to close intercept log");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::collections::HashMap;
    use std::sync::Arc;

    use serde_json::{Value, json};

    use super::*;
    use crate::record::RecordKind;

    fn read_lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intercepts.json");

        let sink = LogSink::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(sink.path(), path.as_path());
        assert!(!sink.is_closed());
    }

    #[test]
    fn missing_parent_directory_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("intercepts.json");

        let err = LogSink::open(&path).unwrap_err();
        assert!(matches!(err, SinkError::Open { .. }), "got {err:?}");
    }

    #[test]
    fn records_are_written_one_per_line_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intercepts.json");
        let sink = LogSink::open(&path).unwrap();

        sink.write(&LogRecord::request("Stat", &json!({"key": "abc"})))
            .unwrap();
        sink.write(&LogRecord::response("Stat", &json!({"size": 42})))
            .unwrap();
        sink.close().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            concat!(
                r#"{"method":"Stat","type":"request","message":{"key":"abc"}}"#,
                "\n",
                r#"{"method":"Stat","type":"response","message":{"size":42}}"#,
                "\n",
            )
        );
    }

    #[test]
    fn reopening_appends_after_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intercepts.json");

        {
            let sink = LogSink::open(&path).unwrap();
            sink.write(&LogRecord::request("First", &json!({}))).unwrap();
            sink.close().unwrap();
        }
        {
            let sink = LogSink::open(&path).unwrap();
            sink.write(&LogRecord::request("Second", &json!({})))
                .unwrap();
        }

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["method"], "First");
        assert_eq!(lines[1]["method"], "Second");
    }

    #[test]
    fn mismatched_message_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intercepts.json");
        let sink = LogSink::open(&path).unwrap();

        let mut bad: HashMap<(u8, u8), u8> = HashMap::new();
        bad.insert((1, 2), 3);

        let err = sink.write(&LogRecord::request("Bad", &bad)).unwrap_err();
        assert!(matches!(
            err,
            SinkError::Record(RecordError::TypeMismatch { .. })
        ));

        sink.write(&LogRecord::request("Good", &json!({}))).unwrap();
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["method"], "Good");
    }

    #[test]
    fn write_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::open(dir.path().join("intercepts.json")).unwrap();

        sink.close().unwrap();
        sink.close().unwrap();
        assert!(sink.is_closed());

        let err = sink
            .write(&LogRecord::request("Late", &json!({})))
            .unwrap_err();
        assert!(matches!(err, SinkError::Closed));
    }

    #[test]
    fn concurrent_writers_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intercepts.json");
        let sink = Arc::new(LogSink::open(&path).unwrap());

        let threads = 8;
        let per_thread = 50;
        std::thread::scope(|scope| {
            for t in 0..threads {
                let sink = Arc::clone(&sink);
                scope.spawn(move || {
                    let method = format!("Method{t}");
                    let padding = "x".repeat(4096);
                    for i in 0..per_thread {
                        let msg = json!({"seq": i, "padding": padding});
                        sink.write(&LogRecord::request(&method, &msg)).unwrap();
                        sink.write(&LogRecord::response(&method, &msg)).unwrap();
                    }
                });
            }
        });

        let lines = read_lines(&path);
        assert_eq!(lines.len(), threads * per_thread * 2);

        // Within one writer, each request is directly followed (in that
        // writer's subsequence) by its response.
        for t in 0..threads {
            let method = format!("Method{t}");
            let own: Vec<&Value> = lines.iter().filter(|l| l["method"] == method).collect();
            for (i, pair) in own.chunks(2).enumerate() {
                assert_eq!(pair[0]["type"], RecordKind::Request.as_str());
                assert_eq!(pair[1]["type"], RecordKind::Response.as_str());
                assert_eq!(pair[0]["message"]["seq"], i);
                assert_eq!(pair[1]["message"]["seq"], i);
            }
        }
    }

    /// Accepts `budget` bytes, then fails every write.
    struct ShortLog {
        data: Vec<u8>,
        budget: usize,
    }

    impl Write for ShortLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::other("no space left on device"));
            }
            let n = buf.len().min(self.budget);
            self.data.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogFile for ShortLog {
        fn current_len(&mut self) -> io::Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn truncate_to(&mut self, len: u64) -> io::Result<()> {
            self.data.truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn failed_append_is_rolled_back() {
        let mut log = ShortLog {
            data: b"{\"method\":\"First\"}\n".to_vec(),
            budget: 10,
        };
        let before = log.data.clone();

        let line = LogRecord::request("Second", &json!({"key": "abc"}))
            .encode()
            .unwrap();
        let err = append_line(&mut log, &line, Path::new("intercepts.json")).unwrap_err();
        assert!(matches!(err, SinkError::Write(_)), "got {err:?}");
        assert_eq!(log.data, before);

        log.budget = usize::MAX;
        append_line(&mut log, b"{}\n", Path::new("intercepts.json")).unwrap();
        assert_eq!(log.data.len(), before.len() + 3);
        assert!(log.data.ends_with(b"\n{}\n"));
    }
}
