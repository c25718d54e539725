// ============================================================================
// FILE TAILER
// ============================================================================
// Follows a log file by polling: new complete lines are pushed into a
// channel as they appear. A file present at start is followed from its end;
// a file that appears later, or replaces the one being followed after a
// rotation, is read from the beginning. Truncation rewinds to offset zero.
// ============================================================================

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[cfg(unix)]
fn inode(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode(_meta: &std::fs::Metadata) -> u64 {
    0
}

struct OpenFile {
    file: File,
    inode: u64,
    offset: u64,
}

#[derive(Default)]
struct Cursor {
    open: Option<OpenFile>,
    /// Bytes after the last newline seen
    partial: Vec<u8>,
    started: bool,
}

/// Polling line follower for one file.
#[derive(Debug, Clone)]
pub struct Tailer {
    path: PathBuf,
    poll_interval: Duration,
}

impl Tailer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Follow the file until `cancel` fires or the receiver goes away.
    pub async fn run(self, lines: flume::Sender<String>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cursor = Cursor::default();

        debug!(target: "nginx_telemetry::tailer", path = %self.path.display(), "Tailer started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let batch = match self.poll(&mut cursor).await {
                Ok(batch) => batch,
                Err(e) => {
                    trace!(target: "nginx_telemetry::tailer", path = %self.path.display(), error = %e, "Tail poll failed");
                    continue;
                }
            };

            for line in batch {
                let delivered = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    sent = lines.send_async(line) => sent.is_ok(),
                };
                if !delivered {
                    debug!(target: "nginx_telemetry::tailer", path = %self.path.display(), "Tailer stopped");
                    return;
                }
            }
        }
        debug!(target: "nginx_telemetry::tailer", path = %self.path.display(), "Tailer stopped");
    }

    async fn open(&self, from_end: bool) -> io::Result<OpenFile> {
        let mut file = File::open(&self.path).await?;
        let meta = file.metadata().await?;
        let offset = if from_end { meta.len() } else { 0 };
        file.seek(io::SeekFrom::Start(offset)).await?;
        Ok(OpenFile {
            file,
            inode: inode(&meta),
            offset,
        })
    }

    /// One poll: (re)open as needed, read what was appended and split it
    /// into lines.
    async fn poll(&self, cursor: &mut Cursor) -> io::Result<Vec<String>> {
        let mut out = Vec::new();

        if cursor.open.is_none() {
            let from_end = !cursor.started;
            cursor.started = true;
            match self.open(from_end).await {
                Ok(open) => cursor.open = Some(open),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
                Err(e) => return Err(e),
            }
        }

        let replaced = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => cursor.open.as_ref().map_or(false, |o| o.inode != inode(&meta)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => return Err(e),
        };

        if let Some(open) = cursor.open.as_mut() {
            let len = open.file.metadata().await?.len();
            if len < open.offset {
                debug!(target: "nginx_telemetry::tailer", path = %self.path.display(), "File truncated");
                open.file.seek(io::SeekFrom::Start(0)).await?;
                open.offset = 0;
                cursor.partial.clear();
            }

            let mut buf = Vec::new();
            let read = open.file.read_to_end(&mut buf).await?;
            open.offset += read as u64;
            split_lines(&mut cursor.partial, &buf, &mut out);

            // a line without its newline is given up on after one quiet poll
            if read == 0 && !cursor.partial.is_empty() {
                out.push(String::from_utf8_lossy(&cursor.partial).into_owned());
                cursor.partial.clear();
            }
        }

        if replaced {
            debug!(target: "nginx_telemetry::tailer", path = %self.path.display(), "File rotated");
            if !cursor.partial.is_empty() {
                out.push(String::from_utf8_lossy(&cursor.partial).into_owned());
                cursor.partial.clear();
            }
            cursor.open = None;
        }

        Ok(out)
    }
}

fn split_lines(partial: &mut Vec<u8>, chunk: &[u8], out: &mut Vec<String>) {
    partial.extend_from_slice(chunk);
    while let Some(pos) = partial.iter().position(|b| *b == b'\n') {
        let mut line: Vec<u8> = partial.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        out.push(String::from_utf8_lossy(&line).into_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const POLL: Duration = Duration::from_millis(10);

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    async fn next(rx: &flume::Receiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), rx.recv_async())
            .await
            .expect("timed out waiting for line")
            .unwrap()
    }

    fn start(path: &Path) -> (flume::Receiver<String>, CancellationToken) {
        let (tx, rx) = flume::unbounded();
        let cancel = CancellationToken::new();
        tokio::spawn(Tailer::new(path).with_poll_interval(POLL).run(tx, cancel.clone()));
        (rx, cancel)
    }

    #[test]
    fn test_split_lines_keeps_partial() {
        let mut partial = Vec::new();
        let mut out = Vec::new();
        split_lines(&mut partial, b"one\r\ntwo\nthr", &mut out);
        assert_eq!(out, vec!["one", "two"]);
        split_lines(&mut partial, b"ee\n", &mut out);
        assert_eq!(out, vec!["one", "two", "three"]);
        assert!(partial.is_empty());
    }

    #[tokio::test]
    async fn test_existing_content_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("access.log");
        append(&path, "old line\n");

        let (rx, cancel) = start(&path);
        tokio::time::sleep(POLL * 5).await;
        append(&path, "new line\n");

        assert_eq!(next(&rx).await, "new line");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_file_created_later_is_read_from_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("error.log");

        let (rx, cancel) = start(&path);
        tokio::time::sleep(POLL * 5).await;
        append(&path, "first\nsecond\n");

        assert_eq!(next(&rx).await, "first");
        assert_eq!(next(&rx).await, "second");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_partial_line_flushed_when_quiet() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("error.log");
        append(&path, "");

        let (rx, cancel) = start(&path);
        tokio::time::sleep(POLL * 5).await;
        append(&path, "2015/07/15 05:56:30 [info] 28386#28386: *94160 client closed keepalive connection");

        assert_eq!(
            next(&rx).await,
            "2015/07/15 05:56:30 [info] 28386#28386: *94160 client closed keepalive connection"
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_truncation_rewinds() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("access.log");
        append(&path, "");

        let (rx, cancel) = start(&path);
        tokio::time::sleep(POLL * 5).await;
        append(&path, "a fairly long line before truncation\n");
        assert_eq!(next(&rx).await, "a fairly long line before truncation");

        std::fs::write(&path, "short\n").unwrap();
        assert_eq!(next(&rx).await, "short");
        cancel.cancel();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rotation_follows_new_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("access.log");
        append(&path, "");

        let (rx, cancel) = start(&path);
        tokio::time::sleep(POLL * 5).await;
        append(&path, "before rotation\n");
        assert_eq!(next(&rx).await, "before rotation");

        std::fs::rename(&path, dir.path().join("access.log.1")).unwrap();
        append(&path, "after rotation\n");
        assert_eq!(next(&rx).await, "after rotation");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("access.log");
        let (tx, rx) = flume::unbounded::<String>();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Tailer::new(&path).with_poll_interval(POLL).run(tx, cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(rx.recv_async().await.is_err());
    }
}
