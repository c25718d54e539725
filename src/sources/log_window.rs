// ============================================================================
// LOG WINDOWS
// ============================================================================
// One background task per followed log file. The task feeds tailed lines
// into a window parser and, on its own flush interval, turns the window
// into one stats entity appended to a bounded buffer shared with the owning
// source. Collection only delivers from that buffer. Parsing and flushing
// share one task, so a window is never read while a line is half applied.
// ============================================================================

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::tailer::{Tailer, DEFAULT_POLL_INTERVAL};
use super::SourceContext;
use crate::error::SourceResult;
use crate::logging::SourceLogger;
use crate::model::{DimOverrides, SimpleMetric, StatsEntity};
use crate::FAN_IN_CAPACITY;

/// Lines buffered between a tailer and its window task.
const LINE_CAPACITY: usize = 1024;

// ----------------------------------------------------------------------------
// 13.1 Window Parser
// ----------------------------------------------------------------------------

/// Accumulates lines for one window.
pub trait WindowParser: Send + 'static {
    fn ingest(&mut self, line: &str);

    /// Metrics for the window so far; resets the window.
    fn flush(&mut self) -> Vec<SimpleMetric>;
}

/// Builds the parser for a file from its path, its per-file setting (the
/// log_format for access logs, empty for error logs) and the nginx type.
pub type ParserFactory =
    Arc<dyn Fn(&str, &str, &str) -> SourceResult<Box<dyn WindowParser>> + Send + Sync>;

// ----------------------------------------------------------------------------
// 13.2 Window Buffer
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Pending {
    next_seq: u64,
    windows: VecDeque<(u64, StatsEntity)>,
}

/// Flushed windows waiting for collection, oldest first.
///
/// Bounded: a flush into a full buffer evicts the oldest window, so a
/// stalled or disabled collector cannot grow it without limit.
pub struct WindowBuffer {
    pending: Mutex<Pending>,
    capacity: usize,
    overflow: SourceLogger,
}

impl WindowBuffer {
    pub fn new(kind: &'static str, capacity: usize) -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            capacity: capacity.max(1),
            overflow: SourceLogger::new(kind),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, entity: StatsEntity) {
        let evicted = {
            let mut pending = self.pending.lock();
            let evicted = pending.windows.len() >= self.capacity && pending.windows.pop_front().is_some();
            let seq = pending.next_seq;
            pending.next_seq += 1;
            pending.windows.push_back((seq, entity));
            evicted
        };
        if evicted {
            self.overflow.log(&format!(
                "Log window buffer full at {} windows, dropping the oldest",
                self.capacity
            ));
        }
    }

    /// Take every buffered window.
    pub fn drain(&self) -> Vec<StatsEntity> {
        let drained: Vec<StatsEntity> = self.pending.lock().windows.drain(..).map(|(_, e)| e).collect();
        self.overflow.reset();
        drained
    }

    /// Queue buffered windows oldest first. A window leaves the buffer only
    /// once it is queued; whatever a cancelled tick could not deliver stays
    /// for the next one.
    pub async fn deliver(&self, ctx: &SourceContext) -> usize {
        let mut sent = 0;
        loop {
            let front = self.pending.lock().windows.front().cloned();
            let Some((seq, entity)) = front else {
                break;
            };
            if !ctx.send(entity).await {
                break;
            }
            {
                let mut pending = self.pending.lock();
                // an overflow may have evicted it meanwhile
                if pending.windows.front().is_some_and(|(queued, _)| *queued == seq) {
                    pending.windows.pop_front();
                }
            }
            sent += 1;
        }
        if sent > 0 {
            self.overflow.reset();
        }
        sent
    }
}

// ----------------------------------------------------------------------------
// 13.3 Watch Set
// ----------------------------------------------------------------------------

struct Watch {
    format: String,
    cancel: CancellationToken,
}

/// The set of files one log source follows.
pub struct LogWatchers {
    kind: &'static str,
    factory: ParserFactory,
    interval: Duration,
    nginx_type: String,
    poll_interval: Duration,
    watches: BTreeMap<String, Watch>,
    buffer: Arc<WindowBuffer>,
}

impl LogWatchers {
    pub fn new(kind: &'static str, factory: ParserFactory, interval: Duration, nginx_type: &str) -> Self {
        Self {
            kind,
            factory,
            interval,
            nginx_type: nginx_type.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            watches: BTreeMap::new(),
            buffer: Arc::new(WindowBuffer::new(kind, FAN_IN_CAPACITY)),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Paths currently followed.
    pub fn watched(&self) -> Vec<String> {
        self.watches.keys().cloned().collect()
    }

    /// Bring the followed set in line with `files` (path to format). A changed
    /// window interval or nginx type restarts every file; otherwise only
    /// added, removed or re-specified files are touched.
    pub fn reconcile(&mut self, files: &BTreeMap<String, String>, interval: Duration, nginx_type: &str) {
        if interval != self.interval || nginx_type != self.nginx_type {
            debug!(
                target: "nginx_telemetry::source::logs",
                kind = self.kind,
                interval = ?interval,
                nginx_type,
                "Window settings changed, restarting log watchers"
            );
            self.stop();
            self.interval = interval;
            self.nginx_type = nginx_type.to_string();
        }

        let stale: Vec<String> = self
            .watches
            .iter()
            .filter(|(path, watch)| files.get(*path) != Some(&watch.format))
            .map(|(path, _)| path.clone())
            .collect();
        for path in stale {
            if let Some(watch) = self.watches.remove(&path) {
                info!(target: "nginx_telemetry::source::logs", kind = self.kind, path = %path, "Removing log tailer");
                watch.cancel.cancel();
            }
        }

        for (path, format) in files {
            if !self.watches.contains_key(path) {
                self.start(path, format);
            }
        }
    }

    fn start(&mut self, path: &str, format: &str) {
        let parser = match (self.factory)(path, format, &self.nginx_type) {
            Ok(parser) => parser,
            Err(e) => {
                warn!(target: "nginx_telemetry::source::logs", kind = self.kind, path, error = %e, "Unable to follow log");
                return;
            }
        };

        info!(target: "nginx_telemetry::source::logs", kind = self.kind, path, "Adding log tailer");
        let cancel = CancellationToken::new();
        let overrides = DimOverrides::default()
            .published_api(path)
            .nginx_type(self.nginx_type.as_str());
        tokio::spawn(run_window(
            Tailer::new(path).with_poll_interval(self.poll_interval),
            parser,
            self.interval,
            overrides,
            Arc::clone(&self.buffer),
            cancel.clone(),
        ));
        self.watches.insert(
            path.to_string(),
            Watch {
                format: format.to_string(),
                cancel,
            },
        );
    }

    /// The buffer flushed windows land in. It outlives watcher restarts.
    pub fn buffer(&self) -> Arc<WindowBuffer> {
        Arc::clone(&self.buffer)
    }

    /// Take every flushed window entity.
    pub fn drain(&self) -> Vec<StatsEntity> {
        self.buffer.drain()
    }

    /// Cancel every window task. Windows not yet flushed are discarded.
    pub fn stop(&mut self) {
        for (path, watch) in std::mem::take(&mut self.watches) {
            debug!(target: "nginx_telemetry::source::logs", kind = self.kind, path = %path, "Stopping log tailer");
            watch.cancel.cancel();
        }
    }
}

impl Drop for LogWatchers {
    fn drop(&mut self) {
        self.stop();
    }
}

// ----------------------------------------------------------------------------
// 13.4 Window Task
// ----------------------------------------------------------------------------

async fn run_window(
    tailer: Tailer,
    mut parser: Box<dyn WindowParser>,
    interval: Duration,
    overrides: DimOverrides,
    buffer: Arc<WindowBuffer>,
    cancel: CancellationToken,
) {
    let (tx, rx) = flume::bounded(LINE_CAPACITY);
    tokio::spawn(tailer.run(tx, cancel.child_token()));

    let mut flush = tokio::time::interval_at(Instant::now() + interval, interval);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = flush.tick() => {
                let metrics = parser.flush();
                if !metrics.is_empty() {
                    buffer.push(StatsEntity::new(Vec::new(), metrics).with_overrides(overrides.clone()));
                }
            }
            line = rx.recv_async() => match line {
                Ok(line) => parser.ingest(&line),
                Err(_) => break,
            },
        }
    }
}
