//! Tailing of the per-service log files
//!
//! Each service log is read incrementally from a byte offset. Parsed entries
//! land in a bounded ring buffer (for queries) and on a broadcast channel (for
//! live subscribers). Tailing runs only while someone asked for it: every
//! `start_tailing` / `subscribe` holds one reference and the poll task stops
//! when the last one is gone.

use crate::config::LogConfig;
use crate::logline::{parse_line, LogEntry};
use crate::service::ServiceId;
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Decides when a tailed file is re-read
pub trait TailSchedule: Send + Sync {
    /// Endless stream yielding once per read of `path`
    fn ticks(&self, path: &Path) -> BoxStream<'static, ()>;
}

/// Fixed-interval polling
pub struct PollSchedule {
    interval: Duration,
}

impl PollSchedule {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl TailSchedule for PollSchedule {
    fn ticks(&self, _path: &Path) -> BoxStream<'static, ()> {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        futures::stream::unfold(interval, |mut interval| async move {
            interval.tick().await;
            Some(((), interval))
        })
        .boxed()
    }
}

/// Read position inside one file
#[derive(Default)]
struct Cursor {
    offset: u64,
    /// Bytes after the last newline, completed by the next read
    carry: Vec<u8>,
    /// Set after the first read; that one only looks at the file's tail
    primed: bool,
}

#[derive(Default)]
struct TailTask {
    refs: usize,
    handle: Option<JoinHandle<()>>,
}

struct ServiceLog {
    service: ServiceId,
    path: PathBuf,
    capacity: usize,
    initial_read: u64,
    /// Held across the file read so polls of one file never interleave
    cursor: tokio::sync::Mutex<Cursor>,
    buffer: Mutex<VecDeque<LogEntry>>,
    sender: broadcast::Sender<LogEntry>,
    task: Mutex<TailTask>,
}

impl ServiceLog {
    /// Read whatever was appended since the last poll
    async fn poll(&self) -> io::Result<usize> {
        let mut cursor = self.cursor.lock().await;

        let size = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        if size < cursor.offset {
            info!(
                service = %self.service,
                offset = cursor.offset,
                size,
                "Log file truncated, reading from the start"
            );
            cursor.offset = 0;
            cursor.carry.clear();
        }
        if size == cursor.offset {
            return Ok(0);
        }

        // Start one byte early so a line boundary at the cut is still seen
        let mut from = cursor.offset;
        let mut skip_partial = false;
        if !cursor.primed {
            cursor.primed = true;
            if size - cursor.offset > self.initial_read {
                from = size - self.initial_read - 1;
                skip_partial = true;
                debug!(
                    service = %self.service,
                    size,
                    skipped = from,
                    "Reading only the end of an existing log"
                );
            }
        }

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(from)).await?;
        let mut chunk = Vec::with_capacity((size - from) as usize);
        file.take(size - from).read_to_end(&mut chunk).await?;
        cursor.offset = from + chunk.len() as u64;

        let chunk = if skip_partial {
            match chunk.iter().position(|b| *b == b'\n') {
                Some(pos) => &chunk[pos + 1..],
                None => &chunk[chunk.len()..],
            }
        } else {
            &chunk[..]
        };
        cursor.carry.extend_from_slice(chunk);

        let now = Utc::now();
        let mut entries = Vec::new();
        let mut consumed = 0;
        while let Some(pos) = cursor.carry[consumed..].iter().position(|b| *b == b'\n') {
            let line = &cursor.carry[consumed..consumed + pos];
            consumed += pos + 1;
            let line = String::from_utf8_lossy(line);
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_line(self.service, line, now));
        }
        cursor.carry.drain(..consumed);

        let count = entries.len();
        let mut buffer = self.buffer.lock();
        for entry in entries {
            // No receivers is fine
            let _ = self.sender.send(entry.clone());
            if buffer.len() == self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(entry);
        }
        Ok(count)
    }
}

/// Live entries of one service; dropping it releases its tailing reference
pub struct Subscription {
    service: ServiceId,
    receiver: broadcast::Receiver<LogEntry>,
    tailer: Arc<LogTailer>,
}

impl Subscription {
    /// Next live entry; `None` once the tailer is gone
    pub async fn recv(&mut self) -> Option<LogEntry> {
        loop {
            match self.receiver.recv().await {
                Ok(entry) => return Some(entry),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(service = %self.service, skipped, "Log subscriber lagging, entries dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> BoxStream<'static, LogEntry> {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.recv().await.map(|entry| (entry, subscription))
        })
        .boxed()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.tailer.stop_tailing(self.service);
    }
}

pub struct LogTailer {
    logs: HashMap<ServiceId, Arc<ServiceLog>>,
    schedule: Arc<dyn TailSchedule>,
}

impl LogTailer {
    pub fn new(log_dir: impl AsRef<Path>, config: &LogConfig) -> Arc<Self> {
        Self::with_schedule(
            log_dir,
            config,
            Arc::new(PollSchedule::new(config.poll_interval())),
        )
    }

    pub fn with_schedule(
        log_dir: impl AsRef<Path>,
        config: &LogConfig,
        schedule: Arc<dyn TailSchedule>,
    ) -> Arc<Self> {
        let capacity = config.buffer_capacity.max(1);
        let logs = ServiceId::ALL
            .into_iter()
            .map(|service| {
                let (sender, _) = broadcast::channel(capacity);
                let log = ServiceLog {
                    service,
                    path: log_dir.as_ref().join(format!("{}.log", service)),
                    capacity,
                    initial_read: config.initial_read_bytes.max(1),
                    cursor: tokio::sync::Mutex::new(Cursor::default()),
                    buffer: Mutex::new(VecDeque::with_capacity(capacity)),
                    sender,
                    task: Mutex::new(TailTask::default()),
                };
                (service, Arc::new(log))
            })
            .collect();

        Arc::new(Self { logs, schedule })
    }

    fn log(&self, service: ServiceId) -> &Arc<ServiceLog> {
        // Every ServiceId gets an entry at construction
        &self.logs[&service]
    }

    pub fn path(&self, service: ServiceId) -> &Path {
        &self.log(service).path
    }

    /// Take one tailing reference; the first one starts the poll task
    pub fn start_tailing(&self, service: ServiceId) {
        let log = self.log(service);
        let mut task = log.task.lock();
        task.refs += 1;
        if task.handle.is_some() {
            return;
        }

        debug!(service = %service, path = %log.path.display(), "Starting log tail");
        let mut ticks = self.schedule.ticks(&log.path);
        let log = Arc::clone(log);
        task.handle = Some(tokio::spawn(async move {
            while ticks.next().await.is_some() {
                if let Err(e) = log.poll().await {
                    warn!(service = %log.service, error = %e, "Log poll failed");
                }
            }
        }));
    }

    /// Drop one tailing reference; the last one stops the poll task
    pub fn stop_tailing(&self, service: ServiceId) {
        let log = self.log(service);
        let mut task = log.task.lock();
        task.refs = task.refs.saturating_sub(1);
        if task.refs > 0 {
            return;
        }
        if let Some(handle) = task.handle.take() {
            debug!(service = %service, "Stopping log tail");
            handle.abort();
        }
    }

    pub fn is_tailing(&self, service: ServiceId) -> bool {
        self.log(service).task.lock().handle.is_some()
    }

    /// Tailing references currently held for `service`
    pub fn subscriber_count(&self, service: ServiceId) -> usize {
        self.log(service).task.lock().refs
    }

    /// Subscribe to live entries; keeps the service tailed until dropped
    pub fn subscribe(self: &Arc<Self>, service: ServiceId) -> Subscription {
        let receiver = self.log(service).sender.subscribe();
        self.start_tailing(service);
        Subscription {
            service,
            receiver,
            tailer: Arc::clone(self),
        }
    }

    /// Read new data for `service` right now
    pub async fn poll(&self, service: ServiceId) -> io::Result<usize> {
        self.log(service).poll().await
    }

    /// The most recent `limit` entries of `services` (all when empty), oldest first
    pub async fn get_recent_logs(&self, services: &[ServiceId], limit: usize) -> Vec<LogEntry> {
        let services: Vec<ServiceId> = if services.is_empty() {
            ServiceId::ALL.to_vec()
        } else {
            services.to_vec()
        };

        let mut entries = Vec::new();
        for service in services {
            if !self.is_tailing(service) {
                if let Err(e) = self.poll(service).await {
                    warn!(service = %service, error = %e, "Catch-up log read failed");
                }
            }
            entries.extend(self.log(service).buffer.lock().iter().cloned());
        }

        entries.sort_by_key(|e| e.timestamp);
        let skip = entries.len().saturating_sub(limit);
        entries.split_off(skip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logline::LogLevel;
    use std::io::Write;

    fn config(capacity: usize) -> LogConfig {
        LogConfig {
            poll_interval_ms: 20,
            buffer_capacity: capacity,
            ..LogConfig::default()
        }
    }

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let tailer = LogTailer::new(dir.path(), &config(10));
        assert_eq!(tailer.poll(ServiceId::Api).await.unwrap(), 0);
        assert!(tailer.get_recent_logs(&[ServiceId::Api], 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_partial_line_waits_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let tailer = LogTailer::new(dir.path(), &config(10));
        let path = tailer.path(ServiceId::Api).to_path_buf();

        append(&path, "first line\nsecond ha");
        assert_eq!(tailer.poll(ServiceId::Api).await.unwrap(), 1);
        append(&path, "lf\r\n\n");
        assert_eq!(tailer.poll(ServiceId::Api).await.unwrap(), 1);

        let entries = tailer.get_recent_logs(&[ServiceId::Api], 10).await;
        let messages: Vec<&str> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first line", "second half"]);
    }

    #[tokio::test]
    async fn test_ring_buffer_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let tailer = LogTailer::new(dir.path(), &config(3));
        let path = tailer.path(ServiceId::Bridge).to_path_buf();

        for i in 0..5 {
            append(&path, &format!("2024-01-01T00:00:0{}Z line {}\n", i, i));
        }
        let entries = tailer.get_recent_logs(&[ServiceId::Bridge], 10).await;
        let messages: Vec<&str> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
    }

    #[tokio::test]
    async fn test_recent_logs_limit_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let tailer = LogTailer::new(dir.path(), &config(100));

        let api = tailer.path(ServiceId::Api).to_path_buf();
        let bridge = tailer.path(ServiceId::Bridge).to_path_buf();
        for i in 0..30 {
            append(&api, &format!("2024-01-01T00:00:{:02}Z api {}\n", i, i));
            append(&bridge, &format!("2024-01-01T00:01:{:02}Z ERROR bridge {}\n", i, i));
        }

        let entries = tailer.get_recent_logs(&[ServiceId::Api], 10).await;
        assert_eq!(entries.len(), 10);
        assert!(entries.iter().all(|e| e.service == ServiceId::Api));
        assert_eq!(entries.last().unwrap().message, "api 29");
        assert_eq!(entries.first().unwrap().message, "api 20");

        // Merged view is ordered by timestamp; bridge lines are newer
        let merged = tailer.get_recent_logs(&[], 5).await;
        assert!(merged.iter().all(|e| e.service == ServiceId::Bridge));
        assert!(merged.iter().all(|e| e.level == LogLevel::Error));
        assert!(merged.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_first_read_only_covers_end_of_large_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            initial_read_bytes: 100,
            ..config(5)
        };
        let tailer = LogTailer::new(dir.path(), &config);
        let path = tailer.path(ServiceId::Api).to_path_buf();

        let history: String = (0..1000).map(|i| format!("line {}\n", i)).collect();
        append(&path, &history);

        let parsed = tailer.poll(ServiceId::Api).await.unwrap();
        assert!(parsed > 0 && parsed <= 15, "parsed {} lines", parsed);

        let entries = tailer.get_recent_logs(&[ServiceId::Api], 10).await;
        assert_eq!(entries.len(), 5);
        assert!(entries.iter().all(|e| e.message.starts_with("line ")));
        assert_eq!(entries.last().unwrap().message, "line 999");

        // Later reads continue from the end, whole lines only
        append(&path, "line 1000\n");
        assert_eq!(tailer.poll(ServiceId::Api).await.unwrap(), 1);
        let entries = tailer.get_recent_logs(&[ServiceId::Api], 1).await;
        assert_eq!(entries[0].message, "line 1000");
    }

    #[tokio::test]
    async fn test_first_read_keeps_line_starting_at_cut() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            initial_read_bytes: 6,
            ..config(5)
        };
        let tailer = LogTailer::new(dir.path(), &config);
        let path = tailer.path(ServiceId::Api).to_path_buf();

        append(&path, "older\nnewer\n");
        assert_eq!(tailer.poll(ServiceId::Api).await.unwrap(), 1);
        let entries = tailer.get_recent_logs(&[ServiceId::Api], 5).await;
        assert_eq!(entries[0].message, "newer");
    }

    #[tokio::test]
    async fn test_truncation_restarts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let tailer = LogTailer::new(dir.path(), &config(50));
        let path = tailer.path(ServiceId::Sessions).to_path_buf();

        append(&path, "one\ntwo\nthree\n");
        assert_eq!(tailer.poll(ServiceId::Sessions).await.unwrap(), 3);

        std::fs::write(&path, "four\n").unwrap();
        assert_eq!(tailer.poll(ServiceId::Sessions).await.unwrap(), 1);
        assert_eq!(tailer.poll(ServiceId::Sessions).await.unwrap(), 0);

        let entries = tailer.get_recent_logs(&[ServiceId::Sessions], 50).await;
        let messages: Vec<&str> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["one", "two", "three", "four"]);
    }

    #[tokio::test]
    async fn test_tailing_is_reference_counted() {
        let dir = tempfile::tempdir().unwrap();
        let tailer = LogTailer::new(dir.path(), &config(10));

        let first = tailer.subscribe(ServiceId::Api);
        let second = tailer.subscribe(ServiceId::Api);
        assert!(tailer.is_tailing(ServiceId::Api));
        assert_eq!(tailer.subscriber_count(ServiceId::Api), 2);

        drop(first);
        assert!(tailer.is_tailing(ServiceId::Api));
        drop(second);
        assert!(!tailer.is_tailing(ServiceId::Api));
        assert_eq!(tailer.subscriber_count(ServiceId::Api), 0);

        // Extra stops never underflow
        tailer.stop_tailing(ServiceId::Api);
        assert_eq!(tailer.subscriber_count(ServiceId::Api), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_new_lines() {
        let dir = tempfile::tempdir().unwrap();
        let tailer = LogTailer::new(dir.path(), &config(10));
        let path = tailer.path(ServiceId::DevUi).to_path_buf();

        let mut subscription = tailer.subscribe(ServiceId::DevUi);
        append(&path, "WARN compiled with warnings\n");

        let entry = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.service, ServiceId::DevUi);
        assert_eq!(entry.level, LogLevel::Warn);
    }
}
