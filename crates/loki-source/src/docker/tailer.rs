// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Follows the logs of a single container.
//!
//! A [`Tailer`] opens the container's log stream in follow mode and spawns
//! three tasks per session:
//!
//! - **Transfer**: splits the multiplexed stream into a stdout and a stderr
//!   pipe, reassembling long lines on the way.
//! - **Two line processors**: one per pipe, turning `<timestamp> <content>`
//!   lines into [`LogEntry`] values.
//!
//! When the stream ends (container stopped, daemon restarted) the session winds
//! down on its own. [`Tailer::run`] inspects the container every
//! `restart_interval` and opens a new session, resuming after the last
//! timestamp it emitted.

use crate::docker::chunk_writer::{BufferPool, ChunkWriter};
use crate::docker::client::{DockerClient, LogStream, LogsOptions};
use crate::docker::frame::demux;
use crate::docker::scanner::{Line, LineScanner};
use crate::docker::{
    DockerError, SourceInfo, DOCKER_LABEL_LOG_STREAM, DOCKER_MAX_CHUNK_SIZE,
};
use crate::entry::{LabelSet, LogEntry, LogsReceiver};
use crate::metrics::Metrics;
use crate::parse::{extract_ts_from_bytes, parse_timestamp};
use crate::positions::{cursor_key, Positions};
use crate::scheduler::Source;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{BufReader, DuplexStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Longest line the processors accept.
pub const MAX_LINE_SIZE: usize = DOCKER_MAX_CHUNK_SIZE * 64;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Rewrites the labels of every entry before reserved labels are dropped.
pub trait Relabel: Send + Sync {
    fn relabel(&self, labels: LabelSet) -> LabelSet;
}

/// Keeps labels as they are.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRelabel;

impl Relabel for NoopRelabel {
    fn relabel(&self, labels: LabelSet) -> LabelSet {
        labels
    }
}

impl<F> Relabel for F
where
    F: Fn(LabelSet) -> LabelSet + Send + Sync,
{
    fn relabel(&self, labels: LabelSet) -> LabelSet {
        self(labels)
    }
}

pub struct TailerOptions {
    pub container_id: String,
    pub labels: LabelSet,
    pub relabel: Arc<dyn Relabel>,
    pub client: Arc<dyn DockerClient>,
    pub positions: Arc<dyn Positions>,
    pub receiver: LogsReceiver,
    pub metrics: Arc<Metrics>,
    pub buffer_pool: BufferPool,
    pub restart_interval: Duration,
    /// Set once the owning component shuts down, in which case cursors are kept.
    pub component_stopping: Arc<AtomicBool>,
}

struct Session {
    generation: u64,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

#[derive(Default)]
struct State {
    running: bool,
    err: Option<String>,
    session: Option<Session>,
    generation: u64,
}

pub struct Tailer {
    container_id: String,
    labels: LabelSet,
    labels_str: String,
    relabel: Arc<dyn Relabel>,
    client: Arc<dyn DockerClient>,
    positions: Arc<dyn Positions>,
    receiver: LogsReceiver,
    metrics: Arc<Metrics>,
    buffer_pool: BufferPool,
    restart_interval: Duration,
    component_stopping: Arc<AtomicBool>,

    state: Mutex<State>,
    // Unix seconds of the last emitted entry, used as `since` on restart.
    since: AtomicI64,
    // Unix seconds of when the last entry was emitted.
    last: AtomicI64,
}

impl fmt::Debug for Tailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tailer")
            .field("container_id", &self.container_id)
            .field("labels", &self.labels_str)
            .finish_non_exhaustive()
    }
}

impl Tailer {
    /// Creates a tailer resuming from the stored cursor of the container.
    pub fn new(options: TailerOptions) -> Result<Self, DockerError> {
        let labels_str = options.labels.to_string();
        let since = options
            .positions
            .get(&cursor_key(&options.container_id), &labels_str)?;

        Ok(Self {
            container_id: options.container_id,
            labels: options.labels,
            labels_str,
            relabel: options.relabel,
            client: options.client,
            positions: options.positions,
            receiver: options.receiver,
            metrics: options.metrics,
            buffer_pool: options.buffer_pool,
            restart_interval: options.restart_interval,
            component_stopping: options.component_stopping,
            state: Mutex::new(State::default()),
            since: AtomicI64::new(since),
            last: AtomicI64::new(0),
        })
    }

    pub fn key(&self) -> String {
        self.container_id.clone()
    }

    /// Tails the container until `cancel` fires, restarting the log stream
    /// whenever the container runs again.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.restart_interval,
            self.restart_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        self.start_if_not_running().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_restart().await,
                () = cancel.cancelled() => break,
            }
        }

        self.stop().await;
        // The target went away rather than the whole component, so its cursor is
        // no longer needed.
        if !self.component_stopping.load(Ordering::Acquire) {
            self.positions
                .remove(&cursor_key(&self.container_id), &self.labels_str);
        }
    }

    async fn check_restart(self: &Arc<Self>) {
        let inspect = match self.client.container_inspect(&self.container_id).await {
            Ok(inspect) => inspect,
            Err(e) => {
                error!(
                    "DOCKER | Error inspecting container {}: {e}",
                    self.container_id
                );
                return;
            }
        };

        let finished = match parse_timestamp(&inspect.finished_at) {
            Ok(finished) => finished,
            Err(e) => {
                error!(
                    "DOCKER | Error parsing finished time of container {}: {e}",
                    self.container_id
                );
                DateTime::<Utc>::UNIX_EPOCH
            }
        };

        if inspect.running || finished.timestamp() >= self.last.load(Ordering::Acquire) {
            self.start_if_not_running().await;
        }
    }

    /// Opens the log stream and starts processing it, unless a session is
    /// already running.
    pub async fn start_if_not_running(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.running {
            return;
        }
        debug!("DOCKER | Starting process loop for container {}", self.container_id);

        let inspect = match self.client.container_inspect(&self.container_id).await {
            Ok(inspect) => inspect,
            Err(e) => {
                error!("DOCKER | Could not inspect container {}: {e}", self.container_id);
                state.err = Some(e.to_string());
                return;
            }
        };

        let options = LogsOptions {
            show_stdout: true,
            show_stderr: true,
            follow: true,
            timestamps: true,
            since: self.since.load(Ordering::Acquire),
        };
        let reader = match self.client.container_logs(&self.container_id, options).await {
            Ok(reader) => reader,
            Err(e) => {
                error!(
                    "DOCKER | Could not fetch logs for container {}: {e}",
                    self.container_id
                );
                state.err = Some(e.to_string());
                return;
            }
        };

        state.generation += 1;
        let session = Session {
            generation: state.generation,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };

        let (stdout_writer, stdout_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_writer, stderr_reader) = tokio::io::duplex(PIPE_CAPACITY);

        session.tracker.spawn(Arc::clone(self).transfer(
            reader,
            inspect.tty,
            stdout_writer,
            stderr_writer,
            session.generation,
            session.cancel.clone(),
            session.tracker.clone(),
        ));
        session.tracker.spawn(Arc::clone(self).process(
            stdout_reader,
            self.stream_labels("stdout"),
            session.cancel.clone(),
        ));
        session.tracker.spawn(Arc::clone(self).process(
            stderr_reader,
            self.stream_labels("stderr"),
            session.cancel.clone(),
        ));
        session.tracker.close();

        state.session = Some(session);
        state.running = true;
        state.err = None;
    }

    /// Stops the current session and waits for its tasks. Safe to call at any time.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if !state.running {
            return;
        }
        state.running = false;
        if let Some(session) = state.session.take() {
            session.cancel.cancel();
            session.tracker.wait().await;
        }
        debug!("DOCKER | Stopped tailing container {}", self.container_id);
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    pub async fn debug_info(&self) -> SourceInfo {
        let state = self.state.lock().await;
        SourceInfo {
            id: self.container_id.clone(),
            last_error: state.err.clone().unwrap_or_default(),
            labels: self.labels_str.clone(),
            is_running: state.running,
            read_offset: self
                .positions
                .get_string(&cursor_key(&self.container_id), &self.labels_str),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn transfer(
        self: Arc<Self>,
        mut reader: LogStream,
        tty: bool,
        stdout: DuplexStream,
        stderr: DuplexStream,
        generation: u64,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        let copy = async {
            if tty {
                let mut stdout = stdout;
                drop(stderr);
                tokio::io::copy(&mut reader, &mut stdout)
                    .await
                    .map_err(DockerError::from)
            } else {
                let mut stdout = ChunkWriter::new(stdout, self.buffer_pool.clone());
                let mut stderr = ChunkWriter::new(stderr, self.buffer_pool.clone());
                demux(&mut reader, &mut stdout, &mut stderr).await
            }
        };

        // Dropping the copy future closes both pipes, which ends the processors.
        let result = tokio::select! {
            result = copy => Some(result),
            () = cancel.cancelled() => None,
        };

        let err = match result {
            None => {
                debug!("DOCKER | Done processing logs of container {}", self.container_id);
                return;
            }
            Some(Ok(written)) => {
                info!(
                    "DOCKER | Finished transferring {written} bytes of logs for container {}",
                    self.container_id
                );
                None
            }
            Some(Err(e)) => {
                warn!(
                    "DOCKER | Could not transfer logs for container {}: {e}",
                    self.container_id
                );
                Some(e.to_string())
            }
        };

        // The stream ended by itself: let the processors drain, then mark the
        // session as finished so the next restart check can open a new one.
        tokio::spawn(async move {
            tracker.wait().await;
            let mut state = self.state.lock().await;
            let current = state.session.as_ref().map(|s| s.generation) == Some(generation);
            if state.running && current {
                state.running = false;
                state.session = None;
                state.err = err;
                debug!("DOCKER | Log stream of container {} ended", self.container_id);
            }
        });
    }

    async fn process(
        self: Arc<Self>,
        reader: DuplexStream,
        labels: LabelSet,
        cancel: CancellationToken,
    ) {
        let key = cursor_key(&self.container_id);
        let mut scanner = LineScanner::new(BufReader::new(reader), MAX_LINE_SIZE);

        loop {
            let line = tokio::select! {
                line = scanner.next_line() => line,
                () = cancel.cancelled() => break,
            };

            let line = match line {
                Ok(Some(Line::Data(line))) => line,
                Ok(Some(Line::TooLong(discarded))) => {
                    warn!(
                        "DOCKER | Skipping line of {discarded} bytes from container {}, longer than {MAX_LINE_SIZE}",
                        self.container_id
                    );
                    self.metrics.inc_docker_errors();
                    continue;
                }
                Ok(None) => break,
                Err(e) => {
                    error!("DOCKER | Error reading docker log line: {e}");
                    self.metrics.inc_docker_errors();
                    break;
                }
            };

            let (timestamp, content) = match extract_ts_from_bytes(line) {
                Ok(parsed) => parsed,
                Err(e) => {
                    error!("DOCKER | Could not extract timestamp, skipping line: {e}");
                    self.metrics.inc_docker_errors();
                    continue;
                }
            };

            let entry = LogEntry::new(
                labels.clone(),
                timestamp,
                String::from_utf8_lossy(content).into_owned(),
            );
            if !self.receiver.send(&cancel, entry).await {
                break;
            }
            self.metrics.inc_docker_entries();

            // The cursor is stored under the unrelabeled labels, which is what
            // `new` looks it up with.
            self.positions.put(&key, &self.labels_str, timestamp.timestamp());
            self.since.store(timestamp.timestamp(), Ordering::Release);
            self.last.store(Utc::now().timestamp(), Ordering::Release);
        }
    }

    fn stream_labels(&self, stream: &str) -> LabelSet {
        let mut labels = self.labels.clone();
        labels.insert(DOCKER_LABEL_LOG_STREAM, stream);
        self.relabel.relabel(labels).without_reserved()
    }
}

impl Source<String> for Tailer {
    fn key(&self) -> String {
        Tailer::key(self)
    }

    fn run(self: Arc<Self>, cancel: CancellationToken) -> BoxFuture<'static, ()> {
        Box::pin(Tailer::run(self, cancel))
    }
}
