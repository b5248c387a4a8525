// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pulls one zone's logs window after window.
//!
//! Every cycle covers `pull_range` of time starting at the stored cursor. The
//! window is split into `workers` equal sub-windows, each pulled with its own
//! retry budget. The cursor moves past every sub-window once it is delivered,
//! so a failed cycle resumes at the first undelivered sub-window.

use crate::backoff::{Backoff, BackoffConfig, BackoffError};
use crate::cloudflare::client::LogpullClient;
use crate::cloudflare::CloudflareError;
use crate::entry::{LabelSet, LogEntry, LogsReceiver};
use crate::metrics::Metrics;
use crate::positions::{cursor_key, Positions};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Error text Cloudflare returns for windows past its retention.
const TOO_OLD_MESSAGE: &str = "logs older than";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailerConfig {
    pub zone_id: String,
    pub labels: LabelSet,
    pub pull_range: Duration,
    pub workers: usize,
    pub backoff: BackoffConfig,
}

/// A `[start, end)` interval handed to a single Logpull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullRequest {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Splits `[start, end)` into `workers` contiguous windows of equal length. The
/// last window absorbs the remainder and ends exactly at `end`.
pub fn split_requests(start: DateTime<Utc>, end: DateTime<Utc>, workers: usize) -> Vec<PullRequest> {
    let workers = workers.max(1);
    let total = (end - start).num_nanoseconds().unwrap_or(0).max(0);
    #[allow(clippy::cast_possible_wrap)]
    let per_worker = total / workers as i64;

    (0..workers)
        .map(|i| {
            #[allow(clippy::cast_possible_wrap)]
            let i = i as i64;
            let window_start = start + chrono::Duration::nanoseconds(i * per_worker);
            let window_end = if i == workers as i64 - 1 {
                end
            } else {
                start + chrono::Duration::nanoseconds((i + 1) * per_worker)
            };
            PullRequest {
                start: window_start,
                end: window_end,
            }
        })
        .collect()
}

pub struct TailerOptions {
    pub config: TailerConfig,
    pub client: Arc<dyn LogpullClient>,
    pub positions: Arc<dyn Positions>,
    pub receiver: LogsReceiver,
    pub metrics: Arc<Metrics>,
}

#[derive(Debug, Default)]
struct Status {
    ready: bool,
    err: Option<String>,
}

pub struct PullTailer {
    config: TailerConfig,
    client: Arc<dyn LogpullClient>,
    positions: Arc<dyn Positions>,
    receiver: LogsReceiver,
    metrics: Arc<Metrics>,
    labels_str: String,
    // End of the last delivered sub-window, Unix nanoseconds; 0 when nothing was pulled yet.
    cursor: AtomicI64,
    status: Mutex<Status>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for PullTailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PullTailer")
            .field("zone_id", &self.config.zone_id)
            .field("labels", &self.labels_str)
            .finish_non_exhaustive()
    }
}

impl PullTailer {
    /// Creates a tailer resuming from the stored cursor of the zone, without
    /// starting it.
    pub fn new(options: TailerOptions) -> Result<Arc<Self>, CloudflareError> {
        let labels_str = options.config.labels.to_string();
        let cursor = options
            .positions
            .get(&cursor_key(&options.config.zone_id), &labels_str)?;

        Ok(Arc::new(Self {
            config: options.config,
            client: options.client,
            positions: options.positions,
            receiver: options.receiver,
            metrics: options.metrics,
            labels_str,
            cursor: AtomicI64::new(cursor),
            status: Mutex::new(Status {
                ready: true,
                err: None,
            }),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }))
    }

    /// Creates the tailer and starts pulling in the background.
    pub fn start(options: TailerOptions) -> Result<Arc<Self>, CloudflareError> {
        let tailer = Self::new(options)?;
        let handle = tokio::spawn(Arc::clone(&tailer).run());
        #[allow(clippy::expect_used)]
        let mut slot = tailer.handle.lock().expect("lock poisoned");
        *slot = Some(handle);
        drop(slot);
        Ok(tailer)
    }

    async fn run(self: Arc<Self>) {
        let pull_range = chrono::Duration::from_std(self.config.pull_range)
            .unwrap_or_else(|_| chrono::Duration::minutes(1));

        loop {
            let cursor = self.cursor.load(Ordering::Acquire);
            let end = if cursor > 0 {
                DateTime::<Utc>::from_timestamp_nanos(cursor) + pull_range
            } else {
                Utc::now()
            };
            let start = end - pull_range;

            // Windows are only pulled once they are complete.
            match (end - Utc::now()).to_std() {
                Ok(wait) => {
                    tokio::select! {
                        () = tokio::time::sleep(wait) => {}
                        () = self.cancel.cancelled() => return,
                    }
                }
                // Catching up on past windows; let other tasks run in between.
                Err(_) => tokio::task::yield_now().await,
            }
            if self.cancel.is_cancelled() {
                return;
            }

            match self.pull_window(start, end).await {
                Ok(()) => {}
                Err(CloudflareError::Cancelled) => return,
                Err(e) => {
                    error!(
                        "CLOUDFLARE | Failed to pull logs for zone {} between {start} and {end}: {e}",
                        self.config.zone_id
                    );
                    let mut status = self.lock_status();
                    status.ready = false;
                    status.err = Some(e.to_string());
                    return;
                }
            }

            self.lock_status().err = None;
            debug!(
                "CLOUDFLARE | Pulled logs for zone {} up to {end}",
                self.config.zone_id
            );
        }
    }

    /// Pulls the sub-windows of `[start, end)` in order, moving the cursor past
    /// each one as soon as it is delivered.
    async fn pull_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), CloudflareError> {
        let key = cursor_key(&self.config.zone_id);
        for request in split_requests(start, end, self.config.workers) {
            self.pull(request.start, request.end).await?;
            let Some(end_nanos) = request.end.timestamp_nanos_opt() else {
                return Err(CloudflareError::Stream(format!(
                    "window end {} is out of range",
                    request.end
                )));
            };
            self.positions.put(&key, &self.labels_str, end_nanos);
            self.cursor.store(end_nanos, Ordering::Release);
        }
        Ok(())
    }

    /// Pulls `[start, end)` with retries. A window Cloudflare no longer retains
    /// counts as delivered.
    pub async fn pull(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), CloudflareError> {
        let mut backoff = Backoff::new(self.config.backoff, self.cancel.clone());
        let mut last_err = String::new();

        while backoff.ongoing() {
            match self.pull_once(start, end).await {
                Ok(()) => return Ok(()),
                Err(CloudflareError::Cancelled) => return Err(CloudflareError::Cancelled),
                Err(e) if e.to_string().contains(TOO_OLD_MESSAGE) => {
                    warn!(
                        "CLOUDFLARE | Skipping window {start} to {end} for zone {}: {e}",
                        self.config.zone_id
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "CLOUDFLARE | Failed to pull logs for zone {} between {start} and {end}, retrying: {e}",
                        self.config.zone_id
                    );
                    self.metrics.inc_cloudflare_errors();
                    last_err = e.to_string();
                    backoff.wait().await;
                }
            }
        }

        match backoff.err() {
            Some(reason @ BackoffError::Exhausted(_)) => Err(CloudflareError::RetriesExhausted {
                reason,
                last: last_err,
            }),
            _ => Err(CloudflareError::Cancelled),
        }
    }

    async fn pull_once(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), CloudflareError> {
        let mut lines = self.client.logpull_received(start, end).await?;
        while let Some(line) = lines.next().await? {
            let entry = LogEntry::new(
                self.config.labels.clone(),
                edge_start_timestamp(&line),
                String::from_utf8_lossy(&line).into_owned(),
            );
            if !self.receiver.send(&self.cancel, entry).await {
                return Err(CloudflareError::Cancelled);
            }
            self.metrics.inc_cloudflare_entries();
        }
        Ok(())
    }

    /// Stops pulling and waits for the loop to exit. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.cancel.cancel();
        #[allow(clippy::expect_used)]
        let handle = self.handle.lock().expect("lock poisoned").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("CLOUDFLARE | Tailer task for zone {} panicked: {e}", self.config.zone_id);
            }
        }
        self.lock_status().ready = false;
    }

    /// Whether the tailer is still pulling.
    pub fn ready(&self) -> bool {
        self.lock_status().ready
    }

    pub fn details(&self) -> BTreeMap<String, String> {
        let status = self.lock_status();
        BTreeMap::from([
            ("zone_id".to_string(), self.config.zone_id.clone()),
            ("labels".to_string(), self.labels_str.clone()),
            ("error".to_string(), status.err.clone().unwrap_or_default()),
            (
                "position".to_string(),
                self.positions
                    .get_string(&cursor_key(&self.config.zone_id), &self.labels_str),
            ),
            ("ready".to_string(), status.ready.to_string()),
        ])
    }

    #[allow(clippy::expect_used)]
    fn lock_status(&self) -> std::sync::MutexGuard<'_, Status> {
        self.status.lock().expect("lock poisoned")
    }
}

/// `EdgeStartTimestamp` of a log line in nanoseconds, or now when it is
/// missing or zero.
fn edge_start_timestamp(line: &[u8]) -> DateTime<Utc> {
    let nanos = serde_json::from_slice::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("EdgeStartTimestamp").and_then(serde_json::Value::as_i64))
        .unwrap_or(0);
    if nanos == 0 {
        return Utc::now();
    }
    DateTime::<Utc>::from_timestamp_nanos(nanos)
}
