// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cloudflare Logpull source.
//!
//! [`CloudflareComponent`] owns a single [`tailer::PullTailer`] for the
//! configured zone and forwards the HTTP request logs it pulls to its output.

pub mod client;
pub mod fields;
pub mod tailer;

use crate::backoff::{BackoffConfig, BackoffError};
use crate::entry::{logs_channel, LabelSet, LogEntry, LogsReceiver, DEFAULT_CHANNEL_CAPACITY};
use crate::metrics::Metrics;
use crate::positions::{FilePositions, Positions, PositionsConfig, PositionsError};
use crate::ComponentOptions;
use client::ClientFactory;
use fields::{fields_for_type, FieldsType};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tailer::{PullTailer, TailerConfig, TailerOptions};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const POSITIONS_SYNC_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum CloudflareError {
    #[error("invalid fields_type {0:?}, expected one of default, minimal, extended, all, custom")]
    InvalidFieldsType(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("HTTP status {status}: {message}")]
    Api { status: u16, message: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Stream(String),
    #[error("{reason}: {last}")]
    RetriesExhausted { reason: BackoffError, last: String },
    #[error("pull cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Positions(#[from] PositionsError),
}

#[derive(Clone, PartialEq, Eq)]
pub struct Arguments {
    pub api_token: String,
    pub zone_id: String,
    pub labels: LabelSet,
    pub workers: usize,
    pub pull_range: Duration,
    pub fields_type: FieldsType,
    pub additional_fields: Vec<String>,
    pub backoff: BackoffConfig,
}

impl Default for Arguments {
    fn default() -> Self {
        Self {
            api_token: String::new(),
            zone_id: String::new(),
            labels: LabelSet::new(),
            workers: 3,
            pull_range: Duration::from_secs(60),
            fields_type: FieldsType::Default,
            additional_fields: Vec::new(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl fmt::Debug for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arguments")
            .field("api_token", &"<redacted>")
            .field("zone_id", &self.zone_id)
            .field("labels", &self.labels)
            .field("workers", &self.workers)
            .field("pull_range", &self.pull_range)
            .field("fields_type", &self.fields_type)
            .field("additional_fields", &self.additional_fields)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl Arguments {
    pub fn validate(&self) -> Result<(), CloudflareError> {
        let invalid = |msg: &str| Err(CloudflareError::InvalidArguments(msg.to_string()));
        if self.api_token.is_empty() {
            return invalid("api_token must not be empty");
        }
        if self.zone_id.is_empty() {
            return invalid("zone_id must not be empty");
        }
        if self.workers == 0 {
            return invalid("workers must be positive");
        }
        if self.pull_range.is_zero() {
            return invalid("pull_range must be positive");
        }
        if self.fields_type == FieldsType::Custom && self.additional_fields.is_empty() {
            return invalid("additional_fields must be set when fields_type is custom");
        }
        if self.backoff.min_backoff > self.backoff.max_backoff {
            return invalid("min_backoff must not exceed max_backoff");
        }
        Ok(())
    }

    /// Fields requested from the Logpull API.
    pub fn fields(&self) -> Vec<String> {
        fields_for_type(self.fields_type, &self.additional_fields)
    }
}

struct Running {
    args: Arguments,
    tailer: Arc<PullTailer>,
}

pub struct CloudflareComponent {
    opts: ComponentOptions,
    metrics: Arc<Metrics>,
    positions: Arc<FilePositions>,
    client_factory: ClientFactory,
    handler: LogsReceiver,
    handler_rx: Mutex<Option<mpsc::Receiver<LogEntry>>>,
    output: LogsReceiver,
    running: Mutex<Option<Running>>,
}

impl fmt::Debug for CloudflareComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudflareComponent")
            .field("id", &self.opts.id)
            .finish_non_exhaustive()
    }
}

impl CloudflareComponent {
    pub async fn new(
        opts: ComponentOptions,
        args: Arguments,
        output: LogsReceiver,
        client_factory: ClientFactory,
    ) -> Result<Self, CloudflareError> {
        tokio::fs::create_dir_all(&opts.data_path).await?;
        let positions = Arc::new(FilePositions::new(PositionsConfig {
            sync_period: POSITIONS_SYNC_PERIOD,
            positions_file: opts.data_path.join("positions.yml"),
            ignore_invalid_yaml: false,
            read_only: false,
        })?);
        let (handler, handler_rx) = logs_channel(DEFAULT_CHANNEL_CAPACITY);

        let component = Self {
            opts,
            metrics: Arc::new(Metrics::new()),
            positions,
            client_factory,
            handler,
            handler_rx: Mutex::new(Some(handler_rx)),
            output,
            running: Mutex::new(None),
        };
        component.update(args).await?;
        Ok(component)
    }

    /// Restarts the tailer if `args` differ from the running ones.
    pub async fn update(&self, args: Arguments) -> Result<(), CloudflareError> {
        args.validate()?;
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| r.args == args) {
            return Ok(());
        }

        if let Some(previous) = running.take() {
            info!(
                "CLOUDFLARE | Arguments changed, restarting tailer for zone {}",
                previous.args.zone_id
            );
            previous.tailer.stop().await;
        }

        let client = (self.client_factory)(&args.api_token, &args.zone_id, &args.fields())?;
        let tailer = PullTailer::start(TailerOptions {
            config: TailerConfig {
                zone_id: args.zone_id.clone(),
                labels: args.labels.clone(),
                pull_range: args.pull_range,
                workers: args.workers,
                backoff: args.backoff,
            },
            client,
            positions: Arc::clone(&self.positions) as Arc<dyn Positions>,
            receiver: self.handler.clone(),
            metrics: Arc::clone(&self.metrics),
        })?;
        *running = Some(Running { args, tailer });
        Ok(())
    }

    /// Forwards entries to the output until `cancel` fires, then stops the
    /// tailer and persists the cursor.
    pub async fn run(&self, cancel: CancellationToken) {
        let Some(mut rx) = self.handler_rx.lock().await.take() else {
            error!("CLOUDFLARE | Component {} is already running", self.opts.id);
            return;
        };

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(entry) = rx.recv() => {
                    if !self.output.send(&cancel, entry).await {
                        break;
                    }
                }
            }
        }

        let tailer = self.running.lock().await.take().map(|r| r.tailer);
        if let Some(tailer) = tailer {
            let stop = tailer.stop();
            tokio::pin!(stop);
            loop {
                tokio::select! {
                    () = &mut stop => break,
                    _ = rx.recv() => {}
                }
            }
        }

        self.positions.stop();
        debug!("CLOUDFLARE | Component {} stopped", self.opts.id);
    }

    /// Details of the running tailer, if any.
    pub async fn debug_info(&self) -> Option<BTreeMap<String, String>> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.tailer.details())
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}
