// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Docker container log source.
//!
//! [`DockerComponent`] receives a list of discovered targets (label sets
//! carrying a container ID), runs one [`tailer::Tailer`] per container and
//! forwards everything they read to its output.

pub mod chunk_writer;
pub mod client;
pub mod frame;
pub mod scanner;
pub mod tailer;

use crate::entry::{logs_channel, LabelSet, LogEntry, LogsReceiver, DEFAULT_CHANNEL_CAPACITY};
use crate::metrics::Metrics;
use crate::positions::{FilePositions, Positions, PositionsConfig, PositionsError};
use crate::scheduler::{reconcile, ReconcileError, Scheduler};
use crate::ComponentOptions;
use chunk_writer::BufferPool;
use client::{DockerClient, DockerHost, EngineDockerClient, DEFAULT_DOCKER_HOST};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tailer::{NoopRelabel, Relabel, Tailer, TailerOptions};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Label holding the ID of the container a target points at.
pub const DOCKER_LABEL_CONTAINER_ID: &str = "__meta_docker_container_id";
/// Label set on entries to the stream they were read from, `stdout` or `stderr`.
pub const DOCKER_LABEL_LOG_STREAM: &str = "__meta_docker_container_log_stream";
/// Size above which Docker splits a log line into several frames.
pub const DOCKER_MAX_CHUNK_SIZE: usize = 16384;

const POSITIONS_SYNC_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum DockerError {
    #[error("invalid Docker host {0:?}")]
    InvalidHost(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("Docker API returned status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("error from daemon in stream: {0}")]
    Daemon(String),
    #[error("unrecognized stream type {0}")]
    UnknownStream(u8),
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
    #[error(transparent)]
    Engine(bollard::errors::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Positions(#[from] PositionsError),
}

impl From<bollard::errors::Error> for DockerError {
    fn from(e: bollard::errors::Error) -> Self {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => DockerError::Api {
                status: status_code,
                message,
            },
            other => DockerError::Engine(other),
        }
    }
}

/// State of one tailer, as exposed by [`DockerComponent::debug_info`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub id: String,
    pub last_error: String,
    pub labels: String,
    pub is_running: bool,
    pub read_offset: String,
}

#[derive(Clone)]
pub struct Arguments {
    pub host: String,
    /// Discovered targets; each needs a [`DOCKER_LABEL_CONTAINER_ID`] label.
    pub targets: Vec<LabelSet>,
    /// Labels added to every entry.
    pub labels: LabelSet,
    pub relabel: Arc<dyn Relabel>,
    pub refresh_interval: Duration,
    /// How often a tailer checks whether its container needs a new log stream.
    pub restart_interval: Duration,
}

impl Default for Arguments {
    fn default() -> Self {
        Self {
            host: DEFAULT_DOCKER_HOST.to_string(),
            targets: Vec::new(),
            labels: LabelSet::new(),
            relabel: Arc::new(NoopRelabel),
            refresh_interval: Duration::from_secs(60),
            restart_interval: Duration::from_secs(5),
        }
    }
}

impl fmt::Debug for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arguments")
            .field("host", &self.host)
            .field("targets", &self.targets)
            .field("labels", &self.labels)
            .field("refresh_interval", &self.refresh_interval)
            .field("restart_interval", &self.restart_interval)
            .finish_non_exhaustive()
    }
}

impl Arguments {
    pub fn validate(&self) -> Result<(), DockerError> {
        DockerHost::parse(&self.host)?;
        if self.refresh_interval.is_zero() {
            return Err(DockerError::InvalidArguments(
                "refresh_interval must be positive".to_string(),
            ));
        }
        if self.restart_interval.is_zero() {
            return Err(DockerError::InvalidArguments(
                "restart_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builds a client for a Docker host.
pub type ClientBuilder =
    Arc<dyn Fn(&Arguments) -> Result<Arc<dyn DockerClient>, DockerError> + Send + Sync>;

/// Client builder connecting to the daemon with `bollard`, with requests bounded
/// by the refresh interval.
pub fn engine_client_builder() -> ClientBuilder {
    Arc::new(|args: &Arguments| {
        let client: Arc<dyn DockerClient> =
            Arc::new(EngineDockerClient::new(&args.host, args.refresh_interval)?);
        Ok(client)
    })
}

struct ComponentState {
    host: Option<String>,
    client: Option<Arc<dyn DockerClient>>,
    scheduler: Scheduler<String, Tailer>,
}

pub struct DockerComponent {
    opts: ComponentOptions,
    metrics: Arc<Metrics>,
    positions: Arc<FilePositions>,
    buffer_pool: BufferPool,
    client_builder: ClientBuilder,
    exited: Arc<AtomicBool>,
    handler: LogsReceiver,
    handler_rx: Mutex<Option<mpsc::Receiver<LogEntry>>>,
    output: LogsReceiver,
    state: Mutex<ComponentState>,
}

impl fmt::Debug for DockerComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DockerComponent")
            .field("id", &self.opts.id)
            .finish_non_exhaustive()
    }
}

impl DockerComponent {
    pub async fn new(
        opts: ComponentOptions,
        args: Arguments,
        output: LogsReceiver,
    ) -> Result<Self, DockerError> {
        Self::with_client_builder(opts, args, output, engine_client_builder()).await
    }

    pub async fn with_client_builder(
        opts: ComponentOptions,
        args: Arguments,
        output: LogsReceiver,
        client_builder: ClientBuilder,
    ) -> Result<Self, DockerError> {
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
            buffer_pool: BufferPool::new(),
            client_builder,
            exited: Arc::new(AtomicBool::new(false)),
            handler,
            handler_rx: Mutex::new(Some(handler_rx)),
            output,
            state: Mutex::new(ComponentState {
                host: None,
                client: None,
                scheduler: Scheduler::new(),
            }),
        };
        component.update(args).await?;
        Ok(component)
    }

    /// Applies new arguments: starts tailers for new containers and stops the
    /// ones whose target disappeared.
    pub async fn update(&self, args: Arguments) -> Result<(), DockerError> {
        args.validate()?;
        let mut state = self.state.lock().await;

        let client = match (&state.client, &state.host) {
            (Some(client), Some(host)) if *host == args.host => Arc::clone(client),
            _ => {
                let client = (self.client_builder)(&args).map_err(|e| {
                    error!("DOCKER | Could not create new Docker client: {e}");
                    e
                })?;
                if state.client.is_some() {
                    info!("DOCKER | Docker host changed to {}, restarting tailers", args.host);
                    state.scheduler.reset().await;
                }
                state.client = Some(Arc::clone(&client));
                state.host = Some(args.host.clone());
                client
            }
        };

        let mut targets = args.targets.clone();
        targets.sort_by_key(LabelSet::fingerprint);

        reconcile(
            &mut state.scheduler,
            &targets,
            |target| {
                let id = target.get(DOCKER_LABEL_CONTAINER_ID).unwrap_or_default();
                if id.is_empty() {
                    debug!("DOCKER | Target did not include container ID label {DOCKER_LABEL_CONTAINER_ID}");
                    return None;
                }
                Some(id.to_string())
            },
            |container_id, target| {
                let tailer = Tailer::new(TailerOptions {
                    container_id: container_id.clone(),
                    labels: target.merge(&args.labels),
                    relabel: Arc::clone(&args.relabel),
                    client: Arc::clone(&client),
                    positions: Arc::clone(&self.positions) as Arc<dyn Positions>,
                    receiver: self.handler.clone(),
                    metrics: Arc::clone(&self.metrics),
                    buffer_pool: self.buffer_pool.clone(),
                    restart_interval: args.restart_interval,
                    component_stopping: Arc::clone(&self.exited),
                })
                .map_err(|e| ReconcileError::Other(e.into()))?;
                Ok(Arc::new(tailer))
            },
        )
        .await;

        Ok(())
    }

    /// Forwards entries to the output until `cancel` fires, then stops every
    /// tailer and persists the cursors.
    pub async fn run(&self, cancel: CancellationToken) {
        let Some(mut rx) = self.handler_rx.lock().await.take() else {
            error!("DOCKER | Component {} is already running", self.opts.id);
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

        self.exited.store(true, Ordering::Release);

        // Tailers may be blocked on a send, so keep draining while they stop.
        let stop = async {
            self.state.lock().await.scheduler.stop().await;
        };
        tokio::pin!(stop);
        loop {
            tokio::select! {
                () = &mut stop => break,
                _ = rx.recv() => {}
            }
        }

        self.positions.stop();
        debug!("DOCKER | Component {} stopped", self.opts.id);
    }

    pub async fn debug_info(&self) -> Vec<SourceInfo> {
        let sources = self.state.lock().await.scheduler.sources();
        let mut infos = Vec::with_capacity(sources.len());
        for tailer in sources {
            infos.push(tailer.debug_info().await);
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arguments_validate() {
        assert!(Arguments::default().validate().is_ok());

        let args = Arguments {
            host: "not a host".to_string(),
            ..Arguments::default()
        };
        assert!(matches!(args.validate(), Err(DockerError::InvalidHost(_))));

        let args = Arguments {
            refresh_interval: Duration::ZERO,
            ..Arguments::default()
        };
        assert!(matches!(
            args.validate(),
            Err(DockerError::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_error_messages() {
        let err = DockerError::Api {
            status: 404,
            message: "No such container: abc".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Docker API returned status 404: No such container: abc"
        );
        assert_eq!(
            DockerError::Daemon("boom".to_string()).to_string(),
            "error from daemon in stream: boom"
        );
    }
}
