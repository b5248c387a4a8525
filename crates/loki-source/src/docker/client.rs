// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Docker Engine API access.
//!
//! Tailers only depend on the [`DockerClient`] trait. [`EngineDockerClient`]
//! implements it on top of `bollard`, over a Unix socket or TCP.

use crate::docker::frame::{encode_frame, StreamType};
use crate::docker::DockerError;
use async_trait::async_trait;
use bollard::container::{
    InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions as EngineLogsOptions,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// Replaced right after connecting by the caller's timeout.
const CONNECT_TIMEOUT_SECS: u64 = 120;

/// State of a container as reported by `GET /containers/{id}/json`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInspect {
    pub running: bool,
    /// RFC3339Nano, or Docker's zero time when the container never finished.
    pub finished_at: String,
    pub tty: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogsOptions {
    pub show_stdout: bool,
    pub show_stderr: bool,
    pub follow: bool,
    pub timestamps: bool,
    /// Unix seconds; only entries at or after this time are returned.
    pub since: i64,
}

impl From<LogsOptions> for EngineLogsOptions<String> {
    fn from(options: LogsOptions) -> Self {
        EngineLogsOptions {
            follow: options.follow,
            stdout: options.show_stdout,
            stderr: options.show_stderr,
            since: options.since,
            timestamps: options.timestamps,
            tail: "all".to_string(),
            ..Default::default()
        }
    }
}

pub type LogStream = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait DockerClient: Send + Sync {
    async fn container_inspect(&self, id: &str) -> Result<ContainerInspect, DockerError>;

    /// Opens the raw log stream of a container. Unless the container has a TTY,
    /// the stream is multiplexed (see [`crate::docker::frame`]).
    async fn container_logs(&self, id: &str, options: LogsOptions)
        -> Result<LogStream, DockerError>;

    async fn container_list(&self) -> Result<Vec<ContainerSummary>, DockerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerHost {
    Unix(PathBuf),
    Tcp(String),
}

impl DockerHost {
    /// Parses `unix:///path`, `tcp://host:port` or `http://host:port`.
    pub fn parse(host: &str) -> Result<Self, DockerError> {
        let invalid = || DockerError::InvalidHost(host.to_string());

        if let Some(path) = host.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(DockerHost::Unix(PathBuf::from(path)));
        }

        let addr = host
            .strip_prefix("tcp://")
            .or_else(|| host.strip_prefix("http://"))
            .ok_or_else(invalid)?
            .trim_end_matches('/');
        if addr.is_empty() || addr.contains('/') {
            return Err(invalid());
        }
        Ok(DockerHost::Tcp(addr.to_string()))
    }
}

/// [`DockerClient`] backed by a `bollard` connection to the daemon.
#[derive(Debug, Clone)]
pub struct EngineDockerClient {
    docker: Docker,
}

impl EngineDockerClient {
    /// `timeout` bounds each request up to its response headers, not the
    /// duration of a followed log stream.
    pub fn new(host: &str, timeout: Duration) -> Result<Self, DockerError> {
        let docker = match DockerHost::parse(host)? {
            #[cfg(unix)]
            DockerHost::Unix(path) => Docker::connect_with_unix(
                &path.to_string_lossy(),
                CONNECT_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            )?,
            #[cfg(not(unix))]
            DockerHost::Unix(_) => {
                return Err(DockerError::InvalidHost(
                    "unix sockets are not supported on this platform".to_string(),
                ))
            }
            DockerHost::Tcp(addr) => {
                Docker::connect_with_http(&addr, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
        };
        Ok(Self {
            docker: docker.with_timeout(timeout),
        })
    }
}

/// Writes a decoded log message back in the wire format of
/// [`crate::docker::frame`]. TTY output has no framing and is passed through.
fn reframe(output: LogOutput) -> Bytes {
    match output {
        LogOutput::StdOut { message } => Bytes::from(encode_frame(StreamType::Stdout, &message)),
        LogOutput::StdErr { message } => Bytes::from(encode_frame(StreamType::Stderr, &message)),
        LogOutput::StdIn { message } => Bytes::from(encode_frame(StreamType::Stdin, &message)),
        LogOutput::Console { message } => message,
    }
}

#[async_trait]
impl DockerClient for EngineDockerClient {
    async fn container_inspect(&self, id: &str) -> Result<ContainerInspect, DockerError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        let state = inspect.state.unwrap_or_default();
        Ok(ContainerInspect {
            running: state.running.unwrap_or(false),
            finished_at: state.finished_at.unwrap_or_default(),
            tty: inspect.config.and_then(|c| c.tty).unwrap_or(false),
        })
    }

    /// The request is sent on first read, so daemon errors surface from the
    /// returned stream.
    async fn container_logs(
        &self,
        id: &str,
        options: LogsOptions,
    ) -> Result<LogStream, DockerError> {
        let frames = self
            .docker
            .logs(id, Some(EngineLogsOptions::from(options)))
            .map(|output| output.map(reframe).map_err(std::io::Error::other));
        Ok(Box::new(StreamReader::new(Box::pin(frames))))
    }

    async fn container_list(&self) -> Result<Vec<ContainerSummary>, DockerError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String>::default()))
            .await?;
        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
                labels: c.labels.unwrap_or_default().into_iter().collect(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use tokio::io::AsyncReadExt;

    fn api_path(path: &str) -> Matcher {
        Matcher::Regex(format!(r"^/v[0-9.]+{path}$"))
    }

    #[test]
    fn test_parse_host() {
        assert_eq!(
            DockerHost::parse(DEFAULT_DOCKER_HOST).unwrap(),
            DockerHost::Unix(PathBuf::from("/var/run/docker.sock"))
        );
        assert_eq!(
            DockerHost::parse("tcp://127.0.0.1:2375").unwrap(),
            DockerHost::Tcp("127.0.0.1:2375".to_string())
        );
        assert_eq!(
            DockerHost::parse("http://localhost:2375/").unwrap(),
            DockerHost::Tcp("localhost:2375".to_string())
        );
        for bad in ["", "unix://", "ftp://host", "tcp://", "localhost:2375"] {
            assert!(
                matches!(DockerHost::parse(bad), Err(DockerError::InvalidHost(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_logs_options() {
        let options = EngineLogsOptions::from(LogsOptions {
            show_stdout: true,
            show_stderr: false,
            follow: true,
            timestamps: true,
            since: 1_702_123_200,
        });
        assert!(options.stdout);
        assert!(!options.stderr);
        assert!(options.follow);
        assert!(options.timestamps);
        assert_eq!(options.since, 1_702_123_200);
        assert_eq!(options.tail, "all");
    }

    #[test]
    fn test_reframe() {
        let stdout = reframe(LogOutput::StdOut {
            message: Bytes::from_static(b"out\n"),
        });
        assert_eq!(&stdout[..], &encode_frame(StreamType::Stdout, b"out\n")[..]);

        let stderr = reframe(LogOutput::StdErr {
            message: Bytes::from_static(b"err\n"),
        });
        assert_eq!(&stderr[..], &[2, 0, 0, 0, 0, 0, 0, 4, b'e', b'r', b'r', b'\n']);

        let console = reframe(LogOutput::Console {
            message: Bytes::from_static(b"tty line\n"),
        });
        assert_eq!(&console[..], b"tty line\n");
    }

    #[tokio::test]
    async fn test_inspect_and_list() {
        let mut server = mockito::Server::new_async().await;
        let inspect = server
            .mock("GET", api_path("/containers/abc/json"))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"State":{"Running":false,"FinishedAt":"2023-12-09T12:00:00.5Z"},"Config":{"Tty":true}}"#,
            )
            .create_async()
            .await;
        let list = server
            .mock("GET", api_path("/containers/json"))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"Id":"abc","Names":["/web"],"Labels":{"app":"web"}}]"#)
            .create_async()
            .await;

        let client = EngineDockerClient::new(
            &format!("tcp://{}", server.host_with_port()),
            Duration::from_secs(2),
        )
        .unwrap();

        assert_eq!(
            client.container_inspect("abc").await.unwrap(),
            ContainerInspect {
                running: false,
                finished_at: "2023-12-09T12:00:00.5Z".to_string(),
                tty: true,
            }
        );
        let containers = client.container_list().await.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].id, "abc");
        assert_eq!(containers[0].names, vec!["/web"]);
        assert_eq!(containers[0].labels.get("app").map(String::as_str), Some("web"));

        inspect.assert_async().await;
        list.assert_async().await;
    }

    #[tokio::test]
    async fn test_logs_stream_and_api_error() {
        let frames = [
            encode_frame(StreamType::Stdout, b"2023-12-09T12:00:00Z out\n"),
            encode_frame(StreamType::Stderr, b"2023-12-09T12:00:01Z err\n"),
        ]
        .concat();

        let mut server = mockito::Server::new_async().await;
        let _logs = server
            .mock("GET", api_path("/containers/abc/logs"))
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("since".into(), "42".into()),
                Matcher::UrlEncoded("stdout".into(), "true".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/vnd.docker.multiplexed-stream")
            .with_body(frames.clone())
            .create_async()
            .await;
        let _missing = server
            .mock("GET", api_path("/containers/missing/json"))
            .with_status(404)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message":"No such container: missing"}"#)
            .create_async()
            .await;

        let client = EngineDockerClient::new(
            &format!("http://{}", server.host_with_port()),
            Duration::from_secs(2),
        )
        .unwrap();

        let mut stream = client
            .container_logs(
                "abc",
                LogsOptions {
                    show_stdout: true,
                    show_stderr: true,
                    since: 42,
                    ..LogsOptions::default()
                },
            )
            .await
            .unwrap();
        let mut body = Vec::new();
        stream.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, frames);

        match client.container_inspect("missing").await {
            Err(DockerError::Api { status, message }) => {
                assert_eq!(status, 404);
                assert_eq!(message, "No such container: missing");
            }
            other => panic!("expected API error, got {other:?}"),
        }
    }
}
