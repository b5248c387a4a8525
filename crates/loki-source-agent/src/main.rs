// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::Arc;
use tokio::{
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    task::JoinSet,
    time::interval,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use loki_source::{
    cloudflare::{client::http_client_factory, client::DEFAULT_API_URL, CloudflareComponent},
    config::Config,
    docker::{
        client::{ContainerSummary, DockerClient, EngineDockerClient},
        DockerComponent, DOCKER_LABEL_CONTAINER_ID,
    },
    entry::{logs_channel, LabelSet, LogEntry},
    ComponentOptions,
};

const OUTPUT_CHANNEL_CAPACITY: usize = 128;
const DOCKER_LABEL_CONTAINER_NAME: &str = "__meta_docker_container_name";
const DOCKER_LABEL_CONTAINER_LABEL_PREFIX: &str = "__meta_docker_container_label_";

#[tokio::main]
pub async fn main() {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            return;
        }
    };

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", config.log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let cancel = CancellationToken::new();
    let (output, output_rx) = logs_channel(OUTPUT_CHANNEL_CAPACITY);
    let mut tasks = JoinSet::new();

    if config.use_docker {
        let discovery: Arc<dyn DockerClient> =
            match EngineDockerClient::new(&config.docker_host, config.docker_refresh_interval) {
                Ok(client) => Arc::new(client),
                Err(e) => {
                    error!("Error creating Docker client for {}: {e}", config.docker_host);
                    return;
                }
            };
        let component = match DockerComponent::new(
            ComponentOptions {
                id: "loki.source.docker".to_string(),
                data_path: config.data_path.join("docker"),
            },
            config.docker_arguments(Vec::new()),
            output.clone(),
        )
        .await
        {
            Ok(c) => Arc::new(c),
            Err(e) => {
                error!("Error starting Docker source: {e}");
                return;
            }
        };
        info!("Tailing containers from {}", config.docker_host);

        tasks.spawn({
            let component = Arc::clone(&component);
            let cancel = cancel.clone();
            async move { component.run(cancel).await }
        });
        tasks.spawn(discover_containers(
            config.clone(),
            discovery,
            component,
            cancel.clone(),
        ));
    } else {
        info!("Docker source disabled");
    }

    if let Some(args) = config.cloudflare_arguments() {
        let zone_id = args.zone_id.clone();
        let component = match CloudflareComponent::new(
            ComponentOptions {
                id: "loki.source.cloudflare".to_string(),
                data_path: config.data_path.join("cloudflare"),
            },
            args,
            output.clone(),
            http_client_factory(DEFAULT_API_URL),
        )
        .await
        {
            Ok(c) => Arc::new(c),
            Err(e) => {
                error!("Error starting Cloudflare source: {e}");
                return;
            }
        };
        info!("Pulling Cloudflare logs for zone {zone_id}");

        let cancel = cancel.clone();
        tasks.spawn(async move { component.run(cancel).await });
    } else {
        info!("Cloudflare source disabled");
    }

    if tasks.is_empty() {
        warn!("No source enabled, nothing to do");
        return;
    }
    drop(output);

    let writer = tokio::spawn(write_entries(output_rx));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received interrupt, shutting down"),
        Err(e) => error!("Unable to listen for shutdown signal: {e}"),
    }
    cancel.cancel();

    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            error!("Source task failed: {e}");
        }
    }
    if let Err(e) = writer.await {
        error!("Output task failed: {e}");
    }
    debug!("Shutdown complete");
}

/// Lists running containers every refresh interval and hands them to the
/// Docker source as targets.
async fn discover_containers(
    config: Config,
    client: Arc<dyn DockerClient>,
    component: Arc<DockerComponent>,
    cancel: CancellationToken,
) {
    let mut refresh = interval(config.docker_refresh_interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = refresh.tick() => {}
        }

        let containers = match client.container_list().await {
            Ok(containers) => containers,
            Err(e) => {
                error!("Error listing containers: {e}");
                continue;
            }
        };
        // Listing can outlast shutdown; targets must not be started after it.
        if cancel.is_cancelled() {
            return;
        }
        debug!("Discovered {} containers", containers.len());

        let targets = containers.iter().map(container_target).collect();
        if let Err(e) = component.update(config.docker_arguments(targets)).await {
            error!("Error updating Docker targets: {e}");
        }
    }
}

/// Discovery labels of a container. Only `container` survives once reserved
/// labels are dropped.
fn container_target(container: &ContainerSummary) -> LabelSet {
    let mut labels = LabelSet::new();
    labels.insert(DOCKER_LABEL_CONTAINER_ID, container.id.as_str());
    if let Some(name) = container.names.first() {
        labels.insert(DOCKER_LABEL_CONTAINER_NAME, name.as_str());
        labels.insert("container", name.trim_start_matches('/'));
    }
    for (name, value) in &container.labels {
        labels.insert(
            format!("{DOCKER_LABEL_CONTAINER_LABEL_PREFIX}{}", sanitize_label_name(name)),
            value.as_str(),
        );
    }
    labels
}

fn sanitize_label_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Prints every entry as a JSON line on stdout until all sources are done.
async fn write_entries(mut rx: mpsc::Receiver<LogEntry>) {
    let mut stdout = BufWriter::new(tokio::io::stdout());
    while let Some(entry) = rx.recv().await {
        let mut line = match serde_json::to_vec(&entry) {
            Ok(line) => line,
            Err(e) => {
                error!("Error serializing entry: {e}");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = stdout.write_all(&line).await {
            error!("Error writing entry: {e}");
            return;
        }
        if rx.is_empty() {
            if let Err(e) = stdout.flush().await {
                error!("Error flushing output: {e}");
                return;
            }
        }
    }
    if let Err(e) = stdout.flush().await {
        error!("Error flushing output: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use loki_source::docker::{
        client::{ContainerInspect, LogStream, LogsOptions},
        Arguments, ClientBuilder, DockerError,
    };
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Client whose listing races with shutdown: the token is cancelled while
    /// the list call is in flight.
    struct CancellingClient {
        cancel: CancellationToken,
        lists: AtomicUsize,
    }

    #[async_trait]
    impl DockerClient for CancellingClient {
        async fn container_inspect(&self, _id: &str) -> Result<ContainerInspect, DockerError> {
            Ok(ContainerInspect {
                running: true,
                ..ContainerInspect::default()
            })
        }

        async fn container_logs(
            &self,
            _id: &str,
            _options: LogsOptions,
        ) -> Result<LogStream, DockerError> {
            Ok(Box::new(tokio::io::empty()))
        }

        async fn container_list(&self) -> Result<Vec<ContainerSummary>, DockerError> {
            self.cancel.cancel();
            self.lists.fetch_add(1, Ordering::SeqCst);
            Ok(vec![ContainerSummary {
                id: "abc".to_string(),
                names: vec!["/web".to_string()],
                ..ContainerSummary::default()
            }])
        }
    }

    #[tokio::test]
    async fn test_discovery_does_not_update_after_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let client = Arc::new(CancellingClient {
            cancel: cancel.clone(),
            lists: AtomicUsize::new(0),
        });
        let config = Config {
            data_path: dir.path().to_path_buf(),
            docker_host: "tcp://127.0.0.1:2375".to_string(),
            ..Config::default()
        };

        let builder_client: Arc<dyn DockerClient> = client.clone();
        let builder: ClientBuilder =
            Arc::new(move |_: &Arguments| Ok::<_, DockerError>(Arc::clone(&builder_client)));
        let (output, _rx) = logs_channel(1);
        let component = Arc::new(
            DockerComponent::with_client_builder(
                ComponentOptions {
                    id: "loki.source.docker".to_string(),
                    data_path: dir.path().join("docker"),
                },
                config.docker_arguments(Vec::new()),
                output,
                builder,
            )
            .await
            .unwrap(),
        );

        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            discover_containers(config, client.clone(), Arc::clone(&component), cancel),
        )
        .await
        .expect("discovery did not stop");

        assert_eq!(client.lists.load(Ordering::SeqCst), 1);
        assert!(component.debug_info().await.is_empty());
    }

    #[test]
    fn test_container_target() {
        let container = ContainerSummary {
            id: "abc".to_string(),
            names: vec!["/web".to_string()],
            labels: BTreeMap::from([("com.docker.compose.service".to_string(), "api".to_string())]),
        };
        let target = container_target(&container);
        assert_eq!(target.get(DOCKER_LABEL_CONTAINER_ID), Some("abc"));
        assert_eq!(target.get(DOCKER_LABEL_CONTAINER_NAME), Some("/web"));
        assert_eq!(target.get("container"), Some("web"));
        assert_eq!(
            target.get("__meta_docker_container_label_com_docker_compose_service"),
            Some("api")
        );
        assert_eq!(target.clone().without_reserved().len(), 1);
    }
}
