// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Starts and stops long-running sources so that the running set matches the
//! latest list of discovered targets.

use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// A unit of work owned by a [`Scheduler`].
pub trait Source<K>: Send + Sync + 'static {
    /// Identity used to decide whether the source is still wanted.
    fn key(&self) -> K;

    /// Runs until `cancel` fires.
    fn run(self: Arc<Self>, cancel: CancellationToken) -> BoxFuture<'static, ()>;
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The target should not produce a source. Nothing is logged.
    #[error("target skipped")]
    Skip,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

struct Running<S> {
    source: Arc<S>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Set of running sources keyed by `K`.
pub struct Scheduler<K, S> {
    running: HashMap<K, Running<S>>,
}

impl<K, S> Default for Scheduler<K, S> {
    fn default() -> Self {
        Self {
            running: HashMap::new(),
        }
    }
}

impl<K, S> std::fmt::Debug for Scheduler<K, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("sources", &self.running.len())
            .finish()
    }
}

impl<K, S> Scheduler<K, S>
where
    K: Eq + Hash + Clone + Display + Send + 'static,
    S: Source<K>,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `source`. A source already running under the same key is left as is.
    pub fn start_source(&mut self, source: Arc<S>) {
        let key = source.key();
        if self.running.contains_key(&key) {
            warn!("SCHEDULER | Source {key} is already running");
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&source).run(cancel.clone()));
        debug!("SCHEDULER | Started source {key}");
        self.running.insert(
            key,
            Running {
                source,
                cancel,
                handle,
            },
        );
    }

    /// Cancels the source under `key` and waits for it to return.
    pub async fn stop_source(&mut self, key: &K) {
        let Some(running) = self.running.remove(key) else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            error!("SCHEDULER | Source {key} panicked: {e}");
        }
        debug!("SCHEDULER | Stopped source {key}");
    }

    pub fn contains(&self, key: &K) -> bool {
        self.running.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.running.keys()
    }

    pub fn sources(&self) -> Vec<Arc<S>> {
        self.running
            .values()
            .map(|running| Arc::clone(&running.source))
            .collect()
    }

    /// Stops every source, leaving the scheduler empty and reusable.
    pub async fn reset(&mut self) {
        let keys: Vec<K> = self.running.keys().cloned().collect();
        for running in self.running.values() {
            running.cancel.cancel();
        }
        for key in keys {
            self.stop_source(&key).await;
        }
    }

    /// Stops every source.
    pub async fn stop(&mut self) {
        self.reset().await;
    }
}

/// Makes the sources of `scheduler` match `targets`.
///
/// Sources whose key no longer appears in `targets` are stopped. For each key
/// that is not running yet, `build` is called with the first target carrying
/// that key. Targets for which `key_fn` returns `None` are ignored.
pub async fn reconcile<K, S, T, KF, BF>(
    scheduler: &mut Scheduler<K, S>,
    targets: &[T],
    key_fn: KF,
    mut build: BF,
) where
    K: Eq + Hash + Clone + Display + Send + 'static,
    S: Source<K>,
    KF: Fn(&T) -> Option<K>,
    BF: FnMut(&K, &T) -> Result<Arc<S>, ReconcileError>,
{
    let mut wanted: Vec<(K, &T)> = Vec::with_capacity(targets.len());
    let mut seen = HashSet::with_capacity(targets.len());
    for target in targets {
        if let Some(key) = key_fn(target) {
            if seen.insert(key.clone()) {
                wanted.push((key, target));
            }
        }
    }

    let stale: Vec<K> = scheduler
        .keys()
        .filter(|key| !seen.contains(*key))
        .cloned()
        .collect();
    for key in stale {
        scheduler.stop_source(&key).await;
    }

    for (key, target) in wanted {
        if scheduler.contains(&key) {
            continue;
        }
        match build(&key, target) {
            Ok(source) => scheduler.start_source(source),
            Err(ReconcileError::Skip) => {}
            Err(e) => error!("SCHEDULER | Failed to create source {key}: {e}"),
        }
    }
}
