// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Labeled log entries and the channel they travel through.

use chrono::{DateTime, Utc};
use fnv::FnvHasher;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Ordered set of label name/value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns a copy of `self` with every label of `other` set on top.
    #[must_use]
    pub fn merge(&self, other: &LabelSet) -> LabelSet {
        let mut merged = self.clone();
        for (k, v) in other.iter() {
            merged.insert(k, v);
        }
        merged
    }

    /// Removes every label whose name starts with `__`.
    #[must_use]
    pub fn without_reserved(mut self) -> LabelSet {
        self.0.retain(|name, _| !name.starts_with("__"));
        self
    }

    /// Stable 64-bit fingerprint, used to order targets deterministically.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        hasher.write(self.to_string().as_bytes());
        hasher.finish()
    }
}

impl fmt::Display for LabelSet {
    /// Renders as `{name="value", other="value"}`, the key under which cursors
    /// are stored.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}=\"")?;
            for c in value.chars() {
                match c {
                    '\\' => f.write_str("\\\\")?,
                    '"' => f.write_str("\\\"")?,
                    '\n' => f.write_str("\\n")?,
                    '\t' => f.write_str("\\t")?,
                    c => write!(f, "{c}")?,
                }
            }
            f.write_str("\"")?;
        }
        f.write_str("}")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for LabelSet {
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

/// A single log line with its labels and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub labels: LabelSet,
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

impl LogEntry {
    pub fn new(labels: LabelSet, timestamp: DateTime<Utc>, line: impl Into<String>) -> Self {
        Self {
            labels,
            timestamp,
            line: line.into(),
        }
    }
}

/// Sending half of a log entry channel.
///
/// Sends wait for the consumer to accept the entry, so a slow consumer stalls
/// the producer instead of entries being buffered or dropped.
#[derive(Debug, Clone)]
pub struct LogsReceiver {
    tx: mpsc::Sender<LogEntry>,
}

impl LogsReceiver {
    pub fn new(tx: mpsc::Sender<LogEntry>) -> Self {
        Self { tx }
    }

    /// Sends `entry`, giving up when `cancel` fires or the consumer is gone.
    ///
    /// Returns whether the entry was accepted.
    pub async fn send(&self, cancel: &CancellationToken, entry: LogEntry) -> bool {
        tokio::select! {
            res = self.tx.send(entry) => res.is_ok(),
            () = cancel.cancelled() => false,
        }
    }
}

/// Channel capacity used by components for their internal receiver.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1;

/// Creates a bounded entry channel.
pub fn logs_channel(capacity: usize) -> (LogsReceiver, mpsc::Receiver<LogEntry>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (LogsReceiver::new(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_label_set_display() {
        let labels = LabelSet::from([("job", "docker"), ("container", "a\"b")]);
        assert_eq!(labels.to_string(), r#"{container="a\"b", job="docker"}"#);
        assert_eq!(LabelSet::new().to_string(), "{}");
    }

    #[test]
    fn test_label_set_merge_overrides() {
        let base = LabelSet::from([("job", "docker"), ("env", "dev")]);
        let merged = base.merge(&LabelSet::from([("env", "prod")]));
        assert_eq!(merged.get("env"), Some("prod"));
        assert_eq!(merged.get("job"), Some("docker"));
        assert_eq!(base.get("env"), Some("dev"));
    }

    #[test]
    fn test_without_reserved() {
        let labels = LabelSet::from([("__meta_docker_container_id", "abc"), ("job", "x")]);
        let filtered = labels.without_reserved();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get("job"), Some("x"));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = LabelSet::from([("a", "1"), ("b", "2")]);
        let b = LabelSet::from([("b", "2"), ("a", "1")]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), LabelSet::from([("a", "1")]).fingerprint());
        // FNV-1a of `{a="1", b="2"}`, identical across processes and releases.
        assert_eq!(a.fingerprint(), 0x08d7_4e80_d084_98fd);
    }

    #[tokio::test]
    async fn test_send_observes_cancellation_when_blocked() {
        let (receiver, mut rx) = logs_channel(1);
        let cancel = CancellationToken::new();
        let entry = LogEntry::new(LabelSet::new(), Utc::now(), "first");

        assert!(receiver.send(&cancel, entry.clone()).await);

        // The channel is full, so the second send blocks until cancelled.
        let blocked = {
            let receiver = receiver.clone();
            let cancel = cancel.clone();
            let entry = entry.clone();
            tokio::spawn(async move { receiver.send(&cancel, entry).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(!blocked.await.expect("send task panicked"));
        assert_eq!(rx.recv().await.map(|e| e.line), Some("first".to_string()));
    }
}
