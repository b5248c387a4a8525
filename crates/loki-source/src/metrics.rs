// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Counters maintained by the tailers.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    docker_entries: AtomicU64,
    docker_errors: AtomicU64,
    cloudflare_entries: AtomicU64,
    cloudflare_errors: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub docker_entries: u64,
    pub docker_errors: u64,
    pub cloudflare_entries: u64,
    pub cloudflare_errors: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_docker_entries(&self) {
        self.docker_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_docker_errors(&self) {
        self.docker_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cloudflare_entries(&self) {
        self.cloudflare_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cloudflare_errors(&self) {
        self.cloudflare_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            docker_entries: self.docker_entries.load(Ordering::Relaxed),
            docker_errors: self.docker_errors.load(Ordering::Relaxed),
            cloudflare_entries: self.cloudflare_entries.load(Ordering::Relaxed),
            cloudflare_errors: self.cloudflare_errors.load(Ordering::Relaxed),
        }
    }
}
