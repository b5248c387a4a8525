// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Log sources that tail remote log producers and hand labeled entries to a
//! downstream receiver.
//!
//! Two engines live here:
//!
//! - **[`docker`]**: follows the log stream of every discovered container,
//!   reassembles long frames, and resumes from the last emitted timestamp after
//!   container restarts.
//! - **[`cloudflare`]**: pulls the Cloudflare Logpull API on a fixed interval,
//!   partitioning each interval into equal sub-windows that are retried with
//!   backoff.
//!
//! Both persist their read cursor in a [`positions::Positions`] store. Docker
//! tailers are started and stopped per container by a [`scheduler::Scheduler`].

pub mod backoff;
pub mod cloudflare;
pub mod config;
pub mod docker;
pub mod entry;
pub mod metrics;
pub mod parse;
pub mod positions;
pub mod scheduler;

/// Options shared by every source component.
#[derive(Debug, Clone)]
pub struct ComponentOptions {
    /// Identifier used in log messages, e.g. `loki.source.docker.default`.
    pub id: String,
    /// Directory in which the component keeps its positions file.
    pub data_path: std::path::PathBuf,
}
