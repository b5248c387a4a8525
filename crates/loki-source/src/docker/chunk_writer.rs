// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reassembly of log lines that Docker split into several frames.
//!
//! Docker cuts lines longer than [`DOCKER_MAX_CHUNK_SIZE`] into consecutive
//! frames, each carrying its own timestamp prefix. [`ChunkWriter`] glues them
//! back together so that downstream line framing sees a single
//! `<timestamp> <content>\n` line.

use crate::docker::DOCKER_MAX_CHUNK_SIZE;
use crate::parse::extract_ts_from_bytes;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

const MAX_POOLED_BUFFERS: usize = 32;

/// Free list of reassembly buffers shared by the tailers of a component.
#[derive(Debug, Clone, Default)]
pub struct BufferPool {
    free: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes an empty buffer, allocating one if the pool is empty.
    pub fn get(&self) -> Vec<u8> {
        #[allow(clippy::expect_used)]
        let buffer = self.free.lock().expect("lock poisoned").pop();
        buffer.unwrap_or_else(|| Vec::with_capacity(DOCKER_MAX_CHUNK_SIZE * 2))
    }

    /// Returns a buffer to the pool.
    pub fn put(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        #[allow(clippy::expect_used)]
        let mut free = self.free.lock().expect("lock poisoned");
        if free.len() < MAX_POOLED_BUFFERS {
            free.push(buffer);
        }
    }

    #[allow(clippy::expect_used)]
    pub fn available(&self) -> usize {
        self.free.lock().expect("lock poisoned").len()
    }
}

/// Writer that receives one Docker frame payload per [`ChunkWriter::write`] call.
#[derive(Debug)]
pub struct ChunkWriter<W> {
    inner: W,
    pool: BufferPool,
    buffer: Option<Vec<u8>>,
    buffering: bool,
}

impl<W: AsyncWrite + Unpin> ChunkWriter<W> {
    pub fn new(inner: W, pool: BufferPool) -> Self {
        let buffer = Some(pool.get());
        Self {
            inner,
            pool,
            buffer,
            buffering: false,
        }
    }

    /// Writes one frame payload, holding back partial long lines until their
    /// final chunk arrives.
    pub async fn write(&mut self, p: &[u8]) -> io::Result<usize> {
        let ends_line = p.last() == Some(&b'\n');

        if !self.buffering {
            if p.len() < DOCKER_MAX_CHUNK_SIZE || ends_line {
                self.inner.write_all(p).await?;
                return Ok(p.len());
            }
            self.buffer_mut()?.extend_from_slice(p);
            self.buffering = true;
            return Ok(p.len());
        }

        // Continuation chunks repeat the timestamp of the line.
        let content = match extract_ts_from_bytes(p) {
            Ok((_, content)) => content,
            Err(e) => {
                warn!("DOCKER | Could not strip timestamp from continuation chunk: {e}");
                p
            }
        };
        self.buffer_mut()?.extend_from_slice(content);

        if ends_line {
            let Some(buffer) = self.buffer.as_mut() else {
                return Err(closed());
            };
            let result = self.inner.write_all(buffer).await;
            buffer.clear();
            self.buffering = false;
            result?;
        }
        Ok(p.len())
    }

    /// Gives the reassembly buffer back to the pool. Later calls are no-ops.
    pub fn close(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.put(buffer);
        }
        self.buffering = false;
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    fn buffer_mut(&mut self) -> io::Result<&mut Vec<u8>> {
        self.buffer.as_mut().ok_or_else(closed)
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "chunk writer is closed")
}

impl<W> Drop for ChunkWriter<W> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.put(buffer);
        }
    }
}
