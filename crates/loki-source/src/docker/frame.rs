// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Docker's multiplexed log stream format.
//!
//! Without a TTY, the Engine API interleaves stdout and stderr on a single
//! connection. Every frame starts with an 8-byte header: the stream type, three
//! zero bytes, and the payload size as a big-endian `u32`.

use crate::docker::chunk_writer::ChunkWriter;
use crate::docker::{DockerError, DOCKER_MAX_CHUNK_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

const HEADER_LEN: usize = 8;
const INITIAL_BUFFER_SIZE: usize = 32 * 1024;

/// Largest payload accepted in a single frame.
pub const MAX_FRAME_SIZE: usize = DOCKER_MAX_CHUNK_SIZE * 64 * 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamType {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
    /// Error reported by the daemon itself.
    SystemErr = 3,
}

impl TryFrom<u8> for StreamType {
    type Error = DockerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StreamType::Stdin),
            1 => Ok(StreamType::Stdout),
            2 => Ok(StreamType::Stderr),
            3 => Ok(StreamType::SystemErr),
            other => Err(DockerError::UnknownStream(other)),
        }
    }
}

/// Encodes `payload` as a single frame of `stream`.
pub fn encode_frame(stream: StreamType, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&[stream as u8, 0, 0, 0]);
    #[allow(clippy::cast_possible_truncation)]
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Splits a multiplexed stream into `stdout` and `stderr`, one write per frame.
///
/// Returns the number of payload bytes written once `reader` is exhausted. A
/// stream that ends in the middle of a frame is treated as exhausted.
pub async fn demux<R, O, E>(
    reader: &mut R,
    stdout: &mut ChunkWriter<O>,
    stderr: &mut ChunkWriter<E>,
) -> Result<u64, DockerError>
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut buf = vec![0u8; INITIAL_BUFFER_SIZE];
    let mut written: u64 = 0;

    loop {
        if read_full(reader, &mut header).await? < HEADER_LEN {
            return Ok(written);
        }

        let stream = StreamType::try_from(header[0])?;
        let size = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if size > MAX_FRAME_SIZE {
            return Err(DockerError::FrameTooLarge(size));
        }
        if size > buf.len() {
            buf.resize(size, 0);
        }

        let payload = &mut buf[..size];
        if read_full(reader, payload).await? < size {
            return Ok(written);
        }

        match stream {
            StreamType::Stdin | StreamType::Stdout => {
                stdout.write(payload).await?;
            }
            StreamType::Stderr => {
                stderr.write(payload).await?;
            }
            StreamType::SystemErr => {
                return Err(DockerError::Daemon(
                    String::from_utf8_lossy(payload).into_owned(),
                ));
            }
        }
        written += size as u64;
    }
}

/// Reads until `buf` is full or the reader is exhausted.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
