// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

#[derive(Debug, PartialEq, Eq)]
pub enum Line<'a> {
    /// Line content without its terminator.
    Data(&'a [u8]),
    /// A line over the size limit was dropped; carries the number of bytes discarded.
    TooLong(usize),
}

/// Newline-delimited reader with an upper bound on line length.
#[derive(Debug)]
pub struct LineScanner<R> {
    reader: R,
    buf: Vec<u8>,
    max_line_size: usize,
}

impl<R: AsyncBufRead + Unpin> LineScanner<R> {
    pub fn new(reader: R, max_line_size: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            max_line_size,
        }
    }

    /// Returns the next line, or `None` once the reader is exhausted.
    ///
    /// A final line without a trailing newline is still returned.
    pub async fn next_line(&mut self) -> io::Result<Option<Line<'_>>> {
        self.buf.clear();
        let mut discarded: Option<usize> = None;

        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if let Some(n) = discarded {
                    return Ok(Some(Line::TooLong(n)));
                }
                if self.buf.is_empty() {
                    return Ok(None);
                }
                break;
            }

            let newline = available.iter().position(|&b| b == b'\n');
            let take = newline.unwrap_or(available.len());

            match discarded.as_mut() {
                Some(n) => *n += take,
                None if self.buf.len() + take > self.max_line_size => {
                    discarded = Some(self.buf.len() + take);
                    self.buf.clear();
                }
                None => self.buf.extend_from_slice(&available[..take]),
            }

            if newline.is_some() {
                self.reader.consume(take + 1);
                if let Some(n) = discarded {
                    return Ok(Some(Line::TooLong(n)));
                }
                break;
            }
            self.reader.consume(take);
        }

        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        Ok(Some(Line::Data(&self.buf)))
    }
}
