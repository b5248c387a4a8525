// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Splits `<timestamp> <content>` log lines.
//!
//! The timestamp must be RFC 3339 with optional fractional seconds (up to
//! nanoseconds) and a `Z` or numeric offset, which is what the Docker daemon
//! prefixes lines with when timestamps are requested.

use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("could not find timestamp in line")]
    MissingTimestamp,
    #[error("could not parse timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Parses the leading timestamp of `line` and returns it together with the
/// rest of the line after the first space.
///
/// The prefix is only borrowed for the duration of the parse and the returned
/// content is a sub-slice of `line`.
pub fn extract_ts_from_bytes(line: &[u8]) -> Result<(DateTime<Utc>, &[u8]), ParseError> {
    let space_idx = match line.iter().position(|&b| b == b' ') {
        Some(idx) if idx + 1 < line.len() => idx,
        _ => return Err(ParseError::MissingTimestamp),
    };

    let prefix = std::str::from_utf8(&line[..space_idx])
        .map_err(|e| ParseError::InvalidTimestamp(e.to_string()))?;
    let ts = parse_timestamp(prefix)?;
    Ok((ts, &line[space_idx + 1..]))
}

/// String flavour of [`extract_ts_from_bytes`].
pub fn extract_ts(line: &str) -> Result<(DateTime<Utc>, &str), ParseError> {
    let space_idx = match line.find(' ') {
        Some(idx) if idx + 1 < line.len() => idx,
        _ => return Err(ParseError::MissingTimestamp),
    };

    let ts = parse_timestamp(&line[..space_idx])?;
    Ok((ts, &line[space_idx + 1..]))
}

/// Parses an RFC 3339 timestamp with optional nanosecond precision.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ParseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| ParseError::InvalidTimestamp(format!("{value:?}: {e}")))
}
