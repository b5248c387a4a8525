// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client for the Cloudflare Logpull `logs/received` endpoint.

use crate::cloudflare::CloudflareError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.cloudflare.com/client/v4";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Iterates over the raw JSON lines of one Logpull response.
#[async_trait]
pub trait LogIterator: Send {
    /// Next line, `Ok(None)` once the response is exhausted.
    async fn next(&mut self) -> Result<Option<Vec<u8>>, CloudflareError>;
}

#[async_trait]
pub trait LogpullClient: Send + Sync {
    /// Requests the logs received by the edge in `[start, end)`.
    async fn logpull_received(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Box<dyn LogIterator>, CloudflareError>;
}

/// Builds a client from an API token, a zone ID and the fields to request.
pub type ClientFactory = Arc<
    dyn Fn(&str, &str, &[String]) -> Result<Arc<dyn LogpullClient>, CloudflareError>
        + Send
        + Sync,
>;

/// Factory producing [`HttpLogpullClient`]s against `base_url`.
pub fn http_client_factory(base_url: impl Into<String>) -> ClientFactory {
    let base_url = base_url.into();
    Arc::new(move |api_token, zone_id, fields| {
        let client: Arc<dyn LogpullClient> = Arc::new(HttpLogpullClient::new(
            api_token,
            zone_id,
            fields.to_vec(),
            base_url.clone(),
        )?);
        Ok(client)
    })
}

#[derive(Debug, Clone)]
pub struct HttpLogpullClient {
    client: reqwest::Client,
    api_token: String,
    zone_id: String,
    fields: String,
    base_url: String,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    errors: Vec<ApiErrorEntry>,
}

#[derive(Deserialize)]
struct ApiErrorEntry {
    message: String,
}

impl HttpLogpullClient {
    pub fn new(
        api_token: &str,
        zone_id: &str,
        fields: Vec<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, CloudflareError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            api_token: api_token.to_string(),
            zone_id: zone_id.to_string(),
            fields: fields.join(","),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl LogpullClient for HttpLogpullClient {
    async fn logpull_received(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Box<dyn LogIterator>, CloudflareError> {
        let url = format!("{}/zones/{}/logs/received", self.base_url, self.zone_id);
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_token)
            .query(&[
                ("start", start.to_rfc3339_opts(SecondsFormat::Nanos, true)),
                ("end", end.to_rfc3339_opts(SecondsFormat::Nanos, true)),
                ("fields", self.fields.clone()),
                ("timestamps", "unixnano".to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(CloudflareError::Api {
                status: status.as_u16(),
                message: api_error_message(&body),
            });
        }

        Ok(Box::new(HttpLogIterator {
            stream: response.bytes_stream().boxed(),
            buf: Vec::new(),
            done: false,
        }))
    }
}

fn api_error_message(body: &[u8]) -> String {
    match serde_json::from_slice::<ApiErrorBody>(body) {
        Ok(parsed) if !parsed.errors.is_empty() => parsed
            .errors
            .into_iter()
            .map(|e| e.message)
            .collect::<Vec<_>>()
            .join("; "),
        _ => String::from_utf8_lossy(body).trim().to_string(),
    }
}

struct HttpLogIterator {
    stream: BoxStream<'static, reqwest::Result<Bytes>>,
    buf: Vec<u8>,
    done: bool,
}

#[async_trait]
impl LogIterator for HttpLogIterator {
    async fn next(&mut self) -> Result<Option<Vec<u8>>, CloudflareError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(line));
            }
            if self.done {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(&mut self.buf)));
            }
            match self.stream.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(CloudflareError::Http(e)),
                None => self.done = true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    async fn collect(mut it: Box<dyn LogIterator>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = it.next().await.unwrap() {
            lines.push(String::from_utf8(line).unwrap());
        }
        lines
    }

    #[tokio::test]
    async fn test_logpull_received() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/zones/zone-1/logs/received")
            .match_header("authorization", "Bearer secret")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("start".into(), "2023-12-09T12:00:00.000000000Z".into()),
                Matcher::UrlEncoded("end".into(), "2023-12-09T12:01:00.000000000Z".into()),
                Matcher::UrlEncoded("fields".into(), "ClientIP,RayID".into()),
                Matcher::UrlEncoded("timestamps".into(), "unixnano".into()),
            ]))
            .with_status(200)
            .with_body("{\"RayID\":\"1\"}\n\n{\"RayID\":\"2\"}\n{\"RayID\":\"3\"}")
            .expect(1)
            .create_async()
            .await;

        let client = HttpLogpullClient::new(
            "secret",
            "zone-1",
            vec!["ClientIP".to_string(), "RayID".to_string()],
            server.url(),
        )
        .unwrap();
        let start = DateTime::parse_from_rfc3339("2023-12-09T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let it = client
            .logpull_received(start, start + chrono::Duration::minutes(1))
            .await
            .unwrap();

        assert_eq!(
            collect(it).await,
            vec![r#"{"RayID":"1"}"#, r#"{"RayID":"2"}"#, r#"{"RayID":"3"}"#]
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_logpull_error_message() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/zones/zone-1/logs/received")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(
                r#"{"success":false,"errors":[{"code":1010,"message":"bad query: error parsing time: invalid time range: too early: logs older than 168h0m0s are not available"}],"messages":[],"result":null}"#,
            )
            .create_async()
            .await;

        let factory = http_client_factory(server.url());
        let client = factory("secret", "zone-1", &[]).unwrap();
        let now = Utc::now();
        let err = match client.logpull_received(now, now).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(
            err.to_string(),
            "HTTP status 400: bad query: error parsing time: invalid time range: too early: logs older than 168h0m0s are not available"
        );
    }

    #[test]
    fn test_error_message_fallback() {
        assert_eq!(api_error_message(b" upstream timeout \n"), "upstream timeout");
    }
}
