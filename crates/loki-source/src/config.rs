// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::cloudflare::fields::FieldsType;
use crate::docker::client::DEFAULT_DOCKER_HOST;
use crate::entry::LabelSet;
use crate::{cloudflare, docker};
use anyhow::{anyhow, Context};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_DATA_PATH: &str = "./data";
const DEFAULT_DOCKER_REFRESH_INTERVAL_SECS: u64 = 60;
const DEFAULT_CLOUDFLARE_WORKERS: usize = 3;
const DEFAULT_CLOUDFLARE_PULL_RANGE_SECS: u64 = 60;

/// Settings of the Cloudflare source, present when both the API token and the
/// zone ID are set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudflareConfig {
    pub api_token: String,
    pub zone_id: String,
    pub workers: usize,
    pub pull_range: Duration,
    pub fields_type: FieldsType,
    pub additional_fields: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    /// Directory holding one subdirectory per source for its positions file.
    pub data_path: PathBuf,
    /// Labels added to every entry.
    pub labels: LabelSet,
    pub use_docker: bool,
    pub docker_host: String,
    pub docker_refresh_interval: Duration,
    pub cloudflare: Option<CloudflareConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_path: PathBuf::from(DEFAULT_DATA_PATH),
            labels: LabelSet::new(),
            use_docker: true,
            docker_host: DEFAULT_DOCKER_HOST.to_string(),
            docker_refresh_interval: Duration::from_secs(DEFAULT_DOCKER_REFRESH_INTERVAL_SECS),
            cloudflare: None,
        }
    }
}

/// Parses `key:value` pairs separated by spaces or commas. Malformed pairs are
/// ignored.
pub fn parse_labels(value: &str) -> LabelSet {
    value
        .replace(',', " ")
        .split_whitespace()
        .filter_map(|kv| {
            let (k, v) = kv.split_once(':')?;
            (!k.is_empty() && !v.is_empty()).then(|| (k.to_string(), v.to_string()))
        })
        .collect()
}

fn env_parse<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .with_context(|| format!("invalid value {value:?} for {name}")),
        _ => Ok(default),
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let log_level = env::var("LOKI_SOURCE_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|_| "info".to_string());
        let data_path = env_non_empty("LOKI_SOURCE_DATA_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_PATH));
        let labels = env::var("LOKI_SOURCE_LABELS")
            .map(|val| parse_labels(&val))
            .unwrap_or_default();
        let use_docker = env::var("LOKI_SOURCE_USE_DOCKER")
            .map(|val| val.to_lowercase() != "false")
            .unwrap_or(true);
        let docker_host =
            env_non_empty("DOCKER_HOST").unwrap_or_else(|| DEFAULT_DOCKER_HOST.to_string());
        let docker_refresh_interval = Duration::from_secs(env_parse(
            "LOKI_SOURCE_DOCKER_REFRESH_INTERVAL",
            DEFAULT_DOCKER_REFRESH_INTERVAL_SECS,
        )?);

        let cloudflare = match (
            env_non_empty("CLOUDFLARE_API_TOKEN"),
            env_non_empty("CLOUDFLARE_ZONE_ID"),
        ) {
            (Some(api_token), Some(zone_id)) => Some(CloudflareConfig {
                api_token,
                zone_id,
                workers: env_parse("CLOUDFLARE_WORKERS", DEFAULT_CLOUDFLARE_WORKERS)?,
                pull_range: Duration::from_secs(env_parse(
                    "CLOUDFLARE_PULL_RANGE",
                    DEFAULT_CLOUDFLARE_PULL_RANGE_SECS,
                )?),
                fields_type: env_non_empty("CLOUDFLARE_FIELDS_TYPE")
                    .map(|val| val.to_lowercase().parse::<FieldsType>())
                    .transpose()?
                    .unwrap_or_default(),
                additional_fields: env::var("CLOUDFLARE_ADDITIONAL_FIELDS")
                    .map(|val| {
                        val.split(',')
                            .map(str::trim)
                            .filter(|f| !f.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            }),
            (None, None) => None,
            _ => {
                return Err(anyhow!(
                    "CLOUDFLARE_API_TOKEN and CLOUDFLARE_ZONE_ID must be set together"
                ))
            }
        };

        let config = Self {
            log_level,
            data_path,
            labels,
            use_docker,
            docker_host,
            docker_refresh_interval,
            cloudflare,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            ));
        }
        if self.docker_refresh_interval.is_zero() {
            return Err(anyhow!("LOKI_SOURCE_DOCKER_REFRESH_INTERVAL must be greater than 0"));
        }
        if self.use_docker {
            self.docker_arguments(Vec::new())
                .validate()
                .context("invalid Docker configuration")?;
        }
        if let Some(args) = self.cloudflare_arguments() {
            args.validate().context("invalid Cloudflare configuration")?;
        }
        Ok(())
    }

    pub fn docker_arguments(&self, targets: Vec<LabelSet>) -> docker::Arguments {
        docker::Arguments {
            host: self.docker_host.clone(),
            targets,
            labels: self.labels.clone(),
            refresh_interval: self.docker_refresh_interval,
            ..docker::Arguments::default()
        }
    }

    pub fn cloudflare_arguments(&self) -> Option<cloudflare::Arguments> {
        self.cloudflare.as_ref().map(|cf| cloudflare::Arguments {
            api_token: cf.api_token.clone(),
            zone_id: cf.zone_id.clone(),
            labels: self.labels.clone(),
            workers: cf.workers,
            pull_range: cf.pull_range,
            fields_type: cf.fields_type,
            additional_fields: cf.additional_fields.clone(),
            ..cloudflare::Arguments::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "LOKI_SOURCE_LOG_LEVEL",
        "LOKI_SOURCE_DATA_PATH",
        "LOKI_SOURCE_LABELS",
        "LOKI_SOURCE_USE_DOCKER",
        "DOCKER_HOST",
        "LOKI_SOURCE_DOCKER_REFRESH_INTERVAL",
        "CLOUDFLARE_API_TOKEN",
        "CLOUDFLARE_ZONE_ID",
        "CLOUDFLARE_WORKERS",
        "CLOUDFLARE_PULL_RANGE",
        "CLOUDFLARE_FIELDS_TYPE",
        "CLOUDFLARE_ADDITIONAL_FIELDS",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = Config::from_env().unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.data_path, PathBuf::from("./data"));
        assert!(config.use_docker);
        assert_eq!(config.docker_host, "unix:///var/run/docker.sock");
        assert_eq!(config.docker_refresh_interval, Duration::from_secs(60));
        assert!(config.cloudflare.is_none());
    }

    #[test]
    #[serial]
    fn test_cloudflare_from_env() {
        clear_env();
        env::set_var("CLOUDFLARE_API_TOKEN", "token");
        env::set_var("CLOUDFLARE_ZONE_ID", "zone");
        env::set_var("CLOUDFLARE_WORKERS", "5");
        env::set_var("CLOUDFLARE_PULL_RANGE", "30");
        env::set_var("CLOUDFLARE_FIELDS_TYPE", "Extended");
        env::set_var("CLOUDFLARE_ADDITIONAL_FIELDS", "BotScore, WAFFlags,");
        env::set_var("LOKI_SOURCE_LABELS", "job:cloudflare,env:prod");

        let config = Config::from_env().unwrap();
        let cf = config.cloudflare.clone().unwrap();
        assert_eq!(cf.workers, 5);
        assert_eq!(cf.pull_range, Duration::from_secs(30));
        assert_eq!(cf.fields_type, FieldsType::Extended);
        assert_eq!(cf.additional_fields, vec!["BotScore", "WAFFlags"]);

        let args = config.cloudflare_arguments().unwrap();
        assert_eq!(args.labels.get("job"), Some("cloudflare"));
        assert_eq!(args.labels.get("env"), Some("prod"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_env() {
        clear_env();
        env::set_var("CLOUDFLARE_API_TOKEN", "token");
        assert!(Config::from_env().is_err());

        env::set_var("CLOUDFLARE_ZONE_ID", "zone");
        env::set_var("CLOUDFLARE_WORKERS", "0");
        assert!(Config::from_env().is_err());

        env::set_var("CLOUDFLARE_WORKERS", "many");
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("CLOUDFLARE_WORKERS"));

        env::remove_var("CLOUDFLARE_WORKERS");
        env::set_var("CLOUDFLARE_FIELDS_TYPE", "everything");
        assert!(Config::from_env().is_err());
        clear_env();

        env::set_var("LOKI_SOURCE_LOG_LEVEL", "loud");
        assert!(Config::from_env().is_err());
        clear_env();

        env::set_var("DOCKER_HOST", "ftp://docker");
        assert!(Config::from_env().is_err());
        env::set_var("LOKI_SOURCE_USE_DOCKER", "false");
        assert!(Config::from_env().is_ok());
        clear_env();
    }

    #[test]
    fn test_parse_labels() {
        let labels = parse_labels("job:docker, env:prod team:infra bad :x");
        assert_eq!(labels.len(), 3);
        assert_eq!(labels.get("team"), Some("infra"));
    }
}
