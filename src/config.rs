use crate::api_client::Credentials;
use crate::day_key::{DayKeyNormalizer, DEFAULT_TIME_ZONE};
use crate::error::Error;
use crate::report::{PollOptions, DEFAULT_MAX_RESOLVE_ATTEMPTS};
use chrono::TimeDelta;
use clap::Args as ClapArgs;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

const DEFAULT_API_URL: &str = "https://api.appstoreconnect.apple.com";
const GROUPS_FILE: &str = "./secrets/app_store.json";
const OUTPUT_DIR: &str = "./";
const PARALLELISM: &str = "4";
const REQUEST_TIMEOUT_SECS: &str = "60";
const SEGMENT_TTL_SECS: &str = "900";

#[derive(ClapArgs, Debug, Clone)]
pub struct Config {
    #[arg(long, default_value = DEFAULT_API_URL, env = "API_URL")]
    pub(crate) api_url: String,

    /// Used for groups that do not carry their own token.
    #[arg(long, env = "API_TOKEN")]
    pub(crate) api_token: Option<String>,

    #[arg(long, default_value = GROUPS_FILE, env = "GROUPS_FILE")]
    pub(crate) groups_file: String,

    #[arg(long, default_value = OUTPUT_DIR, env = "OUTPUT_DIR")]
    pub(crate) output_dir: String,

    /// Number of apps polled at the same time.
    #[arg(long, default_value = PARALLELISM, env = "POLL_PARALLELISM")]
    pub(crate) parallelism: usize,

    #[arg(long, default_value = REQUEST_TIMEOUT_SECS, env = "REQUEST_TIMEOUT_SECS")]
    pub(crate) request_timeout_secs: u64,

    /// How long a listed segment download location is trusted.
    #[arg(long, default_value = SEGMENT_TTL_SECS, env = "SEGMENT_TTL_SECS")]
    pub(crate) segment_ttl_secs: i64,
}

/// One entry of the groups file.
#[derive(Deserialize, Debug, Clone)]
pub struct GroupConfig {
    pub api_token: Option<String>,

    #[serde(default = "default_time_zone")]
    pub time_zone: String,

    #[serde(alias = "account_ids")]
    pub apps: Vec<AppConfig>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub app_id: Option<String>,
    pub app_name: Option<String>,
    pub bundle_id: Option<String>,
}

impl AppConfig {
    /// Name used in logs and summaries.
    pub fn display_name(&self) -> &str {
        self.app_name
            .as_deref()
            .or(self.app_id.as_deref())
            .or(self.bundle_id.as_deref())
            .unwrap_or("<unnamed app>")
    }
}

fn default_time_zone() -> String {
    DEFAULT_TIME_ZONE.to_string()
}

impl Config {
    /// Reads `group` out of the JSON groups file.
    pub fn load_group(&self, group: &str) -> Result<GroupConfig, Error> {
        let content = fs::read_to_string(&self.groups_file)?;
        let mut groups: HashMap<String, GroupConfig> = serde_json::from_str(&content)?;

        groups.remove(group).ok_or_else(|| Error::GroupNotFound {
            group: group.to_string(),
            path: self.groups_file.clone(),
        })
    }

    /// Builds the per-group credential context; the group's own token wins.
    pub fn credentials(&self, group_name: &str, group: &GroupConfig) -> Result<Credentials, Error> {
        let token = group
            .api_token
            .clone()
            .or_else(|| self.api_token.clone())
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| Error::MissingToken {
                group: group_name.to_string(),
            })?;

        Ok(Credentials {
            api_url: self.api_url.clone(),
            token,
            timeout: Duration::from_secs(self.request_timeout_secs),
        })
    }

    pub fn poll_options(&self) -> PollOptions {
        PollOptions {
            segment_ttl: TimeDelta::seconds(self.segment_ttl_secs),
            max_resolve_attempts: DEFAULT_MAX_RESOLVE_ATTEMPTS,
        }
    }
}

impl GroupConfig {
    pub fn normalizer(&self) -> Result<DayKeyNormalizer, Error> {
        DayKeyNormalizer::from_zone_name(&self.time_zone)
    }
}

#[cfg(test)]
pub(crate) fn test_config(groups_file: &str, output_dir: &str) -> Config {
    Config {
        api_url: "https://api.example.com".to_string(),
        api_token: Some("env_token".to_string()),
        groups_file: groups_file.to_string(),
        output_dir: output_dir.to_string(),
        parallelism: 2,
        request_timeout_secs: 5,
        segment_ttl_secs: 900,
    }
}
