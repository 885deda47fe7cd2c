use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::session::DEFAULT_BASE_URL;

pub const DEFAULT_USER_AGENT: &str = "warstool/0.1";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_POLITENESS_MS: u64 = 2_000;
pub const DEFAULT_MAX_RETRIES: usize = 2;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WarsConfig {
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub crawl: CrawlSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SiteSection {
    pub base_url: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CrawlSection {
    pub timeout_ms: Option<u64>,
    pub politeness_ms: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
}

impl WarsConfig {
    /// Resolve the site base URL: env SHOGIWARS_BASE_URL > config > default.
    pub fn base_url(&self) -> String {
        env_string("SHOGIWARS_BASE_URL")
            .or_else(|| self.site.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string()
    }

    /// Resolve user agent: env SHOGIWARS_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_string("SHOGIWARS_USER_AGENT")
            .or_else(|| self.site.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn timeout_ms(&self) -> u64 {
        env_parsed("SHOGIWARS_HTTP_TIMEOUT_MS")
            .or(self.crawl.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    /// Minimum delay between consecutive page requests.
    pub fn politeness_ms(&self) -> u64 {
        env_parsed("SHOGIWARS_POLITENESS_MS")
            .or(self.crawl.politeness_ms)
            .unwrap_or(DEFAULT_POLITENESS_MS)
    }

    pub fn max_retries(&self) -> usize {
        env_parsed("SHOGIWARS_HTTP_RETRIES")
            .or(self.crawl.max_retries)
            .unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn retry_delay_ms(&self) -> u64 {
        env_parsed("SHOGIWARS_HTTP_RETRY_DELAY_MS")
            .or(self.crawl.retry_delay_ms)
            .unwrap_or(DEFAULT_RETRY_DELAY_MS)
    }
}

/// Load and parse a WarsConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<WarsConfig> {
    if !config_path.exists() {
        return Ok(WarsConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: WarsConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|value| value.parse::<T>().ok())
}
