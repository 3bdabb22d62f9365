use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::prober::ProbeStrategy;

pub struct Config {
    pub bind_addr: String,
    pub booru_api_url: String,
    pub site_url: String,
    /// `None` disables the remote tag lookup; tags are classified locally.
    pub tag_api_url: Option<String>,
    pub page_size: u32,
    pub max_pages: u32,
    pub count_strategy: ProbeStrategy,
    pub request_timeout: Duration,
    pub tag_lookup_timeout: Duration,
    pub allowed_media_hosts: Vec<String>,
    pub user_agent: String,
    pub log_level: tracing::Level,
}

impl Config {
    pub fn from_env() -> Result<Config> {
        dotenv().ok(); // Load .env file if present
        let tag_api_url = get_env_or_default("TAG_API_URL", "https://r34-json.herokuapp.com");
        let max_pages: u32 = get_env_parsed("MAX_PAGES", 1000)?;
        if max_pages == u32::MAX {
            anyhow::bail!("MAX_PAGES must be below {}", u32::MAX);
        }
        Ok(Config {
            bind_addr: get_env_or_default("BIND_ADDR", "0.0.0.0:3000"),
            booru_api_url: get_env_or_default("BOORU_API_URL", "https://api.rule34.xxx/index.php"),
            site_url: get_env_or_default("SITE_URL", "https://rule34.xxx"),
            tag_api_url: Some(tag_api_url).filter(|url| !url.trim().is_empty()),
            page_size: get_env_parsed("PAGE_SIZE", 42)?,
            max_pages,
            count_strategy: get_env_parsed("COUNT_STRATEGY", ProbeStrategy::BinarySearch)?,
            request_timeout: Duration::from_secs(get_env_parsed("REQUEST_TIMEOUT_SECS", 30)?),
            tag_lookup_timeout: Duration::from_secs(get_env_parsed("TAG_LOOKUP_TIMEOUT_SECS", 5)?),
            allowed_media_hosts: get_env_or_default("ALLOWED_MEDIA_HOSTS", "rule34.xxx")
                .split(',')
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            user_agent: get_env_or_default(
                "USER_AGENT",
                "Mozilla/5.0 (compatible; PostFetcher/1.0)",
            ),
            log_level: get_env_parsed("LOG_LEVEL", tracing::Level::INFO)?,
        })
    }

    /// Config pointed at a single upstream base url, remote tag lookup off.
    /// Handy for tests and local mocks.
    pub fn for_upstream(base_url: &str) -> Config {
        let host = reqwest::Url::parse(base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        Config {
            bind_addr: "127.0.0.1:0".to_string(),
            booru_api_url: format!("{}/index.php", base_url.trim_end_matches('/')),
            site_url: base_url.trim_end_matches('/').to_string(),
            tag_api_url: None,
            page_size: 42,
            max_pages: 1000,
            count_strategy: ProbeStrategy::BinarySearch,
            request_timeout: Duration::from_secs(5),
            tag_lookup_timeout: Duration::from_secs(5),
            allowed_media_hosts: vec![host],
            user_agent: "boorugate-test/0.1".to_string(),
            log_level: tracing::Level::INFO,
        }
    }
}

fn get_env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_env_parsed<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for environment variable {key}: {value:?}")),
        Err(_) => Ok(default),
    }
}
