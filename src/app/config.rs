//! Typed configuration, checked once before any network activity.

use std::fs;
use std::time::Duration;

use serde::Deserialize;

use super::error::ConfigError;
use super::extract::parse_selector;
use super::gate::well_formed;
use super::types::{PriceBand, TargetSite};

pub const MAX_DELAY_MS: u64 = 60_000;
pub const MAX_THROTTLE_SECS: u64 = 366 * 24 * 3_600;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub email_settings: EmailSettings,
    pub search_config: SearchConfig,
    pub urls: Vec<TargetSite>,
    #[serde(default)]
    pub crawl_settings: CrawlSettings,
    #[serde(default)]
    pub notify_settings: NotifySettings,
    #[serde(default)]
    pub database: DatabaseSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailSettings {
    pub sender: String,
    pub recipient: String,
    /// HTTP mail relay receiving `{from, to, subject, html}`.
    pub endpoint: String,
    /// Environment variable holding the relay bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    pub price_range: PriceBand,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlSettings {
    pub user_agent: String,
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            user_agent: "pricewatch".to_string(),
            delay_min_ms: 2_000,
            delay_max_ms: 5_000,
            request_timeout_secs: 30,
        }
    }
}

impl CrawlSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub throttle_secs: u64,
    /// Start the throttle window at process start, suppressing alerts
    /// during the first window.
    pub throttle_from_start: bool,
}

impl NotifySettings {
    pub fn throttle_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.throttle_secs.min(MAX_THROTTLE_SECS) as i64)
    }
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            throttle_secs: 3_600,
            throttle_from_start: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "listings.db".to_string(),
        }
    }
}

fn default_token_env() -> String {
    "PRICEWATCH_MAIL_TOKEN".to_string()
}

impl Settings {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, path: &str) -> Result<Self, ConfigError> {
        let settings: Settings =
            serde_json::from_str(text).map_err(|source| ConfigError::Parse {
                path: path.to_string(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn price_band(&self) -> PriceBand {
        self.search_config.price_range
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let band = self.price_band();
        if band.min >= band.max {
            return Err(ConfigError::InvalidPriceBand {
                min: band.min,
                max: band.max,
            });
        }

        if self.urls.is_empty() {
            return Err(ConfigError::NoSites);
        }
        for (index, site) in self.urls.iter().enumerate() {
            validate_site(index, site)?;
        }

        let crawl = &self.crawl_settings;
        if crawl.user_agent.trim().is_empty() {
            return Err(invalid("crawl_settings.user_agent", "must not be empty"));
        }
        if crawl.delay_min_ms > crawl.delay_max_ms {
            return Err(invalid(
                "crawl_settings.delay_min_ms",
                "must not exceed delay_max_ms",
            ));
        }
        if crawl.delay_max_ms > MAX_DELAY_MS {
            return Err(invalid(
                "crawl_settings.delay_max_ms",
                format!("must be at most {MAX_DELAY_MS}"),
            ));
        }
        if crawl.request_timeout_secs == 0 {
            return Err(invalid(
                "crawl_settings.request_timeout_secs",
                "must be positive",
            ));
        }

        if self.notify_settings.throttle_secs > MAX_THROTTLE_SECS {
            return Err(invalid(
                "notify_settings.throttle_secs",
                format!("must be at most {MAX_THROTTLE_SECS}"),
            ));
        }

        let email = &self.email_settings;
        if email.sender.trim().is_empty() {
            return Err(invalid("email_settings.sender", "must not be empty"));
        }
        if email.recipient.trim().is_empty() {
            return Err(invalid("email_settings.recipient", "must not be empty"));
        }
        if well_formed(&email.endpoint).is_none() {
            return Err(invalid(
                "email_settings.endpoint",
                "must be an absolute http(s) URL",
            ));
        }

        if self.database.path.trim().is_empty() {
            return Err(invalid("database.path", "must not be empty"));
        }
        Ok(())
    }
}

fn validate_site(index: usize, site: &TargetSite) -> Result<(), ConfigError> {
    let site_err = |reason: String| ConfigError::InvalidSite { index, reason };

    if site.url.trim().is_empty() {
        return Err(site_err("url is empty".to_string()));
    }
    let selectors = [
        ("listing_item", &site.selectors.listing_item),
        ("title", &site.selectors.title),
        ("price", &site.selectors.price),
    ];
    for (name, raw) in selectors {
        if raw.trim().is_empty() {
            return Err(site_err(format!("selector `{name}` is empty")));
        }
        parse_selector(raw).map_err(|err| site_err(format!("selector `{name}`: {err}")))?;
    }
    Ok(())
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidSetting {
        key,
        reason: reason.into(),
    }
}
