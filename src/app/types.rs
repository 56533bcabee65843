use std::collections::VecDeque;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

#[derive(Debug, Parser, Clone)]
#[command(
    name = "pricewatch",
    version,
    about = "Watch listing pages, keep new listings inside a price band, alert once"
)]
pub struct Cli {
    #[arg(short, long, value_name = "FILE", default_value = "config.json")]
    pub config: String,

    #[arg(long, value_name = "FILE")]
    pub db: Option<String>,

    #[arg(long, value_name = "FILE")]
    pub export: Option<String>,

    #[arg(long, value_enum, default_value_t = FileFormatArg::Csv)]
    pub format: FileFormatArg,

    #[arg(long, default_value_t = false)]
    pub list: bool,

    #[arg(long, default_value_t = false)]
    pub dry_run_mail: bool,

    #[arg(long, value_name = "FILE", env = "PRICEWATCH_LOG_FILE")]
    pub log_file: Option<String>,

    #[arg(long, value_name = "UA")]
    pub user_agent: Option<String>,
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum FileFormatArg {
    Csv,
    Json,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataFormat {
    Csv,
    Json,
}

impl From<FileFormatArg> for DataFormat {
    fn from(value: FileFormatArg) -> Self {
        match value {
            FileFormatArg::Csv => DataFormat::Csv,
            FileFormatArg::Json => DataFormat::Json,
        }
    }
}

/// CSS selectors locating listings on one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selectors {
    pub listing_item: String,
    pub title: String,
    pub price: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSite {
    pub url: String,
    pub selectors: Selectors,
}

/// Inclusive `[min, max]` range a normalized price must fall in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBand {
    pub min: i64,
    pub max: i64,
}

impl PriceBand {
    pub fn contains(&self, price: i64) -> bool {
        self.min <= price && price <= self.max
    }
}

/// Title / price text / link triple read off a page, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub title: String,
    pub price_text: String,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub title: String,
    pub link: String,
    pub price: i64,
}

/// A page as handed back by the fetch capability.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Final URL after redirects; relative links resolve against it.
    pub url: String,
    pub status: u16,
    pub body: String,
}

#[derive(Debug)]
pub enum CrawlEvent {
    SiteParsed {
        url: String,
        candidates: usize,
        kept: usize,
        new: usize,
    },
    SiteFailed {
        url: String,
        reason: String,
    },
    Interrupted,
    Finished,
}

/// Running totals folded from [`CrawlEvent`]s.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub sites_parsed: usize,
    pub sites_failed: usize,
    pub candidates: usize,
    pub kept: usize,
    pub new: usize,
    pub interrupted: bool,
    pub done: bool,
    pub failures: VecDeque<String>,
}

impl RunSummary {
    pub fn apply(&mut self, event: CrawlEvent) {
        match event {
            CrawlEvent::SiteParsed {
                candidates,
                kept,
                new,
                ..
            } => {
                self.sites_parsed += 1;
                self.candidates += candidates;
                self.kept += kept;
                self.new += new;
            }
            CrawlEvent::SiteFailed { url, reason } => {
                self.sites_failed += 1;
                self.push_failure(format!("{url}: {reason}"));
            }
            CrawlEvent::Interrupted => self.interrupted = true,
            CrawlEvent::Finished => self.done = true,
        }
    }

    fn push_failure(&mut self, failure: String) {
        self.failures.push_front(failure);
        while self.failures.len() > 10 {
            self.failures.pop_back();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_band_is_inclusive() {
        let band = PriceBand {
            min: 1000,
            max: 2000,
        };
        assert!(band.contains(1000));
        assert!(band.contains(2000));
        assert!(!band.contains(999));
        assert!(!band.contains(2001));
    }

    #[test]
    fn summary_keeps_the_ten_latest_failures() {
        let mut summary = RunSummary::default();
        for i in 0..12 {
            summary.apply(CrawlEvent::SiteFailed {
                url: format!("https://s{i}.example/"),
                reason: "timeout".to_string(),
            });
        }
        summary.apply(CrawlEvent::Finished);

        assert_eq!(summary.sites_failed, 12);
        assert_eq!(summary.failures.len(), 10);
        assert!(summary.failures[0].starts_with("https://s11.example/"));
        assert!(summary.done);
    }
}
