//! Error taxonomy for the watch pipeline.
//!
//! Only [`ConfigError`] and store initialization failures are fatal; every
//! other kind is isolated by the caller and logged so that one bad URL, site,
//! item or dispatch cannot abort the run.

use thiserror::Error;

/// Fatal problems found while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid price range: min ({min}) must be less than max ({max})")]
    InvalidPriceBand { min: i64, max: i64 },

    #[error("no sites configured")]
    NoSites,

    #[error("site #{index}: {reason}")]
    InvalidSite { index: usize, reason: String },

    #[error("invalid setting `{key}`: {reason}")]
    InvalidSetting { key: &'static str, reason: String },

    #[error("no valid URLs provided or scraping disallowed")]
    NoAdmittedUrls,
}

/// Why a URL was kept out of the admitted set.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid URL format: {url}")]
    MalformedUrl { url: String },

    #[error("robots.txt unavailable for {host}: {source}")]
    RobotsUnavailable {
        host: String,
        #[source]
        source: FetchError,
    },

    #[error("URL is disallowed by robots.txt: {url} (rule `{rule}`)")]
    Disallowed { url: String, rule: String },
}

/// Transport failures while retrieving a page.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },
}

/// Per-item extraction problems. These never escape the extractor.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unparsable selector `{selector}`")]
    Selector { selector: String },

    #[error("listing item has no usable link")]
    MissingLink,
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot open listing store at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("listing store at {path} has an incompatible `listings` table, missing columns: {}", missing.join(", "))]
    IncompatibleSchema { path: String, missing: Vec<String> },

    #[error("listing store query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// Notification dispatch failures.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("mail relay request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("mail relay rejected message with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Errors that end the process with a non-zero exit code.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cannot build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("export failed: {0}")]
    Export(#[from] std::io::Error),
}
