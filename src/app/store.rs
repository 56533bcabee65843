//! Persistent, deduplicating listing store on SQLite.
//!
//! Identity is the sanitized `(title, link)` pair. Each insert is a single
//! `INSERT OR IGNORE` statement committed before the call returns, so an
//! abrupt exit never leaves a half-written listing behind.

use std::str::FromStr;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::error::StoreError;
use super::price::sanitize;
use super::types::Listing;

pub struct ListingStore {
    pool: SqlitePool,
    session: Mutex<Vec<Listing>>,
}

#[derive(Debug, FromRow)]
struct ListingRow {
    title: String,
    link: String,
    price: i64,
}

impl From<ListingRow> for Listing {
    fn from(row: ListingRow) -> Self {
        Listing {
            title: row.title,
            link: row.link,
            price: row.price,
        }
    }
}

/// A stored listing together with when it was first seen.
#[derive(Debug, Clone, FromRow)]
pub struct StoredListing {
    pub title: String,
    pub link: String,
    pub price: i64,
    pub first_seen_at: String,
}

impl ListingStore {
    /// Opens (creating if needed) the database file at `path`.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        info!(path, "connecting to listing store");
        Self::connect(options, path).await
    }

    /// Ephemeral store, mainly for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let open_err = |source| StoreError::Open {
            path: ":memory:".to_string(),
            source,
        };
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(open_err)?;
        Self::connect(options, ":memory:").await
    }

    async fn connect(options: SqliteConnectOptions, path: &str) -> Result<Self, StoreError> {
        let open_err = |source| StoreError::Open {
            path: path.to_string(),
            source,
        };
        // One connection: a single writer, and `:memory:` stays one database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(open_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS listings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                link TEXT NOT NULL,
                title_key TEXT NOT NULL,
                link_key TEXT NOT NULL,
                price INTEGER NOT NULL,
                first_seen_at TEXT NOT NULL,
                UNIQUE(title_key, link_key)
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(open_err)?;
        debug!("listings table created or already exists");

        let missing = missing_columns(&pool).await.map_err(open_err)?;
        if !missing.is_empty() {
            pool.close().await;
            return Err(StoreError::IncompatibleSchema {
                path: path.to_string(),
                missing,
            });
        }

        Ok(Self {
            pool,
            session: Mutex::new(Vec::new()),
        })
    }

    /// Stores the listing unless its sanitized key already exists.
    ///
    /// Returns `Ok(true)` only when this call created the record. The title is
    /// stored in sanitized form; the link is kept as the absolute URL.
    pub async fn insert(&self, title: &str, link: &str, price: i64) -> Result<bool, StoreError> {
        let title_key = sanitize(title);
        let link_key = sanitize(link);
        let link = link.trim();
        if title_key.is_empty() || link_key.is_empty() {
            debug!(title, link, "refusing listing with empty identity");
            return Ok(false);
        }

        let mut session = self.session.lock().await;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO listings (title, link, title_key, link_key, price, first_seen_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&title_key)
        .bind(link)
        .bind(&title_key)
        .bind(&link_key)
        .bind(price)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }
        info!(title = %title_key, price, link, "new listing added");
        session.push(Listing {
            title: title_key,
            link: link.to_string(),
            price,
        });
        Ok(true)
    }

    /// Starts a new run: forgets which records the previous run created.
    pub async fn begin_session(&self) {
        self.session.lock().await.clear();
    }

    /// Records created during the current run, in insertion order.
    pub async fn newly_inserted(&self) -> Vec<Listing> {
        self.session.lock().await.clone()
    }

    /// Every stored record, in insertion order.
    pub async fn fetch_all(&self) -> Result<Vec<Listing>, StoreError> {
        let rows = sqlx::query_as::<_, ListingRow>(
            "SELECT title, link, price FROM listings ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Listing::from).collect())
    }

    /// Every stored record with its first-seen timestamp, in insertion order.
    pub async fn fetch_all_detailed(&self) -> Result<Vec<StoredListing>, StoreError> {
        let rows = sqlx::query_as::<_, StoredListing>(
            "SELECT title, link, price, first_seen_at FROM listings ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM listings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Closes the pool. Safe to call more than once.
    pub async fn close(&self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!("listing store closed");
        }
    }
}

const REQUIRED_COLUMNS: [&str; 6] = [
    "title",
    "link",
    "title_key",
    "link_key",
    "price",
    "first_seen_at",
];

/// Columns of an existing `listings` table that inserts rely on but are absent.
async fn missing_columns(pool: &SqlitePool) -> Result<Vec<String>, sqlx::Error> {
    let present: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info('listings')")
        .fetch_all(pool)
        .await?;
    Ok(REQUIRED_COLUMNS
        .iter()
        .filter(|col| !present.iter().any(|p| p.as_str() == **col))
        .map(|col| col.to_string())
        .collect())
}
