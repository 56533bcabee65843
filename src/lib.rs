//! Polite listing-page watcher.
//!
//! Crawls a fixed list of listing pages one site at a time, keeps listings
//! whose price falls inside a configured band, records each listing once in
//! SQLite and sends a throttled alert for the ones first seen in this run.

pub mod app;
