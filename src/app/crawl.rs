//! Sequential, one-site-at-a-time crawl.
//!
//! [`CrawlScheduler`] is a pull-based state machine:
//! `Idle -> Fetching(i) -> Parsing(i) -> Advancing -> Fetching(i + 1) | Done`.
//! The crawl loop asks it for the next site, performs the fetch itself and
//! reports the outcome back, so at most one fetch is ever in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use super::config::MAX_DELAY_MS;
use super::error::FetchError;
use super::extract::{Rejection, extract, screen};
use super::fetch::PageFetcher;
use super::store::ListingStore;
use super::types::{Candidate, CrawlEvent, FetchedPage, PriceBand, TargetSite};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlState {
    Idle,
    Fetching(usize),
    Parsing(usize),
    Advancing,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Fetch(TargetSite),
    /// A fetch was handed out and its outcome has not been reported yet.
    InFlight,
    Done,
}

pub struct CrawlScheduler {
    sites: Vec<TargetSite>,
    cursor: usize,
    state: CrawlState,
}

impl CrawlScheduler {
    pub fn new(sites: Vec<TargetSite>) -> Self {
        Self {
            sites,
            cursor: 0,
            state: CrawlState::Idle,
        }
    }

    pub fn state(&self) -> CrawlState {
        self.state
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// True while some site has not been handed out yet.
    pub fn has_pending(&self) -> bool {
        self.state != CrawlState::Done && self.cursor < self.sites.len()
    }

    pub fn next(&mut self) -> Step {
        match self.state {
            CrawlState::Fetching(_) | CrawlState::Parsing(_) => Step::InFlight,
            CrawlState::Done => Step::Done,
            CrawlState::Idle | CrawlState::Advancing => {
                let Some(site) = self.sites.get(self.cursor) else {
                    self.state = CrawlState::Done;
                    debug!(visited = self.cursor, "crawl done");
                    return Step::Done;
                };
                self.state = CrawlState::Fetching(self.cursor);
                info!(url = %site.url, index = self.cursor, "starting request");
                Step::Fetch(site.clone())
            }
        }
    }

    /// Extracts candidates from the page of the in-flight site and advances.
    pub fn on_parsed(&mut self, page: &FetchedPage) -> Vec<Candidate> {
        let CrawlState::Fetching(index) = self.state else {
            warn!(url = %page.url, state = ?self.state, "parsed page without a fetch in flight");
            return Vec::new();
        };
        self.state = CrawlState::Parsing(index);
        info!(url = %page.url, status = page.status, "parsing response");

        let candidates = extract(page, &self.sites[index].selectors);
        self.advance(index);
        candidates
    }

    /// Skips the in-flight site after a failed fetch.
    pub fn on_fetch_failed(&mut self, err: &FetchError) {
        let CrawlState::Fetching(index) = self.state else {
            warn!(state = ?self.state, "fetch failure reported without a fetch in flight");
            return;
        };
        warn!(url = %self.sites[index].url, "fetch failed, skipping site: {err}");
        self.advance(index);
    }

    fn advance(&mut self, index: usize) {
        self.cursor = index + 1;
        self.state = CrawlState::Advancing;
    }
}

/// Randomized pause between successive fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolitenessDelay {
    min: Duration,
    max: Duration,
}

impl PolitenessDelay {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.min(Duration::from_millis(MAX_DELAY_MS));
        Self {
            min: min.min(max),
            max,
        }
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
    }

    /// Sleeps for a sampled delay. Returns `false` if shutdown cut it short.
    pub async fn pause(&self, shutdown: &AtomicBool) -> bool {
        let mut remaining = self.sample();
        debug!(delay_ms = remaining.as_millis() as u64, "politeness delay");
        while !remaining.is_zero() {
            if shutdown.load(Ordering::Relaxed) {
                return false;
            }
            let slice = remaining.min(Duration::from_millis(120));
            tokio::time::sleep(slice).await;
            remaining -= slice;
        }
        !shutdown.load(Ordering::Relaxed)
    }
}

/// Counts for one parsed site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SiteOutcome {
    pub candidates: usize,
    pub kept: usize,
    pub new: usize,
}

/// Screens candidates against the price band and offers survivors to the store.
pub async fn ingest(candidates: &[Candidate], band: PriceBand, store: &ListingStore) -> SiteOutcome {
    let mut outcome = SiteOutcome {
        candidates: candidates.len(),
        ..SiteOutcome::default()
    };

    for candidate in candidates {
        let listing = match screen(candidate, band) {
            Ok(listing) => listing,
            Err(Rejection::UnparsablePrice) => {
                warn!(
                    title = %candidate.title,
                    price = %candidate.price_text,
                    "skipping listing: could not convert price"
                );
                continue;
            }
            Err(Rejection::OutOfBand(price)) => {
                info!(title = %candidate.title, price, "skipping listing: price not in range");
                continue;
            }
        };
        outcome.kept += 1;

        match store
            .insert(&listing.title, &listing.link, listing.price)
            .await
        {
            Ok(true) => outcome.new += 1,
            Ok(false) => debug!(title = %listing.title, "listing already known"),
            Err(err) => error!(title = %listing.title, "failed to insert listing: {err}"),
        }
    }

    outcome
}

pub struct CrawlJob {
    pub fetcher: Arc<dyn PageFetcher>,
    pub store: Arc<ListingStore>,
    pub band: PriceBand,
    pub delay: PolitenessDelay,
    pub shutdown: Arc<AtomicBool>,
}

fn send_event(tx: &UnboundedSender<CrawlEvent>, event: CrawlEvent) {
    let _ = tx.send(event);
}

/// Drives `scheduler` to completion, one fetch at a time.
///
/// Shutdown is honoured before each fetch and during the politeness delay;
/// an in-flight fetch is allowed to finish and its listings are stored.
pub async fn run_crawler(
    mut scheduler: CrawlScheduler,
    job: CrawlJob,
    tx: UnboundedSender<CrawlEvent>,
) -> CrawlScheduler {
    let mut fetched_any = false;

    loop {
        if fetched_any && scheduler.has_pending() && !job.delay.pause(&job.shutdown).await {
            info!("shutdown requested during politeness delay");
            send_event(&tx, CrawlEvent::Interrupted);
            break;
        }
        if job.shutdown.load(Ordering::Relaxed) {
            info!("shutdown requested, stopping crawl");
            send_event(&tx, CrawlEvent::Interrupted);
            break;
        }

        let site = match scheduler.next() {
            Step::Fetch(site) => site,
            Step::InFlight | Step::Done => break,
        };
        fetched_any = true;

        match job.fetcher.fetch(&site.url).await {
            Ok(page) => {
                let candidates = scheduler.on_parsed(&page);
                let outcome = ingest(&candidates, job.band, &job.store).await;
                info!(
                    url = %site.url,
                    found = outcome.candidates,
                    kept = outcome.kept,
                    new = outcome.new,
                    "listings processed in this response"
                );
                send_event(
                    &tx,
                    CrawlEvent::SiteParsed {
                        url: site.url,
                        candidates: outcome.candidates,
                        kept: outcome.kept,
                        new: outcome.new,
                    },
                );
            }
            Err(err) => {
                scheduler.on_fetch_failed(&err);
                send_event(
                    &tx,
                    CrawlEvent::SiteFailed {
                        url: site.url,
                        reason: err.to_string(),
                    },
                );
            }
        }
    }

    send_event(&tx, CrawlEvent::Finished);
    scheduler
}
