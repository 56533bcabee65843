use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Duration;

use pricewatch::app::crawl::PolitenessDelay;
use pricewatch::app::error::{AppError, ConfigError, FetchError, NotifyError};
use pricewatch::app::fetch::PageFetcher;
use pricewatch::app::gate;
use pricewatch::app::notify::{MailMessage, MailTransport, NotificationState, Notifier};
use pricewatch::app::runtime::Pipeline;
use pricewatch::app::store::ListingStore;
use pricewatch::app::types::{FetchedPage, Listing, PriceBand, Selectors, TargetSite};

const OPEN_ROBOTS: &str = "User-agent: *\nDisallow:\n";

#[derive(Default)]
struct StaticWeb {
    pages: HashMap<String, String>,
    requests: Mutex<Vec<String>>,
}

impl StaticWeb {
    fn with(mut self, url: &str, body: &str) -> Self {
        self.pages.insert(url.to_string(), body.to_string());
        self
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    fn page_requests(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|u| !u.ends_with("/robots.txt"))
            .collect()
    }
}

#[async_trait]
impl PageFetcher for StaticWeb {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.requests.lock().unwrap().push(url.to_string());
        match self.pages.get(url) {
            Some(body) => Ok(FetchedPage {
                url: url.to_string(),
                status: 200,
                body: body.clone(),
            }),
            None => Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
            }),
        }
    }
}

#[derive(Clone, Default)]
struct Outbox {
    sent: Arc<Mutex<Vec<(MailMessage, String)>>>,
}

#[async_trait]
impl MailTransport for Outbox {
    async fn send(&self, message: &MailMessage, recipient: &str) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap()
            .push((message.clone(), recipient.to_string()));
        Ok(())
    }
}

fn site(url: &str) -> TargetSite {
    TargetSite {
        url: url.to_string(),
        selectors: Selectors {
            listing_item: "div.item".to_string(),
            title: "h2".to_string(),
            price: ".price".to_string(),
        },
    }
}

fn item(title: &str, price: &str, href: &str) -> String {
    format!(
        r#"<div class="item"><h2>{title}</h2><span class="price">{price}</span><a href="{href}">more</a></div>"#
    )
}

fn listing_page(items: &[String]) -> String {
    format!("<html><body>{}</body></html>", items.concat())
}

async fn pipeline(web: Arc<StaticWeb>, outbox: Outbox) -> Pipeline<Outbox> {
    Pipeline {
        fetcher: web,
        store: Arc::new(ListingStore::in_memory().await.unwrap()),
        notifier: Notifier::new(
            outbox,
            "watch@example.com".to_string(),
            "me@example.com".to_string(),
            Duration::hours(1),
            NotificationState::never_sent(),
        ),
        band: PriceBand {
            min: 1000,
            max: 2000,
        },
        delay: PolitenessDelay::none(),
        user_agent: "pricewatch".to_string(),
        shutdown: Arc::new(AtomicBool::new(false)),
    }
}

#[tokio::test]
async fn new_listing_is_stored_once_and_alerted_once() {
    let web = Arc::new(
        StaticWeb::default()
            .with("https://a.example/robots.txt", OPEN_ROBOTS)
            .with(
                "https://a.example/list",
                &listing_page(&[item("Nice Flat", "$1,200", "/x")]),
            ),
    );
    let outbox = Outbox::default();
    let mut pipeline = pipeline(web.clone(), outbox.clone()).await;
    let sites = [site("https://a.example/list")];

    let first = pipeline.run_once(&sites).await.unwrap();
    let expected = Listing {
        title: "nice flat".to_string(),
        link: "https://a.example/x".to_string(),
        price: 1200,
    };
    assert_eq!(first.new_listings, vec![expected.clone()]);
    assert!(first.notified);
    assert_eq!(pipeline.store.fetch_all().await.unwrap(), vec![expected]);

    let second = pipeline.run_once(&sites).await.unwrap();
    assert!(second.new_listings.is_empty());
    assert!(!second.notified);
    assert_eq!(second.summary.kept, 1);
    assert_eq!(second.summary.new, 0);
    assert_eq!(pipeline.store.count().await.unwrap(), 1);

    let sent = outbox.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "me@example.com");
    assert!(sent[0].0.html.contains("https://a.example/x"));
}

#[tokio::test]
async fn band_edges_kept_and_bad_prices_dropped() {
    let page = listing_page(&[
        item("At Min", "1 000 Kč", "/min"),
        item("At Max", "2,000", "/max"),
        item("Below", "999", "/below"),
        item("Above", "2001", "/above"),
        item("Ask", "Price on request", "/ask"),
    ]);
    let web = Arc::new(
        StaticWeb::default()
            .with("https://a.example/robots.txt", OPEN_ROBOTS)
            .with("https://a.example/list", &page),
    );
    let mut pipeline = pipeline(web, Outbox::default()).await;

    let report = pipeline
        .run_once(&[site("https://a.example/list")])
        .await
        .unwrap();

    assert_eq!(report.summary.candidates, 5);
    assert_eq!(report.summary.kept, 2);
    let prices = report
        .new_listings
        .iter()
        .map(|l| l.price)
        .collect::<Vec<_>>();
    assert_eq!(prices, [1000, 2000]);
}

#[tokio::test]
async fn robots_rules_exclude_only_disallowed_paths() {
    let web = StaticWeb::default().with(
        "https://a.example/robots.txt",
        "User-agent: pricewatch\nDisallow: /private\n",
    );
    let urls = vec![
        "https://a.example/private/list".to_string(),
        "https://a.example/public/list".to_string(),
        "https://a.example/public/list".to_string(),
        "not-a-url".to_string(),
    ];

    let admitted = gate::admit(&urls, "pricewatch", &web, &AtomicBool::new(false)).await;

    assert_eq!(admitted, ["https://a.example/public/list"]);
    assert_eq!(web.requests(), ["https://a.example/robots.txt"]);
}

#[tokio::test]
async fn unreachable_robots_excludes_host_and_empty_admission_is_fatal() {
    let web = Arc::new(StaticWeb::default().with("https://a.example/list", "<html></html>"));
    let mut pipeline = pipeline(web.clone(), Outbox::default()).await;

    let result = pipeline.run_once(&[site("https://a.example/list")]).await;

    assert!(matches!(
        result,
        Err(AppError::Config(ConfigError::NoAdmittedUrls))
    ));
    assert!(web.page_requests().is_empty());
}

#[tokio::test]
async fn sites_visited_once_in_order_despite_failures() {
    let body = listing_page(&[item("Loft", "1500", "/loft")]);
    let web = Arc::new(
        StaticWeb::default()
            .with("https://a.example/robots.txt", OPEN_ROBOTS)
            .with("https://b.example/robots.txt", OPEN_ROBOTS)
            .with("https://a.example/one", &body)
            .with("https://b.example/three", &body),
    );
    let mut pipeline = pipeline(web.clone(), Outbox::default()).await;
    let sites = [
        site("https://a.example/one"),
        site("https://a.example/two"),
        site("https://b.example/three"),
    ];

    let report = pipeline.run_once(&sites).await.unwrap();

    assert_eq!(
        web.page_requests(),
        [
            "https://a.example/one",
            "https://a.example/two",
            "https://b.example/three"
        ]
    );
    assert_eq!(report.summary.sites_parsed, 2);
    assert_eq!(report.summary.sites_failed, 1);
    assert_eq!(report.summary.failures.len(), 1);
    assert!(report.summary.failures[0].starts_with("https://a.example/two: "));
    assert_eq!(report.new_listings.len(), 2);
    assert!(report.summary.done);
}

#[tokio::test]
async fn shutdown_stops_before_any_fetch() {
    let web = Arc::new(
        StaticWeb::default()
            .with("https://a.example/robots.txt", OPEN_ROBOTS)
            .with(
                "https://a.example/list",
                &listing_page(&[item("Loft", "1500", "/loft")]),
            ),
    );
    let mut pipeline = pipeline(web.clone(), Outbox::default()).await;
    pipeline
        .shutdown
        .store(true, std::sync::atomic::Ordering::Relaxed);

    let report = pipeline
        .run_once(&[site("https://a.example/list")])
        .await
        .unwrap();

    assert!(report.summary.interrupted);
    assert!(web.requests().is_empty());
    assert!(report.new_listings.is_empty());
    assert!(!report.notified);
}

/// Raises the shutdown flag as soon as the first request goes out.
struct SignalOnFirstFetch {
    web: StaticWeb,
    shutdown: Arc<AtomicBool>,
}

#[async_trait]
impl PageFetcher for SignalOnFirstFetch {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.shutdown
            .store(true, std::sync::atomic::Ordering::Relaxed);
        self.web.fetch(url).await
    }
}

#[tokio::test]
async fn shutdown_during_admission_skips_remaining_robots_fetches() {
    let shutdown = Arc::new(AtomicBool::new(false));
    let fetcher = SignalOnFirstFetch {
        web: StaticWeb::default()
            .with("https://a.example/robots.txt", OPEN_ROBOTS)
            .with("https://b.example/robots.txt", OPEN_ROBOTS),
        shutdown: shutdown.clone(),
    };
    let urls = vec![
        "https://a.example/list".to_string(),
        "https://a.example/other".to_string(),
        "https://b.example/list".to_string(),
    ];

    let admitted = gate::admit(&urls, "pricewatch", &fetcher, &shutdown).await;

    assert_eq!(admitted, ["https://a.example/list", "https://a.example/other"]);
    assert_eq!(fetcher.web.requests(), ["https://a.example/robots.txt"]);
}

#[tokio::test]
async fn records_survive_reopening_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("listings.db");
    let path = path.to_str().unwrap();

    let store = ListingStore::open(path).await.unwrap();
    assert!(store.insert("Nice Flat", "https://a.example/x", 1200).await.unwrap());
    store.close().await;

    let reopened = ListingStore::open(path).await.unwrap();
    assert!(!reopened.insert("nice flat", "https://a.example/x", 1200).await.unwrap());
    assert!(reopened.newly_inserted().await.is_empty());
    assert_eq!(reopened.fetch_all().await.unwrap().len(), 1);
    reopened.close().await;
}
