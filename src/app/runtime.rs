use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use super::config::Settings;
use super::crawl::{CrawlJob, CrawlScheduler, PolitenessDelay, run_crawler};
use super::data_io::{detect_data_format, export_listings, print_listings};
use super::error::{AppError, ConfigError};
use super::fetch::{HttpFetcher, PageFetcher};
use super::gate;
use super::notify::{HttpMailRelay, LogMailer, MailTransport, NotificationState, Notifier};
use super::store::ListingStore;
use super::types::{Cli, CrawlEvent, Listing, PriceBand, RunSummary, TargetSite};

struct AbortTaskOnDrop(tokio::task::AbortHandle);

impl Drop for AbortTaskOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Everything one watch run needs, wired together.
pub struct Pipeline<M> {
    pub fetcher: Arc<dyn PageFetcher>,
    pub store: Arc<ListingStore>,
    pub notifier: Notifier<M>,
    pub band: PriceBand,
    pub delay: PolitenessDelay,
    pub user_agent: String,
    pub shutdown: Arc<AtomicBool>,
}

#[derive(Debug)]
pub struct RunReport {
    pub admitted: usize,
    pub summary: RunSummary,
    pub new_listings: Vec<Listing>,
    pub notified: bool,
}

impl<M: MailTransport> Pipeline<M> {
    /// Admits `sites`, crawls the admitted ones in order, stores new listings
    /// and raises at most one alert.
    ///
    /// Fails only when no site survives admission.
    pub async fn run_once(&mut self, sites: &[TargetSite]) -> Result<RunReport, AppError> {
        let urls = sites.iter().map(|s| s.url.clone()).collect::<Vec<_>>();
        info!(count = urls.len(), "validating URLs");
        let admitted = gate::admit(
            &urls,
            &self.user_agent,
            self.fetcher.as_ref(),
            &self.shutdown,
        )
        .await;
        if self.shutdown.load(Ordering::Relaxed) {
            warn!("shutdown requested before crawling started");
            let mut summary = RunSummary::default();
            summary.apply(CrawlEvent::Interrupted);
            return Ok(RunReport {
                admitted: admitted.len(),
                summary,
                new_listings: Vec::new(),
                notified: false,
            });
        }
        if admitted.is_empty() {
            return Err(ConfigError::NoAdmittedUrls.into());
        }
        let sites = admitted_sites(sites, &admitted);
        info!(
            admitted = sites.len(),
            min = self.band.min,
            max = self.band.max,
            "starting crawl"
        );

        self.store.begin_session().await;
        let (tx, mut rx) = mpsc::unbounded_channel::<CrawlEvent>();
        let job = CrawlJob {
            fetcher: self.fetcher.clone(),
            store: self.store.clone(),
            band: self.band,
            delay: self.delay,
            shutdown: self.shutdown.clone(),
        };
        let crawl_handle = tokio::spawn(run_crawler(CrawlScheduler::new(sites.clone()), job, tx));
        let _crawl_guard = AbortTaskOnDrop(crawl_handle.abort_handle());

        let mut summary = RunSummary::default();
        while let Some(event) = rx.recv().await {
            handle_crawl_event(&mut summary, event);
        }
        if let Err(e) = crawl_handle.await {
            error!("crawler task join error: {e}");
        }

        info!(
            parsed = summary.sites_parsed,
            failed = summary.sites_failed,
            found = summary.candidates,
            kept = summary.kept,
            new = summary.new,
            interrupted = summary.interrupted,
            "crawl finished"
        );
        for failure in summary.failures.iter().rev() {
            warn!("skipped site: {failure}");
        }

        let new_listings = self.store.newly_inserted().await;
        if new_listings.is_empty() {
            info!("no new listings detected in this session");
        } else {
            info!("new listings detected in this session:");
            for listing in &new_listings {
                info!(title = %listing.title, price = listing.price, link = %listing.link);
            }
        }
        let notified = self.notifier.maybe_notify(&new_listings, Utc::now()).await;

        Ok(RunReport {
            admitted: sites.len(),
            summary,
            new_listings,
            notified,
        })
    }
}

fn handle_crawl_event(summary: &mut RunSummary, event: CrawlEvent) {
    match &event {
        CrawlEvent::SiteFailed { url, reason } => warn!(%url, "site skipped: {reason}"),
        CrawlEvent::Interrupted => warn!("crawl interrupted before all sites were visited"),
        CrawlEvent::SiteParsed { .. } | CrawlEvent::Finished => {}
    }
    summary.apply(event);
}

/// Admitted sites in configuration order, each URL at most once.
fn admitted_sites(sites: &[TargetSite], admitted: &[String]) -> Vec<TargetSite> {
    let allowed = admitted.iter().map(String::as_str).collect::<HashSet<_>>();
    let mut seen = HashSet::new();
    sites
        .iter()
        .filter(|s| allowed.contains(s.url.as_str()) && seen.insert(s.url.as_str()))
        .cloned()
        .collect()
}

pub async fn run() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let _log_guard = match init_logging(cli.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    match run_with(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run_with(cli: Cli) -> Result<(), AppError> {
    info!(path = %cli.config, "loading configuration");
    let settings = Settings::load(&cli.config)?;
    let band = settings.price_band();
    info!(min = band.min, max = band.max, "price range validated");

    let crawl = &settings.crawl_settings;
    let user_agent = cli
        .user_agent
        .clone()
        .unwrap_or_else(|| crawl.user_agent.clone());
    let fetcher =
        HttpFetcher::new(&user_agent, crawl.request_timeout()).map_err(AppError::Client)?;
    let http = fetcher.client().clone();

    let db_path = cli.db.clone().unwrap_or_else(|| settings.database.path.clone());
    let store = Arc::new(ListingStore::open(&db_path).await?);

    let shutdown = Arc::new(AtomicBool::new(false));
    let signal_flag = shutdown.clone();
    let signal_task = tokio::spawn(async move {
        shutdown_signal().await;
        info!("graceful shutdown initiated");
        signal_flag.store(true, Ordering::Relaxed);
    });
    let _signal_guard = AbortTaskOnDrop(signal_task.abort_handle());

    let email = &settings.email_settings;
    let transport: Box<dyn MailTransport> = if cli.dry_run_mail {
        Box::new(LogMailer)
    } else {
        let token = std::env::var(&email.token_env).ok();
        if token.is_none() {
            warn!(var = %email.token_env, "mail relay token not set, sending unauthenticated");
        }
        Box::new(HttpMailRelay::new(http, email.endpoint.clone(), token))
    };
    let state = if settings.notify_settings.throttle_from_start {
        NotificationState::sent_at(Utc::now())
    } else {
        NotificationState::never_sent()
    };
    let notifier = Notifier::new(
        transport,
        email.sender.clone(),
        email.recipient.clone(),
        settings.notify_settings.throttle_window(),
        state,
    );

    let mut pipeline = Pipeline {
        fetcher: Arc::new(fetcher),
        store: store.clone(),
        notifier,
        band,
        delay: PolitenessDelay::new(
            Duration::from_millis(crawl.delay_min_ms),
            Duration::from_millis(crawl.delay_max_ms),
        ),
        user_agent,
        shutdown,
    };

    let result = match pipeline.run_once(&settings.urls).await {
        Ok(report) => finish(&cli, &store, &report).await,
        Err(err) => Err(err),
    };
    store.close().await;
    result
}

async fn finish(cli: &Cli, store: &ListingStore, report: &RunReport) -> Result<(), AppError> {
    let total = store.count().await?;
    info!(
        admitted = report.admitted,
        new = report.new_listings.len(),
        notified = report.notified,
        total,
        "run complete"
    );

    if cli.list {
        let all = store.fetch_all().await?;
        if all.is_empty() {
            info!("no listings found in the database");
        }
        print_listings(&mut io::stdout().lock(), &all)?;
    }

    if let Some(path) = &cli.export {
        let format = detect_data_format(path, cli.format.into());
        let rows = store.fetch_all_detailed().await?;
        let written = export_listings(path, format, &rows)?;
        info!(path = %path, rows = written, "exported listings");
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_logging(log_file: Option<&str>) -> Result<Option<WorkerGuard>, AppError> {
    let env_filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .with_filter(env_filter());

    let (file_layer, guard) = match log_file {
        Some(raw) => {
            let path = Path::new(raw);
            let file_name = path
                .file_name()
                .ok_or_else(|| AppError::Logging(format!("invalid log file path {raw}")))?;
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| AppError::Logging(e.to_string()))?;
    Ok(guard)
}
