use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::config::{
    DEFAULT_MAX_RETRIES, DEFAULT_POLITENESS_MS, DEFAULT_RETRY_DELAY_MS, WarsConfig,
};
use crate::extract::{OutcomeDetector, RecordExtractor};
use crate::fetch::PageFetcher;
use crate::model::MatchRecord;
use crate::query::HistoryQuery;
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlOptions {
    /// Minimum gap between two consecutive fetch attempts.
    pub politeness: Duration,
    /// Extra attempts per page after a transient failure.
    pub max_retries: usize,
    pub retry_delay: Duration,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            politeness: Duration::from_millis(DEFAULT_POLITENESS_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

impl CrawlOptions {
    pub fn from_config(config: &WarsConfig) -> Self {
        Self {
            politeness: Duration::from_millis(config.politeness_ms()),
            max_retries: config.max_retries(),
            retry_delay: Duration::from_millis(config.retry_delay_ms()),
        }
    }
}

/// External stop signal. Clones share the flag; the deadline is per token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, budget: Duration) -> Self {
        self.deadline = Instant::now().checked_add(budget);
        self
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self
                .deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Non-transient fetch failure, e.g. an expired session.
    Fetch { page: u32, message: String },
    RetriesExhausted {
        page: u32,
        attempts: usize,
        message: String,
    },
    Cancelled { page: u32 },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch { page, message } => write!(f, "page {page} failed: {message}"),
            Self::RetriesExhausted {
                page,
                attempts,
                message,
            } => write!(f, "page {page} failed after {attempts} attempts: {message}"),
            Self::Cancelled { page } => write!(f, "cancelled before page {page}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlStatus {
    /// A page without any valid match link was reached.
    Completed,
    LimitReached,
    Aborted(AbortReason),
}

impl CrawlStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::LimitReached => "limit_reached",
            Self::Aborted(_) => "aborted",
        }
    }
}

/// Whatever was accumulated, plus how the crawl ended. Matches are kept on
/// abort.
#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub matches: Vec<MatchRecord>,
    pub status: CrawlStatus,
    pub pages_fetched: u32,
    pub request_count: usize,
    pub filtered_out: usize,
}

impl CrawlReport {
    pub fn is_aborted(&self) -> bool {
        matches!(self.status, CrawlStatus::Aborted(_))
    }
}

enum CrawlState {
    Fetching { page: u32, attempt: usize },
    Extracting { page: u32, raw: String },
    Deciding { page: u32, had_matches: bool },
    Stopped(CrawlStatus),
}

struct Pacer {
    interval: Duration,
    last_request_at: Option<Instant>,
}

impl Pacer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_request_at: None,
        }
    }

    fn wait(&mut self) {
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                sleep(self.interval - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
    }
}

/// Walks history pages from 1 until a page has no valid match link, the
/// page limit is reached, or the crawl aborts.
pub fn crawl<F, D>(
    fetcher: &mut F,
    session: &Session,
    extractor: &RecordExtractor<D>,
    query: &HistoryQuery,
    options: &CrawlOptions,
    cancel: &CancelToken,
) -> CrawlReport
where
    F: PageFetcher,
    D: OutcomeDetector,
{
    let mut matches = Vec::new();
    let mut pages_fetched = 0u32;
    let mut filtered_out = 0usize;
    let mut pacer = Pacer::new(options.politeness);
    let mut state = CrawlState::Fetching {
        page: 1,
        attempt: 0,
    };

    let status = loop {
        state = match state {
            CrawlState::Fetching { page, attempt } => {
                if cancel.is_cancelled() {
                    info!(page, "crawl cancelled");
                    CrawlState::Stopped(CrawlStatus::Aborted(AbortReason::Cancelled { page }))
                } else {
                    pacer.wait();
                    debug!(page, attempt, "fetching history page");
                    match fetcher.fetch_page(session, query, page) {
                        Ok(raw) => {
                            pages_fetched += 1;
                            CrawlState::Extracting { page, raw }
                        }
                        Err(error) if error.is_transient() && attempt < options.max_retries => {
                            warn!(page, attempt = attempt + 1, %error, "transient fetch failure; retrying");
                            wait_before_retry(options.retry_delay, attempt);
                            CrawlState::Fetching {
                                page,
                                attempt: attempt + 1,
                            }
                        }
                        Err(error) if error.is_transient() => {
                            CrawlState::Stopped(CrawlStatus::Aborted(AbortReason::RetriesExhausted {
                                page,
                                attempts: attempt + 1,
                                message: error.to_string(),
                            }))
                        }
                        Err(error) => CrawlState::Stopped(CrawlStatus::Aborted(AbortReason::Fetch {
                            page,
                            message: error.to_string(),
                        })),
                    }
                }
            }
            CrawlState::Extracting { page, raw } => {
                let extraction = extractor.extract(&raw, &query.account, query.opponent_filter());
                info!(
                    page,
                    kept = extraction.matches.len(),
                    valid = extraction.valid_candidates,
                    "extracted history page"
                );
                filtered_out += extraction.filtered_out;
                matches.extend(extraction.matches);
                CrawlState::Deciding {
                    page,
                    had_matches: extraction.page_had_any_matches,
                }
            }
            CrawlState::Deciding { page, had_matches } => {
                if query.page_limit.is_some_and(|limit| page >= limit) {
                    CrawlState::Stopped(CrawlStatus::LimitReached)
                } else if !had_matches {
                    CrawlState::Stopped(CrawlStatus::Completed)
                } else {
                    CrawlState::Fetching {
                        page: page + 1,
                        attempt: 0,
                    }
                }
            }
            CrawlState::Stopped(status) => break status,
        };
    };

    if let CrawlStatus::Aborted(reason) = &status {
        warn!(%reason, kept = matches.len(), "crawl aborted");
    }
    CrawlReport {
        matches,
        status,
        pages_fetched,
        request_count: fetcher.request_count(),
        filtered_out,
    }
}

fn wait_before_retry(retry_delay: Duration, attempt: usize) {
    if retry_delay.is_zero() {
        return;
    }
    let exponent = u32::try_from(attempt).unwrap_or(8).min(8);
    let base = retry_delay.saturating_mul(2u32.saturating_pow(exponent));
    let jitter = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| u64::from(duration.subsec_millis() % 100))
        .unwrap_or(0);
    sleep(base.saturating_add(Duration::from_millis(jitter)));
}
