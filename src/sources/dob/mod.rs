//! DOB Building Information System scraper.
//!
//! BIS has no API, so the property profile and the ECB violations pages are
//! fetched through a [`BrowserPool`] session and parsed. Every call passes the
//! [`CircuitBreaker`] first and runs under a hard timeout.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::SignalSource;
use crate::error::SourceError;
use crate::models::{PropertyKey, SignalRecord, SourceName};

pub mod breaker;
pub mod browser;
pub mod parse;

pub use breaker::{BreakerConfig, BreakerState, BreakerStatus, CircuitBreaker};
pub use browser::{BrowserPool, HttpBrowserPool, PageSession, SessionGuard, USER_AGENTS};

// ---

pub struct DobScraper {
    // ---
    pool: Arc<dyn BrowserPool>,
    breaker: Arc<CircuitBreaker>,
    base_url: String,
    scrape_timeout: Duration,
    agent_cursor: AtomicUsize,
}

impl DobScraper {
    // ---
    pub fn new(
        pool: Arc<dyn BrowserPool>,
        breaker: Arc<CircuitBreaker>,
        base_url: impl Into<String>,
        scrape_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            breaker,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            scrape_timeout,
            agent_cursor: AtomicUsize::new(0),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn page_url(&self, servlet: &str, key: &PropertyKey) -> Result<Url, SourceError> {
        // ---
        let boro = key.borough().code().to_string();
        let house = key.house_number().to_ascii_uppercase();
        let street = key.street().to_ascii_uppercase();
        Url::parse_with_params(
            &format!("{}/{}", self.base_url, servlet),
            &[("boro", boro.as_str()), ("houseno", house.as_str()), ("street", street.as_str())],
        )
        .map_err(|e| SourceError::ScrapeError(format!("bad DOB url: {e}")))
    }

    fn next_user_agent(&self) -> &'static str {
        let n = self.agent_cursor.fetch_add(1, Ordering::Relaxed);
        USER_AGENTS[n % USER_AGENTS.len()]
    }

    /// One full scrape. The session lives inside this future, so a timeout
    /// that drops the future also closes the session.
    async fn scrape(&self, key: &PropertyKey) -> Result<Vec<SignalRecord>, SourceError> {
        // ---
        let profile_url = self.page_url("PropertyProfileOverviewServlet", key)?;
        let violations_url = self.page_url("ECBQueryByLocationServlet", key)?;

        let user_agent = self.next_user_agent();
        debug!(key = %key, user_agent, "Opening DOB session");
        let mut session = SessionGuard::acquire(self.pool.as_ref(), user_agent).await?;

        let profile_html = session.open(profile_url.as_str()).await?;
        let facts = parse::parse_profile(&profile_html);
        if facts.no_records {
            info!(key = %key, "DOB has no records for this address");
            return Ok(Vec::new());
        }

        let mut records = parse::profile_records(&facts, key);
        match session.open(violations_url.as_str()).await {
            Ok(html) => records.extend(parse::parse_violation_rows(&html)),
            Err(e) => warn!(key = %key, error = %e, "DOB violation history unavailable"),
        }
        Ok(records)
    }
}

#[async_trait]
impl SignalSource for DobScraper {
    fn name(&self) -> SourceName {
        SourceName::Dob
    }

    async fn fetch(&self, key: &PropertyKey) -> Result<Vec<SignalRecord>, SourceError> {
        // ---
        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(e) => {
                warn!(key = %key, "DOB breaker open, skipping scrape");
                return Err(e);
            }
        };

        match timeout(self.scrape_timeout, self.scrape(key)).await {
            Ok(Ok(records)) => {
                permit.succeed();
                info!(key = %key, "Found {} DOB signals", records.len());
                Ok(records)
            }
            Ok(Err(e)) => {
                permit.fail();
                warn!(key = %key, error = %e, "DOB scrape failed");
                Err(e)
            }
            Err(_) => {
                permit.fail();
                warn!(key = %key, "DOB scrape timed out after {:?}", self.scrape_timeout);
                Err(SourceError::ScrapeTimeout(self.scrape_timeout))
            }
        }
    }
}
