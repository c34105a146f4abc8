//! Upstream signal sources.
//!
//! Each source turns a [`PropertyKey`] into normalized [`SignalRecord`]s.
//! Sources are independent; the aggregator decides what a failure means.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::SourceError;
use crate::models::{PropertyKey, SignalRecord, SourceName};

pub mod complaints_311;
pub mod dob;
pub mod hpd;
pub mod socrata;

pub use complaints_311::Nyc311Client;
pub use dob::DobScraper;
pub use hpd::HpdClient;
pub use socrata::SocrataClient;

// ---

#[async_trait]
pub trait SignalSource: Send + Sync {
    fn name(&self) -> SourceName;

    async fn fetch(&self, key: &PropertyKey) -> Result<Vec<SignalRecord>, SourceError>;

    /// Records without the look-back window applied by [`fetch`](Self::fetch).
    /// `None` when `fetch` already returns the whole history.
    async fn fetch_history(&self, _key: &PropertyKey) -> Result<Option<Vec<SignalRecord>>, SourceError> {
        Ok(None)
    }
}

/// Exponential back-off for transient failures.
///
/// Delays are `base_delay * factor^n` for retry `n`; with the defaults a
/// failing call is retried after 200ms and then 800ms.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    // ---
    pub max_retries: u32,
    pub base_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(200),
            factor: 4,
        }
    }
}

impl RetryPolicy {
    // ---
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay(&self, retry: u32) -> Duration {
        self.base_delay * self.factor.saturating_pow(retry)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// retries are exhausted. Only [`SourceError::Unavailable`] is retried.
    pub async fn run<T, F, Fut>(&self, source: SourceName, mut op: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        // ---
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retry < self.max_retries => {
                    let delay = self.delay(retry);
                    warn!(
                        source = %source,
                        attempt = retry + 1,
                        error = %e,
                        "Transient source failure, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Escape a value for a SoQL string literal: quotes are doubled and
/// statement-level punctuation is dropped.
pub(crate) fn soql_literal(value: &str) -> String {
    // ---
    value
        .chars()
        .take(200)
        .filter(|c| !matches!(c, ';' | '|' | '&' | '$' | '(' | ')' | '[' | ']' | '{' | '}' | '%' | '\\'))
        .collect::<String>()
        .replace('\'', "''")
        .trim()
        .to_string()
}
