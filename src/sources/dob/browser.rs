//! Page sessions for the DOB site.
//!
//! A [`BrowserPool`] hands out [`PageSession`]s; callers hold them through a
//! [`SessionGuard`] so the session is torn down on every exit path: normal
//! return, error, or the future being dropped by a timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::SourceError;

// ---

/// User agents rotated across scrape sessions.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// One isolated browsing context.
#[async_trait]
pub trait PageSession: Send {
    /// Navigate to `url` and return the rendered HTML.
    async fn open(&mut self, url: &str) -> Result<String, SourceError>;

    /// Release the session. Must be idempotent; called from `Drop`.
    fn close(&mut self);
}

#[async_trait]
pub trait BrowserPool: Send + Sync {
    async fn acquire(&self, user_agent: &str) -> Result<Box<dyn PageSession>, SourceError>;

    /// Sessions currently checked out.
    fn in_use(&self) -> usize;
}

/// Scoped ownership of a [`PageSession`]; closes it when dropped.
pub struct SessionGuard {
    session: Box<dyn PageSession>,
}

impl SessionGuard {
    // ---
    pub async fn acquire(pool: &dyn BrowserPool, user_agent: &str) -> Result<SessionGuard, SourceError> {
        let session = pool.acquire(user_agent).await?;
        Ok(SessionGuard { session })
    }

    pub async fn open(&mut self, url: &str) -> Result<String, SourceError> {
        self.session.open(url).await
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.close();
    }
}

/// Pool of plain-HTTP sessions bounded by a semaphore. BIS serves its
/// property pages as server-rendered HTML, so a fresh client per session with
/// its own user agent is enough to isolate scrapes.
pub struct HttpBrowserPool {
    // ---
    slots: Arc<Semaphore>,
    size: usize,
    page_timeout: Duration,
}

impl HttpBrowserPool {
    // ---
    pub fn new(size: usize, page_timeout: Duration) -> Self {
        let size = size.max(1);
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
            page_timeout,
        }
    }
}

#[async_trait]
impl BrowserPool for HttpBrowserPool {
    async fn acquire(&self, user_agent: &str) -> Result<Box<dyn PageSession>, SourceError> {
        // ---
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| SourceError::ScrapeError("browser pool closed".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .timeout(self.page_timeout)
            .build()
            .map_err(|e| SourceError::ScrapeError(format!("cannot start session: {e}")))?;

        Ok(Box::new(HttpPageSession {
            client: Some(client),
            permit: Some(permit),
        }))
    }

    fn in_use(&self) -> usize {
        self.size - self.slots.available_permits()
    }
}

struct HttpPageSession {
    client: Option<reqwest::Client>,
    permit: Option<OwnedSemaphorePermit>,
}

#[async_trait]
impl PageSession for HttpPageSession {
    async fn open(&mut self, url: &str) -> Result<String, SourceError> {
        // ---
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| SourceError::ScrapeError("session already closed".to_string()))?;

        let response = client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                SourceError::ScrapeError(format!("page load timed out: {e}"))
            } else {
                SourceError::ScrapeError(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(SourceError::ScrapeError(format!("HTTP {status} from {url}")));
        }
        response
            .text()
            .await
            .map_err(|e| SourceError::ScrapeError(format!("cannot read page body: {e}")))
    }

    fn close(&mut self) {
        if self.client.take().is_some() {
            debug!("Closing DOB page session");
        }
        self.permit.take();
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn test_pool_slots_are_returned_on_drop() {
        // ---
        let pool = HttpBrowserPool::new(2, Duration::from_secs(5));
        assert_eq!(pool.in_use(), 0);

        let first = SessionGuard::acquire(&pool, USER_AGENTS[0]).await.unwrap();
        let second = SessionGuard::acquire(&pool, USER_AGENTS[1]).await.unwrap();
        assert_eq!(pool.in_use(), 2);

        drop(first);
        assert_eq!(pool.in_use(), 1);
        drop(second);
        assert_eq!(pool.in_use(), 0);
    }
}
