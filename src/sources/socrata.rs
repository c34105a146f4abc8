//! Paginated reader for NYC OpenData (Socrata SODA) datasets.

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::SourceError;

// ---

/// A SoQL filter plus ordering. Ordering must be stable for offset paging.
#[derive(Debug, Clone)]
pub struct SoqlQuery {
    // ---
    pub where_clause: String,
    pub order: String,
}

impl SoqlQuery {
    pub fn new(where_clause: impl Into<String>) -> Self {
        Self {
            where_clause: where_clause.into(),
            order: ":id".to_string(),
        }
    }

    pub fn order_by(mut self, order: impl Into<String>) -> Self {
        self.order = order.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct SocrataClient {
    // ---
    http: reqwest::Client,
    app_token: Option<String>,
    page_size: u32,
    max_records: u32,
}

impl SocrataClient {
    // ---
    pub fn new(http: reqwest::Client, app_token: Option<String>, page_size: u32, max_records: u32) -> Self {
        Self {
            http,
            app_token,
            page_size: page_size.max(1),
            max_records,
        }
    }

    /// Fetch rows matching `query` until a short page or the record cap.
    ///
    /// Rows that do not deserialize as `T` are skipped; if every row of a
    /// non-empty result is skipped the payload is reported as malformed.
    pub async fn fetch_rows<T: DeserializeOwned>(&self, url: &str, query: &SoqlQuery) -> Result<Vec<T>, SourceError> {
        // ---
        let mut rows: Vec<T> = Vec::new();
        let mut seen = 0usize;
        let mut offset = 0u32;
        let mut page_count = 0u32;

        loop {
            let remaining = self.max_records.saturating_sub(offset);
            if remaining == 0 {
                debug!(
                    "Hit record cap of {}, stopping pagination. Fetched {} records so far.",
                    self.max_records,
                    rows.len()
                );
                break;
            }
            let limit = self.page_size.min(remaining);
            page_count += 1;

            let limit_param = limit.to_string();
            let offset_param = offset.to_string();
            let mut request = self.http.get(url).query(&[
                ("$where", query.where_clause.as_str()),
                ("$order", query.order.as_str()),
                ("$limit", limit_param.as_str()),
                ("$offset", offset_param.as_str()),
            ]);
            if let Some(token) = &self.app_token {
                request = request.header("X-App-Token", token);
            }

            debug!("Fetching page {} from {} (offset {})", page_count, url, offset);

            let response = request.send().await?;
            let status = response.status();
            if status.is_server_error() || status.as_u16() == 429 {
                return Err(SourceError::Unavailable(format!("HTTP {status} from {url}")));
            }
            if !status.is_success() {
                return Err(SourceError::DataError(format!("HTTP {status} from {url}")));
            }

            let body: serde_json::Value = response.json().await?;
            let page = parse_page::<T>(body)?;
            debug!(
                "Page {} returned {} rows ({} skipped)",
                page_count,
                page.total,
                page.total - page.rows.len()
            );

            seen += page.total;
            rows.extend(page.rows);

            if (page.total as u32) < limit {
                break;
            }
            offset += page.total as u32;
        }

        if seen > 0 && rows.is_empty() {
            return Err(SourceError::DataError(format!(
                "none of the {seen} rows from {url} had the expected shape"
            )));
        }

        debug!("Finished fetching {} records from {} pages", rows.len(), page_count);
        Ok(rows)
    }
}

#[derive(Debug)]
pub(crate) struct Page<T> {
    pub rows: Vec<T>,
    pub total: usize,
}

pub(crate) fn parse_page<T: DeserializeOwned>(body: serde_json::Value) -> Result<Page<T>, SourceError> {
    // ---
    let serde_json::Value::Array(items) = body else {
        return Err(SourceError::DataError(
            "expected a JSON array of rows".to_string(),
        ));
    };

    let total = items.len();
    let mut rows = Vec::with_capacity(total);
    for (i, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<T>(item) {
            Ok(row) => rows.push(row),
            Err(e) => debug!("Failed to parse row {}: {}", i, e),
        }
    }
    Ok(Page { rows, total })
}
