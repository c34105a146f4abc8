//! NYC 311 service requests (dataset `erm2-nwe9`).

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use serde::Deserialize;
use tracing::info;

use super::socrata::{SocrataClient, SoqlQuery};
use super::{soql_literal, RetryPolicy, SignalSource};
use crate::error::SourceError;
use crate::models::{ComplaintCategory, PropertyKey, SignalKind, SignalRecord, SignalStatus, SourceName};

// ---

/// Raw 311 row; only the fields we map.
#[derive(Debug, Deserialize)]
struct Raw311Complaint {
    // ---
    unique_key: String,
    created_date: Option<String>,
    closed_date: Option<String>,
    complaint_type: Option<String>,
    descriptor: Option<String>,
    status: Option<String>,
}

impl Raw311Complaint {
    // ---
    fn to_record(&self) -> SignalRecord {
        // ---
        let complaint_type = self.complaint_type.as_deref().unwrap_or("Unknown").trim();
        let descriptor = self.descriptor.as_deref().unwrap_or("").trim();
        let description = if descriptor.is_empty() {
            complaint_type.to_string()
        } else {
            format!("{complaint_type} - {descriptor}")
        };

        let closed = self
            .status
            .as_deref()
            .is_some_and(|s| s.trim().eq_ignore_ascii_case("closed"));
        let status = if closed {
            SignalStatus::Closed
        } else {
            SignalStatus::Open
        };

        SignalRecord {
            kind: SignalKind::Complaint311,
            source_id: self.unique_key.trim().to_string(),
            description,
            date: self.created_date.as_deref().and_then(parse_socrata_date),
            status,
            status_date: self.closed_date.as_deref().and_then(parse_socrata_date),
            severity: ComplaintCategory::classify(complaint_type).as_str().to_string(),
        }
    }
}

/// Socrata floating timestamps look like `2024-01-15T10:22:00.000`.
pub(crate) fn parse_socrata_date(raw: &str) -> Option<NaiveDate> {
    // ---
    let day = raw.trim().get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

pub struct Nyc311Client {
    // ---
    socrata: SocrataClient,
    url: String,
    lookback_days: u32,
    retry: RetryPolicy,
}

impl Nyc311Client {
    // ---
    pub fn new(socrata: SocrataClient, url: impl Into<String>, lookback_days: u32) -> Self {
        Self {
            socrata,
            url: url.into(),
            lookback_days,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn address_clause(key: &PropertyKey) -> String {
        // ---
        let address = soql_literal(&format!(
            "{} {}",
            key.house_number().to_ascii_uppercase(),
            key.street().to_ascii_uppercase()
        ));
        format!(
            "upper(incident_address) LIKE '{address}%' AND borough = '{}'",
            key.borough().upper_name()
        )
    }

    fn query(&self, key: &PropertyKey, today: NaiveDate) -> SoqlQuery {
        // ---
        let since = today - Duration::days(i64::from(self.lookback_days));
        SoqlQuery::new(format!(
            "{} AND created_date > '{}T00:00:00.000'",
            Self::address_clause(key),
            since.format("%Y-%m-%d")
        ))
        .order_by("created_date DESC, unique_key")
    }

    /// Every complaint on record for the address, newest first. Only the
    /// client's record cap bounds it.
    fn history_query(&self, key: &PropertyKey) -> SoqlQuery {
        SoqlQuery::new(Self::address_clause(key)).order_by("created_date DESC, unique_key")
    }

    async fn fetch_query(&self, query: &SoqlQuery) -> Result<Vec<SignalRecord>, SourceError> {
        // ---
        let rows: Vec<Raw311Complaint> = self
            .retry
            .run(SourceName::Nyc311, || self.socrata.fetch_rows(&self.url, query))
            .await?;

        Ok(rows
            .iter()
            .filter(|r| !r.unique_key.trim().is_empty())
            .map(Raw311Complaint::to_record)
            .collect())
    }
}

#[async_trait]
impl SignalSource for Nyc311Client {
    fn name(&self) -> SourceName {
        SourceName::Nyc311
    }

    async fn fetch(&self, key: &PropertyKey) -> Result<Vec<SignalRecord>, SourceError> {
        // ---
        let records = self.fetch_query(&self.query(key, Utc::now().date_naive())).await?;
        info!(key = %key, "Found {} 311 complaints", records.len());
        Ok(records)
    }

    async fn fetch_history(&self, key: &PropertyKey) -> Result<Option<Vec<SignalRecord>>, SourceError> {
        // ---
        let records = self.fetch_query(&self.history_query(key)).await?;
        info!(key = %key, "Found {} 311 complaints in full history", records.len());
        Ok(Some(records))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::address::resolve;

    fn raw(value: serde_json::Value) -> Raw311Complaint {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_closed_heat_complaint_mapping() {
        // ---
        let record = raw(serde_json::json!({
            "unique_key": "59893417",
            "created_date": "2023-12-02T08:15:00.000",
            "closed_date": "2023-12-05T11:00:00.000",
            "complaint_type": "HEAT/HOT WATER",
            "descriptor": "ENTIRE BUILDING",
            "status": "Closed",
            "incident_address": "123 WEST 45 STREET"
        }))
        .to_record();

        assert_eq!(record.kind, SignalKind::Complaint311);
        assert_eq!(record.source_id, "59893417");
        assert_eq!(record.description, "HEAT/HOT WATER - ENTIRE BUILDING");
        assert_eq!(record.status, SignalStatus::Closed);
        assert_eq!(record.date, NaiveDate::from_ymd_opt(2023, 12, 2));
        assert_eq!(record.status_date, NaiveDate::from_ymd_opt(2023, 12, 5));
        assert_eq!(record.severity, "heat_water");
    }

    #[test]
    fn test_in_progress_complaint_is_open() {
        // ---
        let record = raw(serde_json::json!({
            "unique_key": "1",
            "complaint_type": "Noise - Residential",
            "status": "In Progress"
        }))
        .to_record();

        assert_eq!(record.status, SignalStatus::Open);
        assert_eq!(record.date, None);
        assert_eq!(record.severity, "noise_residential");
        assert_eq!(record.description, "Noise - Residential");
    }

    #[test]
    fn test_query_targets_address_and_window() {
        // ---
        let client = Nyc311Client::new(
            SocrataClient::new(reqwest::Client::new(), None, 500, 2000),
            "http://localhost/311.json",
            90,
        );
        let key = resolve("123", "W 45th St", "Manhattan").unwrap();
        let query = client.query(&key, NaiveDate::from_ymd_opt(2025, 4, 1).unwrap());

        assert_eq!(
            query.where_clause,
            "upper(incident_address) LIKE '123 WEST 45 STREET%' AND borough = 'MANHATTAN' \
             AND created_date > '2025-01-01T00:00:00.000'"
        );

        let history = client.history_query(&key);
        assert_eq!(
            history.where_clause,
            "upper(incident_address) LIKE '123 WEST 45 STREET%' AND borough = 'MANHATTAN'"
        );
    }

    #[test]
    fn test_date_parsing() {
        // ---
        assert_eq!(parse_socrata_date("2024-02-29T00:00:00.000"), NaiveDate::from_ymd_opt(2024, 2, 29));
        assert_eq!(parse_socrata_date("2024-02"), None);
        assert_eq!(parse_socrata_date("garbage-in"), None);
    }
}
