//! HPD housing maintenance code violations (dataset `wvxf-dwi5`).
//!
//! Class A is non-hazardous, B hazardous, C immediately hazardous. Lookups go
//! by borough/block/lot when the key carries a BBL, otherwise by house number
//! and street.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::complaints_311::parse_socrata_date;
use super::socrata::{SocrataClient, SoqlQuery};
use super::{soql_literal, RetryPolicy, SignalSource};
use crate::error::SourceError;
use crate::models::{PropertyKey, SignalKind, SignalRecord, SignalStatus, SourceName};

// ---

#[derive(Debug, Deserialize)]
struct RawHpdViolation {
    // ---
    violationid: String,
    class: Option<String>,
    currentstatus: Option<String>,
    currentstatusdate: Option<String>,
    violationstatus: Option<String>,
    inspectiondate: Option<String>,
    novissueddate: Option<String>,
    novdescription: Option<String>,
}

impl RawHpdViolation {
    // ---
    fn to_record(&self) -> Option<SignalRecord> {
        // ---
        let class = self.class.as_deref().unwrap_or("").trim().to_ascii_uppercase();
        let kind = match class.as_str() {
            "A" => SignalKind::HpdViolationClassA,
            "B" => SignalKind::HpdViolationClassB,
            "C" => SignalKind::HpdViolationClassC,
            other => {
                debug!("Skipping HPD violation {} with class '{}'", self.violationid, other);
                return None;
            }
        };

        let description = self
            .novdescription
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or("HPD violation")
            .to_string();

        Some(SignalRecord {
            kind,
            source_id: self.violationid.trim().to_string(),
            description,
            date: self
                .inspectiondate
                .as_deref()
                .or(self.novissueddate.as_deref())
                .and_then(parse_socrata_date),
            status: self.status(),
            status_date: self.currentstatusdate.as_deref().and_then(parse_socrata_date),
            severity: class,
        })
    }

    /// `violationstatus` is authoritative when present (`Open` / `Close`);
    /// otherwise the free-text `currentstatus` is inspected. Empty status
    /// counts as open.
    fn status(&self) -> SignalStatus {
        // ---
        let current = self.currentstatus.as_deref().unwrap_or("").to_ascii_uppercase();
        let resolved = current.contains("DISMISS") || current.contains("CORRECTED") || current.contains("CERTIFIED");

        match self.violationstatus.as_deref().map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("close") || v.eq_ignore_ascii_case("closed") => {
                if resolved {
                    SignalStatus::Resolved
                } else {
                    SignalStatus::Closed
                }
            }
            Some(v) if v.eq_ignore_ascii_case("open") => SignalStatus::Open,
            _ if resolved => SignalStatus::Resolved,
            _ if current.contains("CLOSE") => SignalStatus::Closed,
            _ => SignalStatus::Open,
        }
    }
}

pub struct HpdClient {
    // ---
    socrata: SocrataClient,
    url: String,
    retry: RetryPolicy,
}

impl HpdClient {
    // ---
    pub fn new(socrata: SocrataClient, url: impl Into<String>) -> Self {
        Self {
            socrata,
            url: url.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn query(&self, key: &PropertyKey) -> SoqlQuery {
        // ---
        let where_clause = match key.bbl() {
            Some(bbl) => format!(
                "boroid = '{}' AND block = '{}' AND lot = '{}'",
                bbl.borough_code(),
                bbl.block(),
                bbl.lot()
            ),
            None => format!(
                "boroid = '{}' AND upper(housenumber) = '{}' AND upper(streetname) LIKE '%{}%'",
                key.borough().code(),
                soql_literal(&key.house_number().to_ascii_uppercase()),
                soql_literal(&key.street().to_ascii_uppercase())
            ),
        };
        SoqlQuery::new(where_clause).order_by("violationid")
    }
}

#[async_trait]
impl SignalSource for HpdClient {
    fn name(&self) -> SourceName {
        SourceName::Hpd
    }

    async fn fetch(&self, key: &PropertyKey) -> Result<Vec<SignalRecord>, SourceError> {
        // ---
        let query = self.query(key);
        let rows: Vec<RawHpdViolation> = self
            .retry
            .run(SourceName::Hpd, || self.socrata.fetch_rows(&self.url, &query))
            .await?;

        let records: Vec<SignalRecord> = rows
            .iter()
            .filter(|r| !r.violationid.trim().is_empty())
            .filter_map(RawHpdViolation::to_record)
            .collect();
        info!(key = %key, by_bbl = key.bbl().is_some(), "Found {} HPD violations", records.len());
        Ok(records)
    }
}
