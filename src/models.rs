//! Data models shared by the resolver, the sources, the scoring engine and
//! the cache.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AddressError;

// ---

/// The five NYC boroughs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Borough {
    // ---
    Manhattan,
    Bronx,
    Brooklyn,
    Queens,
    StatenIsland,
}

impl Borough {
    // ---
    pub const ALL: [Borough; 5] = [
        Borough::Manhattan,
        Borough::Bronx,
        Borough::Brooklyn,
        Borough::Queens,
        Borough::StatenIsland,
    ];

    /// Borough code used by DOB BIS and HPD (`boroid`).
    pub fn code(self) -> u8 {
        // ---
        match self {
            Borough::Manhattan => 1,
            Borough::Bronx => 2,
            Borough::Brooklyn => 3,
            Borough::Queens => 4,
            Borough::StatenIsland => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Borough> {
        Borough::ALL.into_iter().find(|b| b.code() == code)
    }

    pub fn name(self) -> &'static str {
        // ---
        match self {
            Borough::Manhattan => "Manhattan",
            Borough::Bronx => "Bronx",
            Borough::Brooklyn => "Brooklyn",
            Borough::Queens => "Queens",
            Borough::StatenIsland => "Staten Island",
        }
    }

    /// Upper-case form used by the 311 dataset.
    pub fn upper_name(self) -> &'static str {
        // ---
        match self {
            Borough::Manhattan => "MANHATTAN",
            Borough::Bronx => "BRONX",
            Borough::Brooklyn => "BROOKLYN",
            Borough::Queens => "QUEENS",
            Borough::StatenIsland => "STATEN ISLAND",
        }
    }
}

impl fmt::Display for Borough {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Borough {
    type Err = AddressError;

    /// Accepts borough names, county names, common short forms and the
    /// numeric borough codes, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        let normalized = s
            .trim()
            .to_ascii_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");

        let borough = match normalized.as_str() {
            "manhattan" | "new york" | "new york county" | "mn" | "1" => Borough::Manhattan,
            "bronx" | "the bronx" | "bx" | "2" => Borough::Bronx,
            "brooklyn" | "kings" | "kings county" | "bk" | "3" => Borough::Brooklyn,
            "queens" | "queens county" | "qn" | "4" => Borough::Queens,
            "staten island" | "richmond" | "richmond county" | "si" | "5" => {
                Borough::StatenIsland
            }
            _ => return Err(AddressError::UnknownBorough(s.trim().to_string())),
        };
        Ok(borough)
    }
}

/// Ten-digit borough-block-lot identifier (`B` + 5-digit block + 4-digit lot).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Bbl(String);

impl Bbl {
    // ---
    pub fn parse(raw: &str) -> Result<Bbl, AddressError> {
        // ---
        let raw = raw.trim();
        let valid = raw.len() == 10
            && raw.bytes().all(|b| b.is_ascii_digit())
            && matches!(raw.as_bytes()[0], b'1'..=b'5');
        if !valid {
            return Err(AddressError::InvalidBbl(raw.to_string()));
        }
        Ok(Bbl(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn borough_code(&self) -> &str {
        &self.0[..1]
    }

    /// Block number without leading zeros, as HPD stores it.
    pub fn block(&self) -> &str {
        trim_leading_zeros(&self.0[1..6])
    }

    /// Lot number without leading zeros.
    pub fn lot(&self) -> &str {
        trim_leading_zeros(&self.0[6..10])
    }
}

fn trim_leading_zeros(s: &str) -> &str {
    // ---
    let trimmed = s.trim_start_matches('0');
    if trimmed.is_empty() {
        "0"
    } else {
        trimmed
    }
}

impl fmt::Display for Bbl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical identity of a physical property, used to query and to join
/// results across sources.
///
/// Equality and hashing consider only borough, street and house number. The
/// optional BBL is precision for later queries and never changes identity.
#[derive(Debug, Clone, Serialize)]
pub struct PropertyKey {
    // ---
    borough: Borough,
    street: String,
    house_number: String,
    bbl: Option<Bbl>,
}

impl PropertyKey {
    // ---
    /// Build a key from already-normalized parts. Use
    /// [`crate::address::resolve`] for raw user input.
    pub(crate) fn from_normalized(borough: Borough, street: String, house_number: String) -> Self {
        // ---
        PropertyKey {
            borough,
            street,
            house_number,
            bbl: None,
        }
    }

    /// Returns a new key carrying `bbl`.
    pub fn with_bbl(&self, bbl: Bbl) -> PropertyKey {
        // ---
        PropertyKey {
            bbl: Some(bbl),
            ..self.clone()
        }
    }

    pub fn borough(&self) -> Borough {
        self.borough
    }

    pub fn street(&self) -> &str {
        &self.street
    }

    pub fn house_number(&self) -> &str {
        &self.house_number
    }

    pub fn bbl(&self) -> Option<&Bbl> {
        self.bbl.as_ref()
    }

    /// Human-facing form, e.g. `123 WEST 45 STREET, MANHATTAN`.
    pub fn formatted(&self) -> String {
        // ---
        format!(
            "{} {}, {}",
            self.house_number.to_ascii_uppercase(),
            self.street.to_ascii_uppercase(),
            self.borough.upper_name()
        )
    }
}

impl PartialEq for PropertyKey {
    fn eq(&self, other: &Self) -> bool {
        self.borough == other.borough
            && self.street == other.street
            && self.house_number == other.house_number
    }
}

impl Eq for PropertyKey {}

impl Hash for PropertyKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.borough.hash(state);
        self.street.hash(state);
        self.house_number.hash(state);
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.borough.code(),
            self.street,
            self.house_number
        )
    }
}

/// Category of a piece of evidence.
///
/// Variants are declared from least to most severe so the derived ordering is
/// the severity order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    // ---
    Complaint311,
    HpdViolationClassA,
    DobViolation,
    HpdViolationClassB,
    HpdViolationClassC,
    DobStopWorkOrder,
    DobVacateOrder,
}

impl SignalKind {
    // ---
    pub fn source(self) -> SourceName {
        // ---
        match self {
            SignalKind::Complaint311 => SourceName::Nyc311,
            SignalKind::DobViolation | SignalKind::DobStopWorkOrder | SignalKind::DobVacateOrder => {
                SourceName::Dob
            }
            SignalKind::HpdViolationClassA
            | SignalKind::HpdViolationClassB
            | SignalKind::HpdViolationClassC => SourceName::Hpd,
        }
    }

    pub fn label(self) -> &'static str {
        // ---
        match self {
            SignalKind::Complaint311 => "311 complaint",
            SignalKind::HpdViolationClassA => "HPD Class A violation",
            SignalKind::DobViolation => "DOB violation",
            SignalKind::HpdViolationClassB => "HPD Class B violation",
            SignalKind::HpdViolationClassC => "HPD Class C violation",
            SignalKind::DobStopWorkOrder => "Stop Work Order",
            SignalKind::DobVacateOrder => "Vacate Order",
        }
    }

    pub fn is_complaint(self) -> bool {
        self == SignalKind::Complaint311
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    // ---
    Open,
    Closed,
    Resolved,
}

impl SignalStatus {
    pub fn is_open(self) -> bool {
        self == SignalStatus::Open
    }
}

/// One normalized unit of evidence about a property.
///
/// Records are produced once per fetch and never updated in place; a re-fetch
/// yields a new set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalRecord {
    // ---
    pub kind: SignalKind,
    /// Source-native identifier, unique within `kind.source()`.
    pub source_id: String,
    pub description: String,
    /// Date the record was filed or observed. `None` when the source gives no
    /// date (ongoing orders).
    pub date: Option<NaiveDate>,
    pub status: SignalStatus,
    /// Date of the current status (closure date for closed records).
    pub status_date: Option<NaiveDate>,
    /// Severity class as the source reports it (HPD class, 311 category, ...).
    pub severity: String,
}

impl SignalRecord {
    // ---
    /// Date used to age a closed record: closure date, else filing date.
    pub fn closed_on(&self) -> Option<NaiveDate> {
        self.status_date.or(self.date)
    }

    /// Latest date known for this record.
    pub fn last_seen(&self) -> Option<NaiveDate> {
        self.date.max(self.status_date)
    }
}

/// 311 complaint buckets, stored as the record's severity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComplaintCategory {
    // ---
    IllegalConversion,
    HeatWater,
    NoiseResidential,
    Other,
}

impl ComplaintCategory {
    // ---
    const ILLEGAL_CONVERSION_KEYWORDS: &'static [&'static str] =
        &["illegal conversion", "illegal alteration", "illegal use"];
    const HEAT_WATER_KEYWORDS: &'static [&'static str] =
        &["heat/hot water", "heating", "hot water", "no heat", "no hot water"];
    const NOISE_KEYWORDS: &'static [&'static str] =
        &["noise - residential", "noise residential", "loud music/party"];

    /// Classify a 311 `complaint_type` (and optionally its descriptor).
    pub fn classify(text: &str) -> ComplaintCategory {
        // ---
        let lower = text.to_lowercase();
        let has = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));
        if has(Self::ILLEGAL_CONVERSION_KEYWORDS) {
            ComplaintCategory::IllegalConversion
        } else if has(Self::HEAT_WATER_KEYWORDS) {
            ComplaintCategory::HeatWater
        } else if has(Self::NOISE_KEYWORDS) {
            ComplaintCategory::NoiseResidential
        } else {
            ComplaintCategory::Other
        }
    }

    pub fn as_str(self) -> &'static str {
        // ---
        match self {
            ComplaintCategory::IllegalConversion => "illegal_conversion",
            ComplaintCategory::HeatWater => "heat_water",
            ComplaintCategory::NoiseResidential => "noise_residential",
            ComplaintCategory::Other => "other",
        }
    }

    pub fn from_severity(severity: &str) -> ComplaintCategory {
        // ---
        match severity {
            "illegal_conversion" => ComplaintCategory::IllegalConversion,
            "heat_water" => ComplaintCategory::HeatWater,
            "noise_residential" => ComplaintCategory::NoiseResidential,
            _ => ComplaintCategory::Other,
        }
    }
}

/// Upstream data sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceName {
    // ---
    #[serde(rename = "311")]
    Nyc311,
    #[serde(rename = "hpd")]
    Hpd,
    #[serde(rename = "dob")]
    Dob,
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let name = match self {
            SourceName::Nyc311 => "311",
            SourceName::Hpd => "hpd",
            SourceName::Dob => "dob",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    // ---
    Unavailable,
    DataError,
    CircuitOpen,
    ScrapeTimeout,
    ScrapeError,
}

/// What happened to one source during an aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    // ---
    Success { records: usize },
    Failed { kind: FailureKind, message: String },
    /// Still pending when the request deadline elapsed.
    Timeout,
}

impl SourceOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SourceOutcome::Success { .. })
    }
}

/// Per-source outcome map, ordered by source for stable output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceOutcomes(BTreeMap<SourceName, SourceOutcome>);

impl SourceOutcomes {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source: SourceName, outcome: SourceOutcome) {
        self.0.insert(source, outcome);
    }

    pub fn get(&self, source: SourceName) -> Option<&SourceOutcome> {
        self.0.get(&source)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SourceName, &SourceOutcome)> {
        self.0.iter()
    }

    pub fn any_success(&self) -> bool {
        self.0.values().any(SourceOutcome::is_success)
    }

    /// True when at least one source did not succeed.
    pub fn is_partial(&self) -> bool {
        self.0.values().any(|o| !o.is_success())
    }

    pub fn failed_sources(&self) -> Vec<SourceName> {
        // ---
        self.0
            .iter()
            .filter(|(_, o)| !o.is_success())
            .map(|(s, _)| *s)
            .collect()
    }
}

impl fmt::Display for SourceOutcomes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(source, outcome)| match outcome {
                SourceOutcome::Success { records } => format!("{source}: ok ({records})"),
                SourceOutcome::Failed { message, .. } => format!("{source}: {message}"),
                SourceOutcome::Timeout => format!("{source}: timeout"),
            })
            .collect();
        f.write_str(&parts.join(", "))
    }
}

/// Coarse band of a distress score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DistressLevel {
    // ---
    Low,
    Moderate,
    High,
    Critical,
}

impl DistressLevel {
    // ---
    /// 0-25 LOW, 26-50 MODERATE, 51-75 HIGH, 76-100 CRITICAL.
    pub fn from_score(score: f64) -> DistressLevel {
        // ---
        if score <= 25.0 {
            DistressLevel::Low
        } else if score <= 50.0 {
            DistressLevel::Moderate
        } else if score <= 75.0 {
            DistressLevel::High
        } else {
            DistressLevel::Critical
        }
    }

    pub fn as_str(self) -> &'static str {
        // ---
        match self {
            DistressLevel::Low => "LOW",
            DistressLevel::Moderate => "MODERATE",
            DistressLevel::High => "HIGH",
            DistressLevel::Critical => "CRITICAL",
        }
    }
}

/// Weighted contribution of a single record to the score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contribution {
    // ---
    pub kind: SignalKind,
    pub source_id: String,
    pub description: String,
    pub date: Option<NaiveDate>,
    pub status: SignalStatus,
    pub base_weight: f64,
    pub decay: f64,
    pub weight: f64,
}

/// Roll-up of all records of one kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryTotal {
    // ---
    pub kind: SignalKind,
    pub count: usize,
    pub open: usize,
    pub weight: f64,
}

/// Explainable distress score derived purely from a set of records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistressScore {
    // ---
    /// Score in `[0, 100]`.
    pub score: f64,
    pub level: DistressLevel,
    /// Sum of weighted contributions before compression.
    pub raw: f64,
    /// Top contributions, strongest first.
    pub contributions: Vec<Contribution>,
    /// Per-kind totals, most severe kind first.
    pub categories: Vec<CategoryTotal>,
    pub summary: String,
}

impl DistressScore {
    // ---
    pub fn category(&self, kind: SignalKind) -> Option<&CategoryTotal> {
        self.categories.iter().find(|c| c.kind == kind)
    }

    /// Number of open records of `kind`.
    pub fn open_count(&self, kind: SignalKind) -> usize {
        self.category(kind).map_or(0, |c| c.open)
    }

    pub fn count(&self, kind: SignalKind) -> usize {
        self.category(kind).map_or(0, |c| c.count)
    }
}

/// Analysis of one property as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyReport {
    // ---
    /// Normalized address, e.g. `123 WEST 45 STREET, MANHATTAN`.
    pub address: String,
    pub key: PropertyKey,
    pub bbl: Option<String>,
    pub score: f64,
    pub level: DistressLevel,
    pub summary: String,
    pub details: DistressScore,
    pub outcomes: SourceOutcomes,
    /// At least one source failed; the score may under-report.
    pub partial_data: bool,
    /// Served from an expired cache entry after a failed refresh.
    pub stale: bool,
    pub cache_hit: bool,
    pub last_updated: DateTime<Utc>,
    pub signals: Vec<SignalRecord>,
}

impl PropertyReport {
    // ---
    /// Single-line rendering for LLM agents.
    pub fn agent_summary(&self) -> String {
        // ---
        let yes_no = |kind: SignalKind| {
            if self.details.open_count(kind) > 0 {
                "YES"
            } else {
                "NO"
            }
        };
        let class_c = self.details.open_count(SignalKind::HpdViolationClassC);
        let hpd_total = self.details.open_count(SignalKind::HpdViolationClassA)
            + self.details.open_count(SignalKind::HpdViolationClassB)
            + class_c;

        let mut line = format!(
            "Score: {}/100. Signals: Vacate Order ({}), Stop Work Order ({}), 311 Complaints ({}), \
             DOB Violations ({}), HPD Violations ({}, Class C: {}). Status: {}.",
            self.score,
            yes_no(SignalKind::DobVacateOrder),
            yes_no(SignalKind::DobStopWorkOrder),
            self.details.count(SignalKind::Complaint311),
            self.details.open_count(SignalKind::DobViolation),
            hpd_total,
            class_c,
            self.level.as_str()
        );
        if self.partial_data {
            line.push_str(" [PARTIAL DATA]");
        }
        line
    }
}
