//! Distress scoring.
//!
//! A pure function from a set of [`SignalRecord`]s to a [`DistressScore`]:
//!
//! 1. every record gets a base weight from its kind (311 complaints are further
//!    scaled by complaint category),
//! 2. closed or resolved records decay toward a floor with a half-life; open
//!    records keep full weight,
//! 3. the weighted sum is compressed into `[0, 100]` with
//!    `100 * (1 - e^(-raw / k))`,
//! 4. the strongest contributions are kept as the explanation.
//!
//! No I/O and no clock: the reference date is passed in, so equal inputs
//! always give equal scores regardless of record order.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;

use crate::models::{
    CategoryTotal, ComplaintCategory, Contribution, DistressLevel, DistressScore, SignalKind,
    SignalRecord,
};

// ---

/// Weights and curve parameters for the scoring engine.
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    // ---
    pub vacate_order: f64,
    pub stop_work_order: f64,
    pub hpd_class_c: f64,
    pub hpd_class_b: f64,
    pub dob_violation: f64,
    pub hpd_class_a: f64,
    pub complaint_311: f64,

    pub illegal_conversion_multiplier: f64,
    pub heat_water_multiplier: f64,
    pub noise_multiplier: f64,
    pub other_complaint_multiplier: f64,

    /// Weight fraction a closed record never decays below.
    pub decay_floor: f64,
    pub decay_half_life_days: f64,

    /// Saturation constant `k`; a raw sum of `k` maps to ~63.2.
    pub saturation_k: f64,

    /// Number of contributions kept in the breakdown.
    pub max_breakdown: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        // ---
        Self {
            vacate_order: 40.0,
            stop_work_order: 30.0,
            hpd_class_c: 20.0,
            hpd_class_b: 8.0,
            dob_violation: 5.0,
            hpd_class_a: 3.0,
            complaint_311: 1.5,
            illegal_conversion_multiplier: 3.0,
            heat_water_multiplier: 2.0,
            noise_multiplier: 1.0,
            other_complaint_multiplier: 1.0,
            decay_floor: 0.1,
            decay_half_life_days: 365.0,
            saturation_k: 50.0,
            max_breakdown: 10,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    config: ScoringConfig,
}

impl ScoringEngine {
    // ---
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Score `records` as of `as_of`.
    pub fn score(&self, records: &[SignalRecord], as_of: NaiveDate) -> DistressScore {
        // ---
        let mut contributions: Vec<Contribution> = records
            .iter()
            .map(|r| self.contribution(r, as_of))
            .collect();
        contributions.sort_by(rank);

        // Summing in rank order keeps the float result independent of input order.
        let raw: f64 = contributions.iter().map(|c| c.weight).sum();
        let score = self.compress(raw);
        let level = DistressLevel::from_score(score);

        let categories = categorize(&contributions);
        let summary = summarize(level, &categories, records);

        contributions.truncate(self.config.max_breakdown);

        DistressScore {
            score,
            level,
            raw,
            contributions,
            categories,
            summary,
        }
    }

    pub fn base_weight(&self, record: &SignalRecord) -> f64 {
        // ---
        let c = &self.config;
        match record.kind {
            SignalKind::DobVacateOrder => c.vacate_order,
            SignalKind::DobStopWorkOrder => c.stop_work_order,
            SignalKind::HpdViolationClassC => c.hpd_class_c,
            SignalKind::HpdViolationClassB => c.hpd_class_b,
            SignalKind::DobViolation => c.dob_violation,
            SignalKind::HpdViolationClassA => c.hpd_class_a,
            SignalKind::Complaint311 => {
                let multiplier = match ComplaintCategory::from_severity(&record.severity) {
                    ComplaintCategory::IllegalConversion => c.illegal_conversion_multiplier,
                    ComplaintCategory::HeatWater => c.heat_water_multiplier,
                    ComplaintCategory::NoiseResidential => c.noise_multiplier,
                    ComplaintCategory::Other => c.other_complaint_multiplier,
                };
                c.complaint_311 * multiplier
            }
        }
    }

    /// Recency factor in `[decay_floor, 1]`.
    pub fn decay(&self, record: &SignalRecord, as_of: NaiveDate) -> f64 {
        // ---
        if record.status.is_open() {
            return 1.0;
        }
        let floor = self.config.decay_floor.clamp(0.0, 1.0);
        let Some(closed_on) = record.closed_on() else {
            return floor;
        };
        let age_days = (as_of - closed_on).num_days().max(0) as f64;
        let half_life = self.config.decay_half_life_days.max(1.0);
        floor + (1.0 - floor) * 0.5_f64.powf(age_days / half_life)
    }

    /// Monotonic saturating map from raw weight to `[0, 100]`, rounded to one
    /// decimal place. `compress(0.0) == 0.0`.
    pub fn compress(&self, raw: f64) -> f64 {
        // ---
        if raw <= 0.0 || !raw.is_finite() {
            return if raw == f64::INFINITY { 100.0 } else { 0.0 };
        }
        let k = self.config.saturation_k.max(f64::EPSILON);
        let score = 100.0 * (1.0 - (-raw / k).exp());
        ((score * 10.0).round() / 10.0).clamp(0.0, 100.0)
    }

    fn contribution(&self, record: &SignalRecord, as_of: NaiveDate) -> Contribution {
        // ---
        let base_weight = self.base_weight(record).max(0.0);
        let decay = self.decay(record, as_of);
        Contribution {
            kind: record.kind,
            source_id: record.source_id.clone(),
            description: record.description.clone(),
            date: record.date,
            status: record.status,
            base_weight,
            decay,
            weight: base_weight * decay,
        }
    }
}

/// Score with the default configuration.
pub fn score(records: &[SignalRecord], as_of: NaiveDate) -> DistressScore {
    ScoringEngine::default().score(records, as_of)
}

/// Breakdown order: strongest contribution first, then most recent date,
/// then most severe kind. Remaining keys only make the order total.
fn rank(a: &Contribution, b: &Contribution) -> Ordering {
    // ---
    b.weight
        .total_cmp(&a.weight)
        .then_with(|| b.date.cmp(&a.date))
        .then_with(|| b.kind.cmp(&a.kind))
        .then_with(|| a.source_id.cmp(&b.source_id))
        .then_with(|| a.status.cmp(&b.status))
        .then_with(|| a.description.cmp(&b.description))
}

fn categorize(ranked: &[Contribution]) -> Vec<CategoryTotal> {
    // ---
    let mut by_kind: BTreeMap<SignalKind, CategoryTotal> = BTreeMap::new();
    for c in ranked {
        let total = by_kind.entry(c.kind).or_insert(CategoryTotal {
            kind: c.kind,
            count: 0,
            open: 0,
            weight: 0.0,
        });
        total.count += 1;
        total.open += usize::from(c.status.is_open());
        total.weight += c.weight;
    }
    by_kind.into_values().rev().collect()
}

fn summarize(level: DistressLevel, categories: &[CategoryTotal], records: &[SignalRecord]) -> String {
    // ---
    let open = |kind: SignalKind| {
        categories
            .iter()
            .find(|c| c.kind == kind)
            .map_or(0, |c| c.open)
    };

    let mut complaints: HashMap<ComplaintCategory, usize> = HashMap::new();
    for r in records.iter().filter(|r| r.kind.is_complaint()) {
        *complaints
            .entry(ComplaintCategory::from_severity(&r.severity))
            .or_insert(0) += 1;
    }
    let complaint_count = |cat: ComplaintCategory| complaints.get(&cat).copied().unwrap_or(0);

    let mut signals = Vec::new();
    if open(SignalKind::DobVacateOrder) > 0 {
        signals.push("Active Vacate Order".to_string());
    }
    let class_c = open(SignalKind::HpdViolationClassC);
    if class_c > 0 {
        signals.push(format!("{class_c} HPD Class C (immediately hazardous) violations"));
    }
    if open(SignalKind::DobStopWorkOrder) > 0 {
        signals.push("Active Stop Work Order".to_string());
    }
    let class_b = open(SignalKind::HpdViolationClassB);
    if class_b >= 5 {
        signals.push(format!("{class_b} HPD Class B (hazardous) violations"));
    }
    let illegal = complaint_count(ComplaintCategory::IllegalConversion);
    if illegal > 2 {
        signals.push(format!("{illegal} illegal conversion complaints"));
    }
    let heat = complaint_count(ComplaintCategory::HeatWater);
    if heat > 0 {
        signals.push(format!("{heat} heat/hot water complaints"));
    }
    let dob = open(SignalKind::DobViolation);
    if dob > 0 {
        signals.push(format!("{dob} open DOB violations"));
    }

    let label = level.as_str();
    if signals.is_empty() {
        return format!("{label} RISK: No significant distress signals detected.");
    }
    let found = signals.join(", ");
    let tail = match level {
        DistressLevel::Critical => "Property shows severe distress indicators.",
        DistressLevel::High => "Property shows significant distress.",
        DistressLevel::Moderate => "Property warrants further investigation.",
        DistressLevel::Low => "Minor concerns only.",
    };
    format!("{label} RISK: {found} found. {tail}")
}
