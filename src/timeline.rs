//! Chronological view of a property's signal records.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::models::{SignalKind, SignalRecord, SignalStatus, SourceName};

// ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEvent {
    // ---
    pub date: Option<NaiveDate>,
    pub source: SourceName,
    pub kind: SignalKind,
    pub source_id: String,
    pub description: String,
    pub status: SignalStatus,
}

/// Counts for one `YYYY-MM` bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonthSummary {
    // ---
    pub complaint_count: usize,
    pub violation_count: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timeline {
    // ---
    /// Newest first; undated events (ongoing orders) last.
    pub events: Vec<TimelineEvent>,
    pub monthly: BTreeMap<String, MonthSummary>,
    pub earliest: Option<NaiveDate>,
    pub latest: Option<NaiveDate>,
}

impl Timeline {
    // ---
    pub fn from_records(records: &[SignalRecord]) -> Timeline {
        // ---
        let mut events: Vec<TimelineEvent> = records
            .iter()
            .map(|r| TimelineEvent {
                date: r.date,
                source: r.kind.source(),
                kind: r.kind,
                source_id: r.source_id.clone(),
                description: r.description.clone(),
                status: r.status,
            })
            .collect();

        // `None` sorts before `Some`, so reversing the date order puts undated
        // events at the end.
        events.sort_by(|a, b| {
            b.date
                .cmp(&a.date)
                .then_with(|| b.kind.cmp(&a.kind))
                .then_with(|| a.source.cmp(&b.source))
                .then_with(|| a.source_id.cmp(&b.source_id))
        });

        let mut monthly: BTreeMap<String, MonthSummary> = BTreeMap::new();
        for event in &events {
            let Some(date) = event.date else { continue };
            let bucket = monthly.entry(date.format("%Y-%m").to_string()).or_default();
            if event.kind.is_complaint() {
                bucket.complaint_count += 1;
            } else {
                bucket.violation_count += 1;
            }
            bucket.total += 1;
        }

        let dates = || events.iter().filter_map(|e| e.date);
        let earliest = dates().min();
        let latest = dates().max();

        Timeline {
            events,
            monthly,
            earliest,
            latest,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn record(kind: SignalKind, id: &str, date: Option<(i32, u32, u32)>) -> SignalRecord {
        SignalRecord {
            kind,
            source_id: id.to_string(),
            description: id.to_string(),
            date: date.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            status: SignalStatus::Open,
            status_date: None,
            severity: String::new(),
        }
    }

    #[test]
    fn test_events_newest_first_with_monthly_buckets() {
        // ---
        let timeline = Timeline::from_records(&[
            record(SignalKind::Complaint311, "c1", Some((2024, 3, 2))),
            record(SignalKind::DobVacateOrder, "v", None),
            record(SignalKind::HpdViolationClassB, "h1", Some((2024, 3, 20))),
            record(SignalKind::Complaint311, "c2", Some((2025, 1, 9))),
            record(SignalKind::Complaint311, "c3", Some((2024, 3, 28))),
        ]);

        let ids: Vec<&str> = timeline.events.iter().map(|e| e.source_id.as_str()).collect();
        assert_eq!(ids, vec!["c2", "c3", "h1", "c1", "v"]);

        assert_eq!(
            timeline.monthly["2024-03"],
            MonthSummary {
                complaint_count: 2,
                violation_count: 1,
                total: 3,
            }
        );
        assert_eq!(timeline.monthly["2025-01"].total, 1);
        assert_eq!(timeline.monthly.len(), 2);
        assert_eq!(timeline.earliest, NaiveDate::from_ymd_opt(2024, 3, 2));
        assert_eq!(timeline.latest, NaiveDate::from_ymd_opt(2025, 1, 9));
    }

    #[test]
    fn test_empty_timeline() {
        // ---
        let timeline = Timeline::from_records(&[]);
        assert!(timeline.is_empty());
        assert!(timeline.monthly.is_empty());
        assert_eq!(timeline.earliest, None);
    }
}
