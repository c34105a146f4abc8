//! Concurrent fan-out over the signal sources.
//!
//! Every source runs in parallel under its own timeout and the shared request
//! deadline. A source failure is recorded in the outcome map and never fails
//! the aggregation on its own; only when no source succeeds is the whole
//! request an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::models::{PropertyKey, SignalRecord, SourceName, SourceOutcome, SourceOutcomes};
use crate::sources::SignalSource;

// ---

/// Merged records plus what happened to each source.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    // ---
    pub records: Vec<SignalRecord>,
    pub outcomes: SourceOutcomes,
}

pub struct Aggregator {
    // ---
    sources: Vec<Arc<dyn SignalSource>>,
    source_timeout: Duration,
    request_deadline: Duration,
}

impl Aggregator {
    // ---
    pub fn new(sources: Vec<Arc<dyn SignalSource>>, source_timeout: Duration, request_deadline: Duration) -> Self {
        Self {
            sources,
            source_timeout,
            request_deadline,
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn request_deadline(&self) -> Duration {
        self.request_deadline
    }

    pub async fn aggregate(&self, key: &PropertyKey) -> Result<Aggregate> {
        self.aggregate_until(key, Instant::now() + self.request_deadline).await
    }

    /// Fan out under a request deadline that may already be partly spent.
    pub async fn aggregate_until(&self, key: &PropertyKey, deadline: Instant) -> Result<Aggregate> {
        // ---
        let started = Instant::now();
        let source_deadline = deadline.min(started + self.source_timeout);

        let fetches = self.sources.iter().map(|source| {
            let source = Arc::clone(source);
            async move {
                let name = source.name();
                let outcome = timeout_at(source_deadline, source.fetch(key)).await;
                (name, outcome)
            }
        });

        let mut outcomes = SourceOutcomes::new();
        let mut fetched = Vec::new();
        for (name, result) in join_all(fetches).await {
            match result {
                Ok(Ok(records)) => {
                    outcomes.insert(name, SourceOutcome::Success { records: records.len() });
                    fetched.extend(records);
                }
                Ok(Err(e)) => {
                    warn!(key = %key, source = %name, error = %e, "Source failed");
                    outcomes.insert(
                        name,
                        SourceOutcome::Failed {
                            kind: e.kind(),
                            message: e.to_string(),
                        },
                    );
                }
                Err(_) => {
                    warn!(key = %key, source = %name, "Source cancelled at deadline");
                    outcomes.insert(name, SourceOutcome::Timeout);
                }
            }
        }

        if !outcomes.any_success() {
            warn!(key = %key, outcomes = %outcomes, "All sources failed");
            return Err(EngineError::AllSourcesFailed(outcomes));
        }

        let records = merge(fetched);
        info!(
            key = %key,
            outcomes = %outcomes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Aggregated {} records",
            records.len()
        );
        Ok(Aggregate { records, outcomes })
    }

    /// Fan out [`SignalSource::fetch_history`] under the usual deadlines.
    /// Never fails; sources that error or time out are listed in
    /// [`History::failed`].
    pub async fn history(&self, key: &PropertyKey) -> History {
        // ---
        let started = Instant::now();
        let source_deadline = (started + self.request_deadline).min(started + self.source_timeout);

        let fetches = self.sources.iter().map(|source| {
            let source = Arc::clone(source);
            async move {
                let name = source.name();
                (name, timeout_at(source_deadline, source.fetch_history(key)).await)
            }
        });

        let mut history = History::default();
        for (name, result) in join_all(fetches).await {
            match result {
                Ok(Ok(Some(records))) => {
                    history.replaced.push(name);
                    history.records.extend(records);
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    warn!(key = %key, source = %name, error = %e, "History fetch failed");
                    history.failed.push(name);
                }
                Err(_) => {
                    warn!(key = %key, source = %name, "History fetch cancelled at deadline");
                    history.failed.push(name);
                }
            }
        }
        history
    }
}

/// Full-history records from the sources whose regular fetch is windowed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    // ---
    pub records: Vec<SignalRecord>,
    /// Sources whose history replaces their windowed records.
    pub replaced: Vec<SourceName>,
    /// Sources whose history could not be fetched.
    pub failed: Vec<SourceName>,
}

impl History {
    /// Swap the windowed records of every replaced source for its history.
    pub fn apply(self, records: &[SignalRecord]) -> Vec<SignalRecord> {
        // ---
        let mut combined: Vec<SignalRecord> = records
            .iter()
            .filter(|r| !self.replaced.contains(&r.kind.source()))
            .cloned()
            .collect();
        combined.extend(self.records);
        merge(combined)
    }
}

/// Collapse records sharing `(source, source_id)` and put the survivors in a
/// canonical order. The result does not depend on input order.
pub fn merge(records: Vec<SignalRecord>) -> Vec<SignalRecord> {
    // ---
    let mut by_identity: HashMap<(SourceName, String), SignalRecord> = HashMap::new();
    for record in records {
        let identity = (record.kind.source(), record.source_id.clone());
        match by_identity.get(&identity) {
            Some(existing) if !supersedes(&record, existing) => {}
            _ => {
                by_identity.insert(identity, record);
            }
        }
    }

    let mut merged: Vec<SignalRecord> = by_identity.into_values().collect();
    merged.sort_by(|a, b| {
        b.date
            .cmp(&a.date)
            .then_with(|| b.kind.cmp(&a.kind))
            .then_with(|| a.source_id.cmp(&b.source_id))
    });
    merged
}

/// True when `candidate` carries a more recent observation than `current`.
/// Ties fall through to the later lifecycle status, then the field values, so
/// the winner is the same whichever record arrives first.
fn supersedes(candidate: &SignalRecord, current: &SignalRecord) -> bool {
    // ---
    candidate
        .last_seen()
        .cmp(&current.last_seen())
        .then_with(|| candidate.status.cmp(&current.status))
        .then_with(|| candidate.kind.cmp(&current.kind))
        .then_with(|| candidate.date.cmp(&current.date))
        .then_with(|| candidate.description.cmp(&current.description))
        .then_with(|| candidate.severity.cmp(&current.severity))
        .is_gt()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::address::resolve;
    use crate::error::SourceError;
    use crate::models::{FailureKind, SignalKind, SignalStatus};
    use async_trait::async_trait;
    use chrono::NaiveDate;

    struct FakeSource {
        name: SourceName,
        delay: Duration,
        result: std::result::Result<Vec<SignalRecord>, SourceError>,
    }

    #[async_trait]
    impl SignalSource for FakeSource {
        fn name(&self) -> SourceName {
            self.name
        }

        async fn fetch(&self, _key: &PropertyKey) -> std::result::Result<Vec<SignalRecord>, SourceError> {
            tokio::time::sleep(self.delay).await;
            self.result.clone()
        }
    }

    fn source(
        name: SourceName,
        delay_secs: u64,
        result: std::result::Result<Vec<SignalRecord>, SourceError>,
    ) -> Arc<dyn SignalSource> {
        Arc::new(FakeSource {
            name,
            delay: Duration::from_secs(delay_secs),
            result,
        })
    }

    fn record(kind: SignalKind, id: &str, date: (i32, u32, u32), status: SignalStatus) -> SignalRecord {
        SignalRecord {
            kind,
            source_id: id.to_string(),
            description: format!("{} {}", kind.label(), id),
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2),
            status,
            status_date: None,
            severity: String::new(),
        }
    }

    fn aggregator(sources: Vec<Arc<dyn SignalSource>>) -> Aggregator {
        Aggregator::new(sources, Duration::from_secs(8), Duration::from_secs(10))
    }

    fn key() -> PropertyKey {
        resolve("123", "Main St", "Brooklyn").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_success_when_dob_circuit_open() {
        // ---
        let agg = aggregator(vec![
            source(
                SourceName::Nyc311,
                1,
                Ok(vec![record(SignalKind::Complaint311, "1", (2025, 1, 5), SignalStatus::Open)]),
            ),
            source(
                SourceName::Hpd,
                2,
                Ok(vec![record(SignalKind::HpdViolationClassB, "77", (2024, 6, 1), SignalStatus::Open)]),
            ),
            source(SourceName::Dob, 0, Err(SourceError::CircuitOpen)),
        ]);

        let result = agg.aggregate(&key()).await.unwrap();
        assert_eq!(result.records.len(), 2);
        assert!(result.outcomes.is_partial());
        assert_eq!(result.outcomes.failed_sources(), vec![SourceName::Dob]);
        assert!(matches!(
            result.outcomes.get(SourceName::Dob),
            Some(SourceOutcome::Failed {
                kind: FailureKind::CircuitOpen,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_sources_failed() {
        // ---
        let agg = aggregator(vec![
            source(SourceName::Nyc311, 0, Err(SourceError::Unavailable("503".into()))),
            source(SourceName::Hpd, 0, Err(SourceError::DataError("not json".into()))),
            source(SourceName::Dob, 60, Ok(Vec::new())),
        ]);

        match agg.aggregate(&key()).await {
            Err(EngineError::AllSourcesFailed(outcomes)) => {
                assert_eq!(outcomes.get(SourceName::Dob), Some(&SourceOutcome::Timeout));
                assert_eq!(outcomes.failed_sources().len(), 3);
            }
            other => panic!("expected AllSourcesFailed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_is_cut_at_deadline() {
        // ---
        let agg = Aggregator::new(
            vec![
                source(SourceName::Nyc311, 1, Ok(Vec::new())),
                source(SourceName::Dob, 30, Ok(Vec::new())),
            ],
            Duration::from_secs(20),
            Duration::from_secs(5),
        );

        let started = Instant::now();
        let result = agg.aggregate(&key()).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(result.outcomes.get(SourceName::Dob), Some(&SourceOutcome::Timeout));
        assert_eq!(
            result.outcomes.get(SourceName::Nyc311),
            Some(&SourceOutcome::Success { records: 0 })
        );
    }

    #[test]
    fn test_merge_keeps_latest_status() {
        // ---
        let open = record(SignalKind::HpdViolationClassC, "9", (2024, 1, 1), SignalStatus::Open);
        let mut closed = open.clone();
        closed.status = SignalStatus::Closed;
        closed.status_date = NaiveDate::from_ymd_opt(2024, 3, 1);

        let merged = merge(vec![open.clone(), closed.clone()]);
        assert_eq!(merged, vec![closed.clone()]);
        assert_eq!(merge(vec![closed.clone(), open]), vec![closed]);
    }

    #[test]
    fn test_merge_is_order_independent() {
        // ---
        let records = vec![
            record(SignalKind::Complaint311, "1", (2025, 1, 5), SignalStatus::Open),
            record(SignalKind::DobViolation, "A1", (2023, 2, 2), SignalStatus::Resolved),
            record(SignalKind::HpdViolationClassA, "2", (2025, 1, 5), SignalStatus::Closed),
            record(SignalKind::Complaint311, "1", (2025, 1, 5), SignalStatus::Closed),
            record(SignalKind::DobStopWorkOrder, "x:swo", (2020, 1, 1), SignalStatus::Open),
        ];
        let mut reversed = records.clone();
        reversed.reverse();

        let forward = merge(records);
        assert_eq!(forward, merge(reversed));
        assert_eq!(forward.len(), 4);
        assert_eq!(forward[0].kind, SignalKind::HpdViolationClassA);
        assert_eq!(forward[1].status, SignalStatus::Closed);
    }

    #[test]
    fn test_same_id_in_different_sources_is_kept() {
        // ---
        let merged = merge(vec![
            record(SignalKind::Complaint311, "100", (2025, 1, 1), SignalStatus::Open),
            record(SignalKind::HpdViolationClassB, "100", (2025, 1, 1), SignalStatus::Open),
        ]);
        assert_eq!(merged.len(), 2);
    }

    struct LongMemorySource {
        history: std::result::Result<Vec<SignalRecord>, SourceError>,
    }

    #[async_trait]
    impl SignalSource for LongMemorySource {
        fn name(&self) -> SourceName {
            SourceName::Nyc311
        }

        async fn fetch(&self, _key: &PropertyKey) -> std::result::Result<Vec<SignalRecord>, SourceError> {
            Ok(vec![record(SignalKind::Complaint311, "new", (2025, 3, 1), SignalStatus::Open)])
        }

        async fn fetch_history(
            &self,
            _key: &PropertyKey,
        ) -> std::result::Result<Option<Vec<SignalRecord>>, SourceError> {
            self.history.clone().map(Some)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_replaces_windowed_records() {
        // ---
        let hpd = record(SignalKind::HpdViolationClassC, "9", (2024, 2, 1), SignalStatus::Open);
        let agg = aggregator(vec![
            Arc::new(LongMemorySource {
                history: Ok(vec![
                    record(SignalKind::Complaint311, "new", (2025, 3, 1), SignalStatus::Open),
                    record(SignalKind::Complaint311, "old", (2019, 8, 1), SignalStatus::Closed),
                ]),
            }),
            source(SourceName::Hpd, 0, Ok(vec![hpd.clone()])),
        ]);

        let windowed = agg.aggregate(&key()).await.unwrap();
        assert_eq!(windowed.records.len(), 2);

        let history = agg.history(&key()).await;
        assert_eq!(history.replaced, vec![SourceName::Nyc311]);
        assert!(history.failed.is_empty());

        let combined = history.apply(&windowed.records);
        let ids: Vec<&str> = combined.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "9", "old"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_history_keeps_windowed_records() {
        // ---
        let agg = aggregator(vec![Arc::new(LongMemorySource {
            history: Err(SourceError::Unavailable("HTTP 503".into())),
        })]);

        let windowed = agg.aggregate(&key()).await.unwrap();
        let history = agg.history(&key()).await;
        assert_eq!(history.failed, vec![SourceName::Nyc311]);
        assert_eq!(history.apply(&windowed.records), windowed.records);
    }
}
