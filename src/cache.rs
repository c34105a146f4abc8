//! Per-property result cache with request coalescing.
//!
//! Entries are keyed by [`PropertyKey`] and hold the whole aggregate result.
//! A fresh entry short-circuits the pipeline; an expired one is a miss but is
//! kept as a stale fallback until capacity pressure evicts it. Concurrent
//! misses for the same key share one in-flight computation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::models::{DistressScore, PropertyKey, SignalRecord, SourceOutcomes};

// ---

/// Full result of one aggregation for a property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    // ---
    /// Key as resolved during the computation (may carry a BBL).
    pub key: PropertyKey,
    pub score: DistressScore,
    pub records: Vec<SignalRecord>,
    pub fetched_at: DateTime<Utc>,
    pub outcomes: SourceOutcomes,
}

/// Computes a fresh [`CacheEntry`] on a miss.
#[async_trait]
pub trait EntryProducer: Send + Sync {
    async fn produce(&self, key: &PropertyKey) -> Result<CacheEntry>;
}

/// What a lookup returned and how.
#[derive(Debug, Clone)]
pub struct CachedReport {
    // ---
    pub entry: Arc<CacheEntry>,
    /// Served from an expired entry because the refresh failed.
    pub stale: bool,
    pub cache_hit: bool,
}

#[derive(Debug, Clone)]
pub struct CachePolicy {
    // ---
    pub ttl: Duration,
    pub capacity: usize,
    pub serve_stale_on_error: bool,
}

impl From<&EngineConfig> for CachePolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            ttl: config.ttl(),
            capacity: config.cache_capacity,
            serve_stale_on_error: config.serve_stale_on_error,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    // ---
    pub entries: usize,
    pub expired: usize,
    pub capacity: usize,
    pub inflight: usize,
    pub ttl_seconds: u64,
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub stale_served: u64,
    pub evictions: u64,
}

type Computation = Shared<BoxFuture<'static, std::result::Result<Arc<CacheEntry>, EngineError>>>;

enum Lookup {
    Hit(Arc<CacheEntry>),
    Wait(Computation),
    Bypass(EngineError),
}

struct Slot {
    entry: Arc<CacheEntry>,
    stored_at: Instant,
    last_used: u64,
}

#[derive(Default)]
struct State {
    // ---
    slots: HashMap<PropertyKey, Slot>,
    inflight: HashMap<PropertyKey, Computation>,
    tick: u64,
    hits: u64,
    misses: u64,
    coalesced: u64,
    stale_served: u64,
    evictions: u64,
}

impl State {
    // ---
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn store(&mut self, key: PropertyKey, entry: Arc<CacheEntry>, capacity: usize) {
        // ---
        let last_used = self.touch();
        self.slots.insert(
            key,
            Slot {
                entry,
                stored_at: Instant::now(),
                last_used,
            },
        );
        while self.slots.len() > capacity {
            let victim = self
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(k, _)| k.clone());
            match victim {
                Some(victim) => {
                    debug!(key = %victim, "Evicting least recently used entry");
                    self.slots.remove(&victim);
                    self.evictions += 1;
                }
                None => break,
            }
        }
    }
}

pub struct ResultCache {
    // ---
    policy: CachePolicy,
    producer: Arc<dyn EntryProducer>,
    state: Arc<Mutex<State>>,
}

impl ResultCache {
    // ---
    pub fn new(policy: CachePolicy, producer: Arc<dyn EntryProducer>) -> Self {
        let policy = CachePolicy {
            capacity: policy.capacity.max(1),
            ..policy
        };
        Self {
            policy,
            producer,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| EngineError::CacheUnavailable("cache lock poisoned".to_string()))
    }

    /// Return the cached result for `key`, computing it at most once across
    /// concurrent callers when it is missing or expired.
    pub async fn get_or_compute(&self, key: &PropertyKey) -> Result<CachedReport> {
        // ---
        let lookup = match self.lock() {
            Ok(mut state) => self.lookup(&mut state, key),
            Err(e) => Lookup::Bypass(e),
        };

        let computation = match lookup {
            Lookup::Hit(entry) => {
                return Ok(CachedReport {
                    entry,
                    stale: false,
                    cache_hit: true,
                })
            }
            Lookup::Bypass(e) => return self.bypass(key, e).await,
            Lookup::Wait(computation) => computation,
        };

        match computation.await {
            Ok(entry) => Ok(CachedReport {
                entry,
                stale: false,
                cache_hit: false,
            }),
            Err(e) => self.stale_fallback(key, e),
        }
    }

    fn lookup(&self, state: &mut State, key: &PropertyKey) -> Lookup {
        // ---
        let tick = state.touch();
        if let Some(slot) = state.slots.get_mut(key) {
            if slot.stored_at.elapsed() <= self.policy.ttl {
                slot.last_used = tick;
                let entry = Arc::clone(&slot.entry);
                state.hits += 1;
                debug!(key = %key, "Cache hit");
                return Lookup::Hit(entry);
            }
        }

        state.misses += 1;
        if let Some(running) = state.inflight.get(key) {
            let running = running.clone();
            state.coalesced += 1;
            debug!(key = %key, "Joining in-flight computation");
            return Lookup::Wait(running);
        }

        let computation = self.start(key.clone());
        state.inflight.insert(key.clone(), computation.clone());
        Lookup::Wait(computation)
    }

    /// Build the shared computation for `key`. The producer runs on its own
    /// task, so it finishes, stores its result and retires the in-flight
    /// marker even when every waiter has gone away. Waiters only share the
    /// task's output.
    fn start(&self, key: PropertyKey) -> Computation {
        // ---
        let producer = Arc::clone(&self.producer);
        let state = Arc::clone(&self.state);
        let capacity = self.policy.capacity;

        let task = tokio::spawn({
            let key = key.clone();
            let state = Arc::clone(&state);
            async move {
                let result = producer.produce(&key).await.map(Arc::new);
                match state.lock() {
                    Ok(mut state) => {
                        state.inflight.remove(&key);
                        if let Ok(entry) = &result {
                            state.store(key.clone(), Arc::clone(entry), capacity);
                            info!(key = %key, "Cached aggregate result");
                        }
                    }
                    Err(_) => warn!(key = %key, "Cache lock poisoned, result not stored"),
                }
                result
            }
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    // The task panicked or the runtime is shutting down.
                    if let Ok(mut state) = state.lock() {
                        state.inflight.remove(&key);
                    }
                    error!(key = %key, error = %e, "Aggregate computation aborted");
                    Err(EngineError::CacheUnavailable(format!("computation task failed: {e}")))
                }
            }
        }
        .boxed()
        .shared()
    }

    fn stale_fallback(&self, key: &PropertyKey, error: EngineError) -> Result<CachedReport> {
        // ---
        if !self.policy.serve_stale_on_error || !matches!(error, EngineError::AllSourcesFailed(_)) {
            return Err(error);
        }
        let Ok(mut state) = self.lock() else {
            return Err(error);
        };
        let Some(entry) = state.slots.get(key).map(|slot| Arc::clone(&slot.entry)) else {
            return Err(error);
        };
        state.stale_served += 1;
        warn!(
            key = %key,
            fetched_at = %entry.fetched_at,
            error = %error,
            "Refresh failed, serving stale result"
        );
        Ok(CachedReport {
            entry,
            stale: true,
            cache_hit: true,
        })
    }

    async fn bypass(&self, key: &PropertyKey, error: EngineError) -> Result<CachedReport> {
        // ---
        warn!(key = %key, error = %error, "Cache unavailable, computing directly");
        let entry = self.producer.produce(key).await?;
        Ok(CachedReport {
            entry: Arc::new(entry),
            stale: false,
            cache_hit: false,
        })
    }

    /// Drop the entry for `key`. Returns whether one was present.
    pub fn invalidate(&self, key: &PropertyKey) -> Result<bool> {
        let removed = self.lock()?.slots.remove(key).is_some();
        info!(key = %key, removed, "Cache entry invalidated");
        Ok(removed)
    }

    /// Drop every entry. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        // ---
        let mut state = self.lock()?;
        let removed = state.slots.len();
        state.slots.clear();
        info!(removed, "Cache cleared");
        Ok(removed)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        // ---
        let state = self.lock()?;
        let expired = state
            .slots
            .values()
            .filter(|slot| slot.stored_at.elapsed() > self.policy.ttl)
            .count();
        Ok(CacheStats {
            entries: state.slots.len(),
            expired,
            capacity: self.policy.capacity,
            inflight: state.inflight.len(),
            ttl_seconds: self.policy.ttl.as_secs(),
            hits: state.hits,
            misses: state.misses,
            coalesced: state.coalesced,
            stale_served: state.stale_served,
            evictions: state.evictions,
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::address::resolve;
    use crate::models::{SourceName, SourceOutcome};
    use crate::scoring::score;
    use crate::sources::dob::{BreakerConfig, BreakerState, CircuitBreaker};
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingProducer {
        calls: AtomicUsize,
        failing: AtomicBool,
        delay: Duration,
    }

    impl CountingProducer {
        fn new(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
                delay: Duration::from_millis(delay_ms),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EntryProducer for CountingProducer {
        async fn produce(&self, key: &PropertyKey) -> Result<CacheEntry> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let mut outcomes = SourceOutcomes::new();
            if self.failing.load(Ordering::SeqCst) {
                outcomes.insert(SourceName::Hpd, SourceOutcome::Timeout);
                return Err(EngineError::AllSourcesFailed(outcomes));
            }
            outcomes.insert(SourceName::Hpd, SourceOutcome::Success { records: 0 });
            let as_of = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
            Ok(CacheEntry {
                key: key.clone(),
                score: score(&[], as_of),
                records: Vec::new(),
                fetched_at: Utc::now(),
                outcomes,
            })
        }
    }

    fn policy(capacity: usize) -> CachePolicy {
        CachePolicy {
            ttl: Duration::from_secs(3600),
            capacity,
            serve_stale_on_error: true,
        }
    }

    fn key(house: &str) -> PropertyKey {
        resolve(house, "Main St", "Brooklyn").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_computation() {
        // ---
        let producer = CountingProducer::new(500);
        let cache = ResultCache::new(policy(10), producer.clone());
        let key = key("1");

        let lookups = (0..8).map(|_| cache.get_or_compute(&key));
        let results = futures::future::join_all(lookups).await;

        assert_eq!(producer.calls(), 1);
        let first = results[0].as_ref().unwrap();
        for result in &results {
            let report = result.as_ref().unwrap();
            assert!(Arc::ptr_eq(&report.entry, &first.entry));
            assert!(!report.cache_hit);
        }

        let stats = cache.stats().unwrap();
        assert_eq!(stats.coalesced, 7);
        assert_eq!(stats.inflight, 0);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_shared_too() {
        // ---
        let producer = CountingProducer::new(100);
        producer.failing.store(true, Ordering::SeqCst);
        let cache = ResultCache::new(policy(10), producer.clone());
        let key = key("2");

        let (a, b) = futures::join!(cache.get_or_compute(&key), cache.get_or_compute(&key));
        assert!(matches!(a, Err(EngineError::AllSourcesFailed(_))));
        assert!(matches!(b, Err(EngineError::AllSourcesFailed(_))));
        assert_eq!(producer.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_then_expiry() {
        // ---
        let producer = CountingProducer::new(0);
        let cache = ResultCache::new(policy(10), producer.clone());
        let key = key("3");

        assert!(!cache.get_or_compute(&key).await.unwrap().cache_hit);
        assert!(cache.get_or_compute(&key).await.unwrap().cache_hit);
        assert_eq!(producer.calls(), 1);

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert_eq!(cache.stats().unwrap().expired, 1);
        let refreshed = cache.get_or_compute(&key).await.unwrap();
        assert!(!refreshed.cache_hit);
        assert_eq!(producer.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_served_when_refresh_fails() {
        // ---
        let producer = CountingProducer::new(0);
        let cache = ResultCache::new(policy(10), producer.clone());
        let key = key("4");
        let original = cache.get_or_compute(&key).await.unwrap();

        tokio::time::advance(Duration::from_secs(3601)).await;
        producer.failing.store(true, Ordering::SeqCst);

        let report = cache.get_or_compute(&key).await.unwrap();
        assert!(report.stale);
        assert!(Arc::ptr_eq(&report.entry, &original.entry));
        assert_eq!(cache.stats().unwrap().stale_served, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fallback_can_be_disabled() {
        // ---
        let producer = CountingProducer::new(0);
        let cache = ResultCache::new(
            CachePolicy {
                serve_stale_on_error: false,
                ..policy(10)
            },
            producer.clone(),
        );
        let key = key("5");
        cache.get_or_compute(&key).await.unwrap();

        tokio::time::advance(Duration::from_secs(3601)).await;
        producer.failing.store(true, Ordering::SeqCst);
        tokio_test::assert_err!(cache.get_or_compute(&key).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_eviction() {
        // ---
        let producer = CountingProducer::new(0);
        let cache = ResultCache::new(policy(2), producer.clone());
        let (a, b, c) = (key("10"), key("11"), key("12"));

        cache.get_or_compute(&a).await.unwrap();
        cache.get_or_compute(&b).await.unwrap();
        // Touch `a` so `b` becomes least recently used.
        assert!(cache.get_or_compute(&a).await.unwrap().cache_hit);
        cache.get_or_compute(&c).await.unwrap();

        assert!(cache.get_or_compute(&a).await.unwrap().cache_hit);
        assert!(!cache.get_or_compute(&b).await.unwrap().cache_hit);
        assert_eq!(cache.stats().unwrap().evictions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_clear() {
        // ---
        let producer = CountingProducer::new(0);
        let cache = ResultCache::new(policy(10), producer.clone());
        cache.get_or_compute(&key("20")).await.unwrap();
        cache.get_or_compute(&key("21")).await.unwrap();

        assert!(cache.invalidate(&key("20")).unwrap());
        assert!(!cache.invalidate(&key("20")).unwrap());
        assert_eq!(cache.clear().unwrap(), 1);
        assert_eq!(cache.stats().unwrap().entries, 0);
    }

    /// Holds a DOB breaker permit for the length of the computation.
    struct TrialProducer {
        breaker: Arc<CircuitBreaker>,
        inner: Arc<CountingProducer>,
    }

    #[async_trait]
    impl EntryProducer for TrialProducer {
        async fn produce(&self, key: &PropertyKey) -> Result<CacheEntry> {
            let permit = self.breaker.try_acquire();
            let entry = self.inner.produce(key).await;
            if let Ok(permit) = permit {
                permit.succeed();
            }
            entry
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_computation_finishes_after_every_waiter_leaves() {
        // ---
        let breaker = CircuitBreaker::new("dob", BreakerConfig::default());
        for _ in 0..5 {
            breaker.try_acquire().unwrap().fail();
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let inner = CountingProducer::new(1000);
        let producer = Arc::new(TrialProducer {
            breaker: Arc::clone(&breaker),
            inner: inner.clone(),
        });
        let cache = ResultCache::new(policy(10), producer);
        let key = key("40");

        let abandoned = tokio::time::timeout(Duration::from_millis(100), cache.get_or_compute(&key)).await;
        assert!(abandoned.is_err());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
        let stats = cache.stats().unwrap();
        assert_eq!(stats.inflight, 0);
        assert_eq!(stats.entries, 1);

        breaker.try_acquire().unwrap().succeed();
        assert!(cache.get_or_compute(&key).await.unwrap().cache_hit);
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test]
    async fn test_poisoned_cache_degrades_to_direct_computation() {
        // ---
        let producer = CountingProducer::new(0);
        let cache = ResultCache::new(policy(10), producer.clone());

        let state = Arc::clone(&cache.state);
        let _ = std::thread::spawn(move || {
            let _guard = state.lock().unwrap();
            panic!("poison the cache lock");
        })
        .join();

        let report = cache.get_or_compute(&key("30")).await.unwrap();
        assert!(!report.cache_hit);
        assert_eq!(producer.calls(), 1);
        assert!(matches!(cache.stats(), Err(EngineError::CacheUnavailable(_))));
    }
}
