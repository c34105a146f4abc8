//! `DistressEngine`: the resolve → cache → aggregate → score pipeline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::info;

use crate::address::{AddressResolver, GeoSearchGeocoder, Geocoder};
use crate::aggregator::{Aggregator, History};
use crate::cache::{CacheEntry, CachePolicy, CacheStats, CachedReport, EntryProducer, ResultCache};
use crate::config::Config;
use crate::error::Result;
use crate::models::{PropertyKey, PropertyReport};
use crate::scoring::{ScoringConfig, ScoringEngine};
use crate::sources::dob::{BreakerConfig, BreakerStatus, CircuitBreaker, HttpBrowserPool};
use crate::sources::{DobScraper, HpdClient, Nyc311Client, SignalSource, SocrataClient};
use crate::timeline::Timeline;

// ---

const PARTIAL_SUFFIX: &str = " [Some data sources unavailable]";

/// Cache-miss path: enrich the key, fan out to the sources, score.
pub struct Pipeline {
    // ---
    resolver: AddressResolver,
    aggregator: Aggregator,
    scoring: ScoringEngine,
}

impl Pipeline {
    // ---
    pub fn new(resolver: AddressResolver, aggregator: Aggregator, scoring: ScoringEngine) -> Self {
        Self {
            resolver,
            aggregator,
            scoring,
        }
    }

    /// Full history for the sources whose regular fetch is windowed.
    pub async fn history(&self, key: &PropertyKey) -> History {
        self.aggregator.history(key).await
    }
}

#[async_trait]
impl EntryProducer for Pipeline {
    async fn produce(&self, key: &PropertyKey) -> Result<CacheEntry> {
        // ---
        let deadline = Instant::now() + self.aggregator.request_deadline();
        let key = self.resolver.enrich_until(key, deadline).await;
        let aggregate = self.aggregator.aggregate_until(&key, deadline).await?;
        let score = self.scoring.score(&aggregate.records, Utc::now().date_naive());
        info!(
            key = %key,
            score = score.score,
            level = score.level.as_str(),
            partial = aggregate.outcomes.is_partial(),
            "Scored property"
        );
        Ok(CacheEntry {
            key,
            score,
            records: aggregate.records,
            fetched_at: Utc::now(),
            outcomes: aggregate.outcomes,
        })
    }
}

pub struct DistressEngine {
    // ---
    resolver: AddressResolver,
    pipeline: Arc<Pipeline>,
    cache: ResultCache,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl DistressEngine {
    // ---
    /// Assemble an engine from parts. `breaker` is only used for health
    /// reporting.
    pub fn new(pipeline: Arc<Pipeline>, policy: CachePolicy, breaker: Option<Arc<CircuitBreaker>>) -> Self {
        Self {
            resolver: AddressResolver::local(),
            cache: ResultCache::new(policy, Arc::clone(&pipeline) as Arc<dyn EntryProducer>),
            pipeline,
            breaker,
        }
    }

    /// Wire the live sources described by `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        // ---
        let engine = &config.engine;
        let sources = &config.sources;

        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(engine.source_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        let socrata = SocrataClient::new(
            http.clone(),
            sources.app_token.clone(),
            sources.page_size,
            sources.max_records,
        );

        let breaker = CircuitBreaker::new(
            "dob",
            BreakerConfig {
                failure_threshold: engine.breaker_failure_threshold,
                window: Duration::from_secs(engine.breaker_window_seconds),
                cooldown: Duration::from_secs(engine.breaker_cooldown_seconds),
                max_cooldown: Duration::from_secs(engine.breaker_max_cooldown_seconds),
            },
        );
        let pool = Arc::new(HttpBrowserPool::new(engine.browser_pool_size, engine.source_timeout()));

        let signal_sources: Vec<Arc<dyn SignalSource>> = vec![
            Arc::new(Nyc311Client::new(
                socrata.clone(),
                sources.nyc_311_url.clone(),
                sources.lookback_days_311,
            )),
            Arc::new(HpdClient::new(socrata, sources.hpd_url.clone())),
            Arc::new(DobScraper::new(
                pool,
                Arc::clone(&breaker),
                sources.dob_bis_url.clone(),
                engine.source_timeout(),
            )),
        ];

        let geocoder: Option<Arc<dyn Geocoder>> = if sources.geocoder_enabled {
            Some(Arc::new(GeoSearchGeocoder::new(http, sources.geosearch_url.clone())))
        } else {
            None
        };

        let pipeline = Pipeline::new(
            AddressResolver::new(geocoder, engine.source_timeout()),
            Aggregator::new(signal_sources, engine.source_timeout(), engine.request_deadline()),
            ScoringEngine::new(config.scoring.clone()),
        );

        Ok(Self::new(Arc::new(pipeline), CachePolicy::from(engine), Some(breaker)))
    }

    /// Engine over arbitrary sources with default scoring and no geocoder.
    pub fn with_sources(
        sources: Vec<Arc<dyn SignalSource>>,
        engine: &crate::config::EngineConfig,
        scoring: ScoringConfig,
    ) -> Self {
        // ---
        let pipeline = Pipeline::new(
            AddressResolver::local(),
            Aggregator::new(sources, engine.source_timeout(), engine.request_deadline()),
            ScoringEngine::new(scoring),
        );
        Self::new(Arc::new(pipeline), CachePolicy::from(engine), None)
    }

    pub fn resolve(&self, house_number: &str, street: &str, borough: &str) -> Result<PropertyKey> {
        Ok(self.resolver.resolve(house_number, street, borough)?)
    }

    /// Analyze one address end to end.
    pub async fn analyze(&self, house_number: &str, street: &str, borough: &str) -> Result<PropertyReport> {
        // ---
        let key = self.resolve(house_number, street, borough)?;
        let cached = self.cache.get_or_compute(&key).await?;
        info!(
            key = %key,
            cache_hit = cached.cache_hit,
            stale = cached.stale,
            "Analysis ready"
        );
        Ok(report(&cached))
    }

    /// Signal records of one address laid out as a timeline. Windowed
    /// sources are re-read without their look-back window; a failed history
    /// read falls back to the cached records and marks the report partial.
    pub async fn timeline(&self, house_number: &str, street: &str, borough: &str) -> Result<(PropertyReport, Timeline)> {
        // ---
        let key = self.resolve(house_number, street, borough)?;
        let cached = self.cache.get_or_compute(&key).await?;
        let history = self.pipeline.history(&cached.entry.key).await;
        let history_failed = !history.failed.is_empty();
        let records = history.apply(&cached.entry.records);
        info!(key = %key, events = records.len(), history_failed, "Timeline ready");

        let mut report = report(&cached);
        report.partial_data |= history_failed;
        Ok((report, Timeline::from_records(&records)))
    }

    pub fn breaker_status(&self) -> Option<BreakerStatus> {
        self.breaker.as_ref().map(|b| b.status())
    }

    pub fn cache_stats(&self) -> Result<CacheStats> {
        self.cache.stats()
    }

    pub fn invalidate(&self, house_number: &str, street: &str, borough: &str) -> Result<bool> {
        let key = self.resolve(house_number, street, borough)?;
        self.cache.invalidate(&key)
    }

    pub fn clear_cache(&self) -> Result<usize> {
        self.cache.clear()
    }
}

fn report(cached: &CachedReport) -> PropertyReport {
    // ---
    let entry = &cached.entry;
    let partial_data = entry.outcomes.is_partial();
    let mut summary = entry.score.summary.clone();
    if partial_data {
        summary.push_str(PARTIAL_SUFFIX);
    }

    PropertyReport {
        address: entry.key.formatted(),
        key: entry.key.clone(),
        bbl: entry.key.bbl().map(|b| b.to_string()),
        score: entry.score.score,
        level: entry.score.level,
        summary,
        details: entry.score.clone(),
        outcomes: entry.outcomes.clone(),
        partial_data,
        stale: cached.stale,
        cache_hit: cached.cache_hit,
        last_updated: entry.fetched_at,
        signals: entry.records.clone(),
    }
}
