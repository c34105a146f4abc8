//! Configuration loader for the `nyc-distress` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). By consolidating configuration logic here, we
//! avoid scattering `env::var` calls throughout the codebase.
//!
use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::scoring::ScoringConfig;

/// Parse an optional environment variable of any `FromStr` type with a default value.
macro_rules! parse_env {
    ($var_name:expr, $ty:ty, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.trim().parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Read an optional string environment variable with a default value.
macro_rules! env_or {
    ($var_name:expr, $default:expr) => {
        env::var($var_name).unwrap_or_else(|_| $default.to_string())
    };
}

pub const DEFAULT_311_URL: &str = "https://data.cityofnewyork.us/resource/erm2-nwe9.json";
pub const DEFAULT_HPD_URL: &str = "https://data.cityofnewyork.us/resource/wvxf-dwi5.json";
pub const DEFAULT_DOB_BIS_URL: &str = "http://a810-bisweb.nyc.gov/bisweb";
pub const DEFAULT_GEOSEARCH_URL: &str = "https://geosearch.planninglabs.nyc/v2/search";

/// Tunables consumed by the engine core: cache, circuit breaker and
/// deadlines.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // ---
    pub ttl_seconds: u64,
    pub cache_capacity: usize,
    /// Serve the previous entry, flagged stale, when a refresh fails.
    pub serve_stale_on_error: bool,
    pub breaker_failure_threshold: u32,
    pub breaker_window_seconds: u64,
    pub breaker_cooldown_seconds: u64,
    pub breaker_max_cooldown_seconds: u64,
    pub source_timeout_seconds: u64,
    pub request_deadline_seconds: u64,
    pub browser_pool_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        // ---
        Self {
            ttl_seconds: 86_400,
            cache_capacity: 1024,
            serve_stale_on_error: true,
            breaker_failure_threshold: 5,
            breaker_window_seconds: 60,
            breaker_cooldown_seconds: 30,
            breaker_max_cooldown_seconds: 300,
            source_timeout_seconds: 6,
            request_deadline_seconds: 9,
            browser_pool_size: 2,
        }
    }
}

impl EngineConfig {
    // ---
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_timeout_seconds)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_seconds)
    }
}

/// Upstream endpoints and fetch limits.
#[derive(Debug, Clone)]
pub struct SourceEndpoints {
    // ---
    pub nyc_311_url: String,
    pub hpd_url: String,
    pub dob_bis_url: String,
    pub geosearch_url: String,
    pub geocoder_enabled: bool,

    /// NYC OpenData application token (optional, raises Socrata rate limits).
    pub app_token: Option<String>,

    /// Rows requested per Socrata page.
    pub page_size: u32,

    /// Hard cap on records fetched per source (safety limit).
    pub max_records: u32,

    pub lookback_days_311: u32,
}

impl Default for SourceEndpoints {
    fn default() -> Self {
        // ---
        Self {
            nyc_311_url: DEFAULT_311_URL.to_string(),
            hpd_url: DEFAULT_HPD_URL.to_string(),
            dob_bis_url: DEFAULT_DOB_BIS_URL.to_string(),
            geosearch_url: DEFAULT_GEOSEARCH_URL.to_string(),
            geocoder_enabled: true,
            app_token: None,
            page_size: 500,
            max_records: 2000,
            lookback_days_311: 365,
        }
    }
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone, Default)]
pub struct Config {
    // ---
    /// Port the HTTP server binds to.
    pub bind_port: u16,

    pub engine: EngineConfig,

    pub sources: SourceEndpoints,

    pub scoring: ScoringConfig,
}

/// Load configuration from environment variables with defaults.
///
/// Required: none. Every value defaults to the public NYC endpoints.
///
/// Optional:
/// - `BIND_PORT` – HTTP listen port (default: 8080)
/// - `CACHE_TTL_SECONDS` – result freshness (default: 86400)
/// - `CACHE_CAPACITY` – max cached properties (default: 1024)
/// - `CACHE_SERVE_STALE` – serve expired entries when all sources fail (default: true)
/// - `BREAKER_FAILURE_THRESHOLD` – DOB failures that open the breaker (default: 5)
/// - `BREAKER_WINDOW_SECONDS` – rolling failure window (default: 60)
/// - `BREAKER_COOLDOWN_SECONDS` – first open period (default: 30)
/// - `BREAKER_MAX_COOLDOWN_SECONDS` – cap on the doubled open period (default: 300)
/// - `SOURCE_TIMEOUT_SECONDS` – per-source and geocoder timeout (default: 6)
/// - `REQUEST_DEADLINE_SECONDS` – overall budget per computation (default: 9)
/// - `BROWSER_POOL_SIZE` – concurrent DOB page sessions (default: 2)
/// - `NYC_311_URL`, `HPD_URL`, `DOB_BIS_URL`, `GEOSEARCH_URL` – upstream endpoints
/// - `GEOCODER_ENABLED` – BBL lookup through GeoSearch (default: true)
/// - `NYC_OPENDATA_APP_TOKEN` – Socrata app token (default: unset)
/// - `SOCRATA_PAGE_SIZE` – rows per page (default: 500)
/// - `SOURCE_MAX_RECORDS` – hard cap on rows per query (default: 2000)
/// - `NYC_311_LOOKBACK_DAYS` – 311 window used for scoring (default: 365)
///
/// Returns an error if any variable is set but invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let engine_defaults = EngineConfig::default();
    let engine = EngineConfig {
        ttl_seconds: parse_env!("CACHE_TTL_SECONDS", u64, engine_defaults.ttl_seconds),
        cache_capacity: parse_env!("CACHE_CAPACITY", usize, engine_defaults.cache_capacity),
        serve_stale_on_error: parse_env!(
            "CACHE_SERVE_STALE",
            bool,
            engine_defaults.serve_stale_on_error
        ),
        breaker_failure_threshold: parse_env!(
            "BREAKER_FAILURE_THRESHOLD",
            u32,
            engine_defaults.breaker_failure_threshold
        ),
        breaker_window_seconds: parse_env!(
            "BREAKER_WINDOW_SECONDS",
            u64,
            engine_defaults.breaker_window_seconds
        ),
        breaker_cooldown_seconds: parse_env!(
            "BREAKER_COOLDOWN_SECONDS",
            u64,
            engine_defaults.breaker_cooldown_seconds
        ),
        breaker_max_cooldown_seconds: parse_env!(
            "BREAKER_MAX_COOLDOWN_SECONDS",
            u64,
            engine_defaults.breaker_max_cooldown_seconds
        ),
        source_timeout_seconds: parse_env!(
            "SOURCE_TIMEOUT_SECONDS",
            u64,
            engine_defaults.source_timeout_seconds
        ),
        request_deadline_seconds: parse_env!(
            "REQUEST_DEADLINE_SECONDS",
            u64,
            engine_defaults.request_deadline_seconds
        ),
        browser_pool_size: parse_env!("BROWSER_POOL_SIZE", usize, engine_defaults.browser_pool_size),
    };

    if engine.breaker_failure_threshold == 0 {
        return Err(anyhow!("BREAKER_FAILURE_THRESHOLD must be at least 1"));
    }
    if engine.browser_pool_size == 0 {
        return Err(anyhow!("BROWSER_POOL_SIZE must be at least 1"));
    }

    let source_defaults = SourceEndpoints::default();
    let sources = SourceEndpoints {
        nyc_311_url: env_or!("NYC_311_URL", source_defaults.nyc_311_url),
        hpd_url: env_or!("HPD_URL", source_defaults.hpd_url),
        dob_bis_url: env_or!("DOB_BIS_URL", source_defaults.dob_bis_url),
        geosearch_url: env_or!("GEOSEARCH_URL", source_defaults.geosearch_url),
        geocoder_enabled: parse_env!("GEOCODER_ENABLED", bool, source_defaults.geocoder_enabled),
        app_token: env::var("NYC_OPENDATA_APP_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty()),
        page_size: parse_env!("SOCRATA_PAGE_SIZE", u32, source_defaults.page_size),
        max_records: parse_env!("SOURCE_MAX_RECORDS", u32, source_defaults.max_records),
        lookback_days_311: parse_env!(
            "NYC_311_LOOKBACK_DAYS",
            u32,
            source_defaults.lookback_days_311
        ),
    };

    if sources.page_size == 0 {
        return Err(anyhow!("SOCRATA_PAGE_SIZE must be at least 1"));
    }

    Ok(Config {
        bind_port: parse_env!("BIND_PORT", u16, 8080),
        engine,
        sources,
        scoring: ScoringConfig::default(),
    })
}

impl Config {
    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks the OpenData application token while showing all other
    /// configuration values that were loaded.
    pub fn log_config(&self) {
        // ---
        let masked_token = match &self.sources.app_token {
            Some(token) if token.chars().count() > 4 => {
                format!("{}****", token.chars().take(4).collect::<String>())
            }
            Some(_) => "****".to_string(),
            None => "(none)".to_string(),
        };

        let e = &self.engine;
        let s = &self.sources;
        tracing::info!("Configuration loaded:");
        tracing::info!("  BIND_PORT                 : {}", self.bind_port);
        tracing::info!("  NYC_311_URL               : {}", s.nyc_311_url);
        tracing::info!("  HPD_URL                   : {}", s.hpd_url);
        tracing::info!("  DOB_BIS_URL               : {}", s.dob_bis_url);
        tracing::info!("  GEOSEARCH_URL             : {} (enabled: {})", s.geosearch_url, s.geocoder_enabled);
        tracing::info!("  NYC_OPENDATA_APP_TOKEN    : {}", masked_token);
        tracing::info!("  SOCRATA_PAGE_SIZE         : {}", s.page_size);
        tracing::info!("  SOURCE_MAX_RECORDS        : {}", s.max_records);
        tracing::info!("  NYC_311_LOOKBACK_DAYS     : {}", s.lookback_days_311);
        tracing::info!("  CACHE_TTL_SECONDS         : {}", e.ttl_seconds);
        tracing::info!("  CACHE_CAPACITY            : {}", e.cache_capacity);
        tracing::info!("  CACHE_SERVE_STALE         : {}", e.serve_stale_on_error);
        tracing::info!("  BREAKER_FAILURE_THRESHOLD : {}", e.breaker_failure_threshold);
        tracing::info!("  BREAKER_WINDOW_SECONDS    : {}", e.breaker_window_seconds);
        tracing::info!("  BREAKER_COOLDOWN_SECONDS  : {}", e.breaker_cooldown_seconds);
        tracing::info!("  BREAKER_MAX_COOLDOWN_SECS : {}", e.breaker_max_cooldown_seconds);
        tracing::info!("  SOURCE_TIMEOUT_SECONDS    : {}", e.source_timeout_seconds);
        tracing::info!("  REQUEST_DEADLINE_SECONDS  : {}", e.request_deadline_seconds);
        tracing::info!("  BROWSER_POOL_SIZE         : {}", e.browser_pool_size);
    }
}
