//! Property distress scoring over NYC open data.
//!
//! An address is resolved to a canonical [`PropertyKey`], the 311, HPD and DOB
//! sources are queried concurrently, their records are merged into one signal
//! set and scored. Results are cached per property with request coalescing.
//!
//! Module layout:
//! - `address`: normalization and optional BBL geocoding
//! - `sources`: upstream clients, including the breaker-guarded DOB scraper
//! - `aggregator`: fan-out with deadlines and partial-success policy
//! - `scoring`: the pure, deterministic scoring function
//! - `cache`: TTL + LRU result cache with coalescing
//! - `engine`: the facade tying them together
//! - `routes`: the HTTP surface

pub mod address;
pub mod aggregator;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod routes;
pub mod scoring;
pub mod sources;
pub mod timeline;

pub use config::Config;
pub use engine::DistressEngine;
pub use error::{AddressError, EngineError, SourceError};
pub use models::{DistressLevel, DistressScore, PropertyKey, PropertyReport, SignalKind, SignalRecord, SignalStatus};
