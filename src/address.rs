//! Address resolution.
//!
//! Turns free-form `(house number, street, borough)` input into a canonical
//! [`PropertyKey`]. Normalization is purely local; the optional BBL
//! enrichment goes through a [`Geocoder`] and is strictly best-effort.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{AddressError, SourceError};
use crate::models::{Bbl, Borough, PropertyKey};

// ---

const MAX_HOUSE_NUMBER_LEN: usize = 20;
const MAX_STREET_LEN: usize = 100;

/// Street-type abbreviations and their expansions. `st` is handled
/// separately because it can also mean "saint".
const STREET_TYPES: &[(&str, &str)] = &[
    ("str", "street"),
    ("ave", "avenue"),
    ("av", "avenue"),
    ("avn", "avenue"),
    ("blvd", "boulevard"),
    ("rd", "road"),
    ("dr", "drive"),
    ("ln", "lane"),
    ("pl", "place"),
    ("ct", "court"),
    ("pkwy", "parkway"),
    ("pky", "parkway"),
    ("ter", "terrace"),
    ("terr", "terrace"),
    ("hwy", "highway"),
    ("sq", "square"),
    ("expy", "expressway"),
    ("tpke", "turnpike"),
    ("plz", "plaza"),
    ("cir", "circle"),
];

const DIRECTIONALS: &[(&str, &str)] = &[
    ("n", "north"),
    ("s", "south"),
    ("e", "east"),
    ("w", "west"),
];

/// Resolve raw address parts into a canonical key.
///
/// Two inputs a person would read as the same property produce equal keys:
/// `resolve("123", "West 45th Street", "Manhattan")` equals
/// `resolve("123", "W 45 St", "manhattan")`.
pub fn resolve(house_number: &str, street: &str, borough: &str) -> Result<PropertyKey, AddressError> {
    // ---
    let borough: Borough = borough.parse()?;
    let house_number = normalize_house_number(house_number)?;
    let street = normalize_street(street)?;
    Ok(PropertyKey::from_normalized(borough, street, house_number))
}

/// Lower-cases the house number and glues letter suffixes onto the digits
/// (`"123 A"` becomes `"123a"`). Queens-style hyphenated numbers are kept.
pub fn normalize_house_number(raw: &str) -> Result<String, AddressError> {
    // ---
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AddressError::EmptyHouseNumber);
    }
    if trimmed.chars().count() > MAX_HOUSE_NUMBER_LEN {
        return Err(AddressError::TooLong {
            field: "house number",
            max: MAX_HOUSE_NUMBER_LEN,
        });
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c.is_whitespace() || c == '-' || c == '/')
    {
        return Err(AddressError::IllegalCharacters {
            field: "house number",
            value: trimmed.to_string(),
        });
    }

    let lowered = trimmed.to_ascii_lowercase();
    let mut out = String::with_capacity(lowered.len());
    for token in lowered.split_whitespace() {
        let glue = out.ends_with(|c: char| c.is_ascii_digit())
            && token.chars().all(|c| c.is_ascii_alphabetic());
        if !out.is_empty() && !glue {
            out.push(' ');
        }
        out.push_str(token);
    }
    Ok(out)
}

/// Canonical street form: lower-case, punctuation stripped, ordinals reduced
/// to bare numbers, directionals and street types expanded.
pub fn normalize_street(raw: &str) -> Result<String, AddressError> {
    // ---
    let trimmed = raw.trim();
    if trimmed.chars().count() > MAX_STREET_LEN {
        return Err(AddressError::TooLong {
            field: "street",
            max: MAX_STREET_LEN,
        });
    }
    if !trimmed.chars().all(|c| {
        c.is_ascii_alphanumeric() || c.is_whitespace() || matches!(c, '.' | ',' | '\'' | '-' | '#')
    }) {
        return Err(AddressError::IllegalCharacters {
            field: "street",
            value: trimmed.to_string(),
        });
    }

    let cleaned: String = trimmed
        .to_ascii_lowercase()
        .chars()
        .filter(|c| !matches!(c, '.' | '\''))
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();

    let tokens: Vec<&str> = cleaned.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(AddressError::EmptyStreet);
    }

    let expanded: Vec<String> = tokens
        .iter()
        .enumerate()
        .map(|(i, token)| expand_token(token, i == 0 && tokens.len() > 1))
        .collect();
    Ok(expanded.join(" "))
}

fn expand_token(token: &str, leading: bool) -> String {
    // ---
    if let Some(number) = strip_ordinal(token) {
        return number.to_string();
    }
    if leading {
        if token == "st" {
            return "saint".to_string();
        }
        if let Some((_, full)) = DIRECTIONALS.iter().find(|(abbr, _)| *abbr == token) {
            return (*full).to_string();
        }
    }
    if token == "st" {
        return "street".to_string();
    }
    STREET_TYPES
        .iter()
        .find(|(abbr, _)| *abbr == token)
        .map_or_else(|| token.to_string(), |(_, full)| (*full).to_string())
}

/// `"45th"` -> `Some("45")`; anything that is not digits + ordinal suffix -> `None`.
fn strip_ordinal(token: &str) -> Option<&str> {
    // ---
    let digits_end = token.find(|c: char| !c.is_ascii_digit())?;
    if digits_end == 0 {
        return None;
    }
    let (digits, suffix) = token.split_at(digits_end);
    matches!(suffix, "st" | "nd" | "rd" | "th").then_some(digits)
}

// ---

/// External address → BBL lookup.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn lookup_bbl(&self, key: &PropertyKey) -> Result<Option<Bbl>, SourceError>;
}

/// NYC Planning Labs GeoSearch client.
pub struct GeoSearchGeocoder {
    // ---
    http: reqwest::Client,
    url: String,
}

#[derive(Debug, Default, Deserialize)]
struct GeoSearchResponse {
    #[serde(default)]
    features: Vec<GeoSearchFeature>,
}

#[derive(Debug, Default, Deserialize)]
struct GeoSearchFeature {
    #[serde(default)]
    properties: GeoSearchProperties,
}

#[derive(Debug, Default, Deserialize)]
struct GeoSearchProperties {
    #[serde(default)]
    addendum: GeoSearchAddendum,
}

#[derive(Debug, Default, Deserialize)]
struct GeoSearchAddendum {
    #[serde(default)]
    pad: GeoSearchPad,
}

#[derive(Debug, Default, Deserialize)]
struct GeoSearchPad {
    #[serde(default)]
    bbl: String,
}

impl GeoSearchGeocoder {
    // ---
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Geocoder for GeoSearchGeocoder {
    async fn lookup_bbl(&self, key: &PropertyKey) -> Result<Option<Bbl>, SourceError> {
        // ---
        let text = format!(
            "{} {}, {}, NY",
            key.house_number(),
            key.street(),
            key.borough().name()
        );
        debug!("Geocoding address: {}", text);

        let response: GeoSearchResponse = self
            .http
            .get(&self.url)
            .query(&[("text", text.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(bbl_from_response(response))
    }
}

fn bbl_from_response(response: GeoSearchResponse) -> Option<Bbl> {
    // ---
    let feature = response.features.into_iter().next()?;
    Bbl::parse(&feature.properties.addendum.pad.bbl).ok()
}

/// Resolver with optional BBL enrichment.
pub struct AddressResolver {
    // ---
    geocoder: Option<Arc<dyn Geocoder>>,
    timeout: Duration,
}

impl AddressResolver {
    // ---
    pub fn new(geocoder: Option<Arc<dyn Geocoder>>, timeout: Duration) -> Self {
        Self { geocoder, timeout }
    }

    /// Resolver that never geocodes.
    pub fn local() -> Self {
        Self::new(None, Duration::from_secs(0))
    }

    pub fn resolve(&self, house_number: &str, street: &str, borough: &str) -> Result<PropertyKey, AddressError> {
        resolve(house_number, street, borough)
    }

    /// Attach a BBL to `key` if the geocoder can find one in time. Any
    /// failure leaves the key as it was.
    pub async fn enrich(&self, key: &PropertyKey) -> PropertyKey {
        self.enrich_until(key, tokio::time::Instant::now() + self.timeout).await
    }

    /// Like [`enrich`](Self::enrich) but never runs past `deadline`, which
    /// is shared with the rest of the request.
    pub async fn enrich_until(&self, key: &PropertyKey, deadline: tokio::time::Instant) -> PropertyKey {
        // ---
        if key.bbl().is_some() {
            return key.clone();
        }
        let Some(geocoder) = &self.geocoder else {
            return key.clone();
        };

        let deadline = deadline.min(tokio::time::Instant::now() + self.timeout);
        match tokio::time::timeout_at(deadline, geocoder.lookup_bbl(key)).await {
            Ok(Ok(Some(bbl))) => {
                info!(key = %key, bbl = %bbl, "Geocoded property");
                key.with_bbl(bbl)
            }
            Ok(Ok(None)) => {
                debug!(key = %key, "Geocoder returned no BBL");
                key.clone()
            }
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Geocoding failed, continuing without BBL");
                key.clone()
            }
            Err(_) => {
                warn!(key = %key, timeout = ?self.timeout, "Geocoding timed out, continuing without BBL");
                key.clone()
            }
        }
    }
}
