//! Extraction of DOB signals from BIS HTML.
//!
//! The property profile page yields the BIN and the Stop Work / Vacate order
//! flags; the violations page is a table with one violation per row.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{PropertyKey, SignalKind, SignalRecord, SignalStatus};

// ---

static ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<tr[^>]*>(.*?)</tr>").expect("row regex"));
static CELL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<td[^>]*>(.*?)</td>").expect("cell regex"));
static LINE_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</tr\s*>|<br\s*/?>|</p\s*>|</div\s*>").expect("line break regex"));
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]+>").expect("tag regex"));
static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\r\f]+").expect("spaces regex"));
static DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").expect("date regex"));
static BIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)BIN#?\s*:?\s*(\d{7})").expect("bin regex"));
static STOP_WORK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(stop\s*work\s*order|work\s*stop\s*order|\bSWO\b)[^\n]{0,100}?\b(active|yes|in\s*effect)\b")
        .expect("stop work regex")
});
static VACATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)((?:full|partial)\s*vacate|vacate\s*order)[^\n]{0,100}?\b(active|yes|in\s*effect)\b")
        .expect("vacate regex")
});
static NO_RECORDS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)no\s+records?\s+found").expect("no records regex"));
static VIOLATION_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z0-9][A-Z0-9\- ]{4,}$").expect("violation id regex"));

/// Facts read from the property profile page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileFacts {
    // ---
    pub bin: Option<String>,
    pub stop_work_order: Option<String>,
    pub vacate_order: Option<String>,
    pub no_records: bool,
}

/// Flatten HTML to text: one line per table row / block, tags removed,
/// common entities decoded.
pub fn html_to_text(html: &str) -> String {
    // ---
    let with_breaks = LINE_BREAK.replace_all(html, "\n");
    let without_tags = TAG.replace_all(&with_breaks, " ");
    let decoded = decode_entities(&without_tags);
    SPACES
        .replace_all(&decoded, " ")
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&#160;", " ")
        .replace("&#39;", "'")
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

pub fn parse_profile(html: &str) -> ProfileFacts {
    // ---
    let text = html_to_text(html);
    ProfileFacts {
        bin: BIN.captures(&text).map(|c| c[1].to_string()),
        stop_work_order: STOP_WORK.captures(&text).map(|c| c[1].trim().to_string()),
        vacate_order: VACATE.captures(&text).map(|c| c[1].trim().to_string()),
        no_records: NO_RECORDS.is_match(&text),
    }
}

/// Open order records implied by the profile flags.
pub fn profile_records(facts: &ProfileFacts, key: &PropertyKey) -> Vec<SignalRecord> {
    // ---
    let anchor = facts.bin.clone().unwrap_or_else(|| key.to_string());
    let order = |kind: SignalKind, suffix: &str, phrase: &str| SignalRecord {
        kind,
        source_id: format!("{anchor}:{suffix}"),
        description: format!("Active {}", title_case(phrase)),
        date: None,
        status: SignalStatus::Open,
        status_date: None,
        severity: suffix.to_string(),
    };

    let mut records = Vec::new();
    if let Some(phrase) = &facts.stop_work_order {
        records.push(order(SignalKind::DobStopWorkOrder, "swo", phrase));
    }
    if let Some(phrase) = &facts.vacate_order {
        records.push(order(SignalKind::DobVacateOrder, "vacate", phrase));
    }
    records
}

fn title_case(phrase: &str) -> String {
    // ---
    if phrase.eq_ignore_ascii_case("swo") {
        return "Stop Work Order".to_string();
    }
    phrase
        .split_whitespace()
        .map(|w| {
            let lower = w.to_ascii_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse the violations table. Rows need at least three cells and an
/// identifier-like first cell; anything else (headers, layout rows) is
/// skipped.
pub fn parse_violation_rows(html: &str) -> Vec<SignalRecord> {
    // ---
    let mut records = Vec::new();
    for row in ROW.captures_iter(html) {
        let cells: Vec<String> = CELL
            .captures_iter(&row[1])
            .map(|c| html_to_text(&c[1]).replace('\n', " "))
            .collect();
        if cells.len() < 3 {
            continue;
        }

        let id = cells[0].trim().to_ascii_uppercase();
        if !VIOLATION_ID.is_match(&id) || !id.chars().any(|c| c.is_ascii_digit()) {
            continue;
        }

        let mut date = None;
        let mut status = None;
        let mut details = Vec::new();
        for cell in &cells[1..] {
            let text = cell.trim();
            if text.is_empty() {
                continue;
            }
            if date.is_none() {
                if let Some(d) = parse_us_date(text) {
                    date = Some(d);
                    continue;
                }
            }
            if status.is_none() {
                if let Some(s) = parse_status(text) {
                    status = Some(s);
                    continue;
                }
            }
            if text.len() > 3 {
                details.push(text.to_string());
            }
        }

        let mut description = details.join(" | ");
        if description.is_empty() {
            description = "DOB violation".to_string();
        }
        truncate_chars(&mut description, 200);

        let status = status.unwrap_or(SignalStatus::Open);
        records.push(SignalRecord {
            kind: SignalKind::DobViolation,
            source_id: id,
            description,
            date,
            status,
            status_date: None,
            severity: "violation".to_string(),
        });
    }
    records
}

fn parse_us_date(text: &str) -> Option<NaiveDate> {
    // ---
    let c = DATE.captures(text)?;
    let month = c[1].parse().ok()?;
    let day = c[2].parse().ok()?;
    let year = c[3].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn parse_status(text: &str) -> Option<SignalStatus> {
    // ---
    let lower = text.to_ascii_lowercase();
    if lower.len() > 40 {
        return None;
    }
    if lower.contains("resolved") || lower.contains("dismissed") || lower.contains("cured") {
        Some(SignalStatus::Resolved)
    } else if lower.contains("closed") {
        Some(SignalStatus::Closed)
    } else if lower.contains("open") || lower.contains("active") {
        Some(SignalStatus::Open)
    } else {
        None
    }
}

fn truncate_chars(s: &mut String, max: usize) {
    if let Some((idx, _)) = s.char_indices().nth(max) {
        s.truncate(idx);
    }
}
