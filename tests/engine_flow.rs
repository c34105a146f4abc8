//! End-to-end engine and HTTP flow over fake sources.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::future::join_all;
use reqwest::StatusCode;
use serde_json::json;

use nyc_distress::config::EngineConfig;
use nyc_distress::models::SourceName;
use nyc_distress::scoring::ScoringConfig;
use nyc_distress::sources::SignalSource;
use nyc_distress::{routes, DistressEngine, DistressLevel, PropertyKey, SignalKind, SignalRecord, SignalStatus, SourceError};

// ---

struct FakeSource {
    name: SourceName,
    calls: AtomicUsize,
    delay: Duration,
    result: std::result::Result<Vec<SignalRecord>, SourceError>,
}

impl FakeSource {
    fn new(
        name: SourceName,
        delay_ms: u64,
        result: std::result::Result<Vec<SignalRecord>, SourceError>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(delay_ms),
            result,
        })
    }
}

#[async_trait]
impl SignalSource for FakeSource {
    fn name(&self) -> SourceName {
        self.name
    }

    async fn fetch(&self, _key: &PropertyKey) -> std::result::Result<Vec<SignalRecord>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.result.clone()
    }
}

fn violation(kind: SignalKind, id: &str, status: SignalStatus) -> SignalRecord {
    SignalRecord {
        kind,
        source_id: id.to_string(),
        description: kind.label().to_string(),
        date: NaiveDate::from_ymd_opt(2025, 1, 15),
        status,
        status_date: None,
        severity: "C".to_string(),
    }
}

fn engine(sources: Vec<Arc<FakeSource>>) -> DistressEngine {
    let sources = sources
        .into_iter()
        .map(|s| s as Arc<dyn SignalSource>)
        .collect();
    DistressEngine::with_sources(sources, &EngineConfig::default(), ScoringConfig::default())
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_for_one_property_fetch_once() {
    // ---
    let hpd = FakeSource::new(
        SourceName::Hpd,
        300,
        Ok(vec![violation(SignalKind::HpdViolationClassC, "1", SignalStatus::Open)]),
    );
    let dob = FakeSource::new(SourceName::Dob, 0, Err(SourceError::CircuitOpen));
    let engine = engine(vec![hpd.clone(), dob.clone()]);

    let spellings = ["W 45th St", "West 45 Street", "w. 45 st"];
    let requests = (0..9).map(|i| engine.analyze("123", spellings[i % 3], "Manhattan"));
    let reports = join_all(requests).await;

    assert_eq!(hpd.calls.load(Ordering::SeqCst), 1);
    assert_eq!(dob.calls.load(Ordering::SeqCst), 1);
    let first = reports[0].as_ref().unwrap();
    for report in &reports {
        let report = report.as_ref().unwrap();
        assert_eq!(report.score, first.score);
        assert!(report.partial_data);
        assert_eq!(report.details.open_count(SignalKind::HpdViolationClassC), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn hung_source_is_reported_as_timeout() {
    // ---
    let hpd = FakeSource::new(SourceName::Hpd, 0, Ok(Vec::new()));
    let dob = FakeSource::new(SourceName::Dob, 120_000, Ok(Vec::new()));
    let engine = engine(vec![hpd, dob]);

    let report = engine.analyze("7", "Main St", "Brooklyn").await.unwrap();
    assert!(report.partial_data);
    assert_eq!(report.level, DistressLevel::Low);
    assert!(report.agent_summary().ends_with("[PARTIAL DATA]"));
    assert_eq!(
        serde_json::to_value(&report.outcomes).unwrap()["dob"]["status"],
        "timeout"
    );
}

async fn serve(engine: DistressEngine) -> Result<String> {
    // ---
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = routes::router(Arc::new(engine));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

#[tokio::test]
async fn http_surface_maps_results_and_errors() -> Result<()> {
    // ---
    let hpd = FakeSource::new(
        SourceName::Hpd,
        0,
        Ok(vec![
            violation(SignalKind::HpdViolationClassC, "10", SignalStatus::Open),
            violation(SignalKind::HpdViolationClassB, "11", SignalStatus::Closed),
        ]),
    );
    let base = serve(engine(vec![hpd])).await?;
    let client = reqwest::Client::new();
    let address = json!({"house_number": "42-15", "street": "Crescent St", "borough": "Queens"});

    let report: serde_json::Value = client
        .post(format!("{base}/v1/analyze"))
        .json(&address)
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(report["address"], "42-15 CRESCENT STREET, QUEENS");
    assert_eq!(report["partial_data"], false);
    assert_eq!(report["cache_hit"], false);
    assert_eq!(report["signals"].as_array().map(Vec::len), Some(2));

    let agent: serde_json::Value = client
        .post(format!("{base}/v1/agent"))
        .json(&address)
        .send()
        .await?
        .json()
        .await?;
    let line = agent["response"].as_str().unwrap_or_default();
    assert!(line.contains("HPD Violations (1, Class C: 1)"), "{line}");

    let timeline: serde_json::Value = client
        .post(format!("{base}/v1/timeline?limit=1"))
        .json(&address)
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(timeline["total_events"], 2);
    assert_eq!(timeline["events"].as_array().map(Vec::len), Some(1));
    assert_eq!(timeline["partial_data"], true);
    assert_eq!(timeline["monthly_summary"][0]["period"], "2025-01");
    assert_eq!(timeline["monthly_summary"][0]["violation_count"], 2);

    let invalid = client
        .post(format!("{base}/v1/analyze"))
        .json(&json!({"house_number": "1", "street": "Main St", "borough": "Hoboken"}))
        .send()
        .await?;
    assert_eq!(invalid.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: serde_json::Value = invalid.json().await?;
    assert_eq!(body["error"], "invalid_address");
    assert_eq!(body["code"], 422);

    let stats: serde_json::Value = client.get(format!("{base}/admin/cache")).send().await?.json().await?;
    assert_eq!(stats["entries"], 1);
    assert_eq!(stats["hits"], 2);

    let deleted = client.delete(format!("{base}/v1/cache")).json(&address).send().await?;
    assert_eq!(deleted.status(), StatusCode::OK);
    let again = client.delete(format!("{base}/v1/cache")).json(&address).send().await?;
    assert_eq!(again.status(), StatusCode::NOT_FOUND);

    let health: serde_json::Value = client.get(format!("{base}/health")).send().await?.json().await?;
    assert_eq!(health["status"], "ok");

    Ok(())
}

#[tokio::test]
async fn total_failure_is_service_unavailable() -> Result<()> {
    // ---
    let hpd = FakeSource::new(SourceName::Hpd, 0, Err(SourceError::Unavailable("502".into())));
    let dob = FakeSource::new(SourceName::Dob, 0, Err(SourceError::ScrapeError("HTTP 500".into())));
    let base = serve(engine(vec![hpd, dob])).await?;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/analyze"))
        .json(&json!({"house_number": "1", "street": "Main St", "borough": "Bronx"}))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["error"], "all_sources_failed");
    assert_eq!(body["code"], 503);

    Ok(())
}
