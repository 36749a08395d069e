use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use log::{error, info};
use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};

use crate::error::{Error, Result};

/// Process-wide metrics registry, created once at startup and shared between
/// the incrementing call sites and the read-only scrape endpoint.
pub struct Metrics {
    registry: Registry,
    pub socket_reconnections: IntGauge,
    pub messages: IntCounter,
    pub patients_admitted: IntCounter,
    pub patients_discharged: IntCounter,
    pub blood_tests: IntCounter,
    pub blood_test_average: Gauge,
    pub positive_akis: IntCounter,
    pub positive_aki_rate: Gauge,
    pub latency_average: Gauge,
    pub latency_exceeded: IntCounter,
    pub failures: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let socket_reconnections = int_gauge(
            &registry,
            "socket_reconnections_total",
            "Total number of socket reconnections made",
        )?;
        // The first connect brings the gauge to zero, so it reads as the
        // number of RE-connections.
        socket_reconnections.set(-1);
        Ok(Self {
            socket_reconnections,
            messages: counter(&registry, "total_messages", "Total number of messages received")?,
            patients_admitted: counter(
                &registry,
                "total_admitted_patients",
                "Total number of admitted patients",
            )?,
            patients_discharged: counter(
                &registry,
                "total_discharged_patients",
                "Total number of discharged patients",
            )?,
            blood_tests: counter(
                &registry,
                "total_blood_test",
                "Total number of blood tests received",
            )?,
            blood_test_average: gauge(
                &registry,
                "blood_test_average",
                "Average value of blood test",
            )?,
            positive_akis: counter(
                &registry,
                "total_positive_akis",
                "Total number of positive AKI instances detected",
            )?,
            positive_aki_rate: gauge(&registry, "positive_AKI_rate", "Positive AKI rate")?,
            latency_average: gauge(&registry, "latency_average", "Average value of latency")?,
            latency_exceeded: counter(
                &registry,
                "latency_exceeds_3_seconds_total",
                "Counts how many times latency exceeded 3 seconds",
            )?,
            failures: counter(&registry, "total_failures", "Total number of failures occurred")?,
            registry,
        })
    }

    /// Renders the registry in Prometheus exposition format.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            error!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter =
        IntCounter::new(name, help).map_err(|e| Error::Metrics(e.to_string()))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| Error::Metrics(e.to_string()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge> {
    let gauge = Gauge::new(name, help).map_err(|e| Error::Metrics(e.to_string()))?;
    registry
        .register(Box::new(gauge.clone()))
        .map_err(|e| Error::Metrics(e.to_string()))?;
    Ok(gauge)
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let gauge = IntGauge::new(name, help).map_err(|e| Error::Metrics(e.to_string()))?;
    registry
        .register(Box::new(gauge.clone()))
        .map_err(|e| Error::Metrics(e.to_string()))?;
    Ok(gauge)
}

/// Serves the exposition format on `GET /metrics`.
pub async fn serve(metrics: Arc<Metrics>, port: u16) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(scrape))
        .with_state(metrics);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn scrape(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.export()
}

// ============================================================================
// UNIT TESTS
// ============================================================================
