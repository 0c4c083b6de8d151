//! Optional HyperDX trace export.
//!
//! With an API key configured, rebalance spans are exported over OTLP/HTTP
//! in addition to console output. Every exported span carries the service
//! name, the deployment environment and the stake pool it acts on.
//!
//! The batch processor exports from a background thread of its own, so the
//! exporter uses the blocking `reqwest` client, which is built off the
//! runtime threads.

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::{ExporterBuildError, SpanExporter, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{BatchConfigBuilder, BatchSpanProcessor, SdkTracerProvider};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::{EnvFilter, Registry};

use st0x_ledger::Pubkey;

use crate::config::default_filter;

const HYPERDX_ENDPOINT: &str = "https://in-otel.hyperdx.io/v1/traces";
const TRACER_NAME: &str = "st0x-rebalancer";
const EXPORT_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct HyperDxConfig {
    pub(crate) api_key: String,
    pub(crate) service_name: String,
    pub(crate) environment: String,
    pub(crate) pool: Pubkey,
    pub(crate) log_level: tracing::Level,
}

impl HyperDxConfig {
    /// Installs the global subscriber: console output plus span export.
    pub fn setup_telemetry(&self) -> Result<TelemetryGuard, TelemetryError> {
        let tracer_provider = SdkTracerProvider::builder()
            .with_span_processor(self.span_processor()?)
            .with_resource(self.resource())
            .build();

        let export_layer = tracing_opentelemetry::layer()
            .with_tracer(tracer_provider.tracer(TRACER_NAME))
            .with_filter(self.filter());
        let console_layer = tracing_subscriber::fmt::layer().with_filter(self.filter());

        tracing::subscriber::set_global_default(
            Registry::default().with(console_layer).with(export_layer),
        )?;

        Ok(TelemetryGuard { tracer_provider })
    }

    fn resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attributes([
                KeyValue::new("deployment.environment", self.environment.clone()),
                KeyValue::new("stake_pool.address", self.pool.to_string()),
            ])
            .build()
    }

    // `RUST_LOG` overrides the level-derived default for both layers.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(self.log_level).into())
    }

    fn span_processor(&self) -> Result<BatchSpanProcessor, TelemetryError> {
        let exporter = SpanExporter::builder()
            .with_http()
            .with_http_client(blocking_http_client()?)
            .with_endpoint(HYPERDX_ENDPOINT)
            .with_headers(HashMap::from([(
                "authorization".to_string(),
                self.api_key.clone(),
            )]))
            .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
            .build()?;

        let batch_config = BatchConfigBuilder::default()
            .with_max_export_batch_size(512)
            .with_max_queue_size(2048)
            .with_scheduled_delay(EXPORT_INTERVAL)
            .build();

        Ok(BatchSpanProcessor::builder(exporter)
            .with_batch_config(batch_config)
            .build())
    }
}

fn blocking_http_client() -> Result<reqwest::blocking::Client, TelemetryError> {
    std::thread::spawn(|| reqwest::blocking::Client::builder().gzip(true).build())
        .join()
        .map_err(|_| TelemetryError::ThreadSpawn)?
        .map_err(|error| TelemetryError::HttpClient(error.to_string()))
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to build OTLP exporter: {0}")]
    OtlpExporter(#[from] ExporterBuildError),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
    #[error("HTTP client thread panicked")]
    ThreadSpawn,
    #[error("failed to install global subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Exports buffered spans and shuts the provider down when dropped.
pub struct TelemetryGuard {
    tracer_provider: SdkTracerProvider,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        // Shutdown flushes whatever the batch processor still holds.
        if let Err(error) = self.tracer_provider.shutdown() {
            eprintln!("Failed to shut down telemetry: {error:?}");
        }
    }
}
