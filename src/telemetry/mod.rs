//! Logging, tracing and metrics pipelines for queue processes.
//!
//! Log lines always go to stderr; stdout belongs to CLI output. When an OTLP
//! endpoint is configured, queue operation spans, the `relq` meter and log
//! events are exported as well, tagged with the store backend in use.

pub mod metrics;
pub mod queue;

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::Config;
use crate::error::{Error, Result};

/// Service name, tracer name and meter name.
pub const SERVICE_NAME: &str = "relq";

/// Store backend label for PostgreSQL-backed processes.
pub const POSTGRES_STORE: &str = "postgres";
/// Store backend label for in-process stores.
pub const MEMORY_STORE: &str = "memory";

pub struct TelemetryConfig {
    /// OTLP gRPC endpoint. `None` logs to stderr only.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter used when `RUST_LOG` is not set (e.g. "info", "relq=debug").
    pub default_filter: String,
    /// Reported as the `relq.store` resource attribute.
    pub store: &'static str,
}

impl TelemetryConfig {
    pub fn new(endpoint: Option<String>, default_filter: impl Into<String>) -> Self {
        Self {
            endpoint,
            service_name: SERVICE_NAME.to_string(),
            default_filter: default_filter.into(),
            store: POSTGRES_STORE,
        }
    }

    /// stderr-only logging for runs that have no [`Config`], such as an
    /// in-memory load test without a database configured.
    pub fn local(default_filter: impl Into<String>) -> Self {
        Self::new(None, default_filter).with_store(MEMORY_STORE)
    }

    pub fn with_store(mut self, store: &'static str) -> Self {
        self.store = store;
        self
    }

    fn resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attributes([
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                KeyValue::new("relq.store", self.store),
            ])
            .build()
    }
}

impl From<&Config> for TelemetryConfig {
    fn from(config: &Config) -> Self {
        Self::new(config.otel_endpoint.clone(), config.log_level.clone())
    }
}

/// OTLP providers for the three signals.
struct Exporters {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

fn exporter_error(signal: &str, e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

impl Exporters {
    fn connect(endpoint: &str, resource: Resource) -> Result<Self> {
        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("span", e))?;
        let metrics = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("metric", e))?;
        let logs = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("log", e))?;

        Ok(Self {
            tracer: SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(resource.clone())
                .build(),
            meter: SdkMeterProvider::builder()
                .with_periodic_exporter(metrics)
                .with_resource(resource.clone())
                .build(),
            logger: SdkLoggerProvider::builder()
                .with_batch_exporter(logs)
                .with_resource(resource)
                .build(),
        })
    }

    fn force_flush(&self) {
        let _ = self.tracer.force_flush();
        let _ = self.meter.force_flush();
        let _ = self.logger.force_flush();
    }

    /// Log export shuts down first.
    fn shutdown(self) {
        let _ = self.logger.shutdown();
        let _ = self.meter.shutdown();
        let _ = self.tracer.shutdown();
    }
}

/// Flushes and shuts down OTLP export on drop. Hold it for the life of the process.
pub struct TelemetryGuard {
    exporters: Option<Exporters>,
}

impl TelemetryGuard {
    /// Whether signals are being exported over OTLP.
    pub fn is_exporting(&self) -> bool {
        self.exporters.is_some()
    }

    pub fn force_flush(&self) {
        if let Some(exporters) = &self.exporters {
            exporters.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(exporters) = self.exporters.take() {
            exporters.shutdown();
        }
    }
}

/// Install the global subscriber and, with an endpoint, the OTLP pipelines.
///
/// # Errors
///
/// Fails if an exporter cannot be built or a global subscriber is already set.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let exporters = match &config.endpoint {
        Some(endpoint) => Some(Exporters::connect(endpoint, config.resource())?),
        None => None,
    };
    let trace_layer = exporters.as_ref().map(|e| {
        tracing_opentelemetry::layer().with_tracer(e.tracer.tracer(SERVICE_NAME))
    });
    let log_layer = exporters
        .as_ref()
        .map(|e| OpenTelemetryTracingBridge::new(&e.logger));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr),
        )
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    if let Some(exporters) = &exporters {
        opentelemetry::global::set_meter_provider(exporters.meter.clone());
    }
    Ok(TelemetryGuard { exporters })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_config_logs_only_and_reports_memory_store() {
        let config = TelemetryConfig::local("debug");
        assert_eq!(config.endpoint, None);
        assert_eq!(config.store, MEMORY_STORE);
        assert_eq!(config.service_name, SERVICE_NAME);
    }

    #[test]
    fn resource_carries_service_and_store() {
        let resource = TelemetryConfig::new(None, "info").resource();
        let attr = |key: &'static str| resource.get(&opentelemetry::Key::from_static_str(key));
        assert_eq!(attr("service.name").map(|v| v.to_string()), Some("relq".to_string()));
        assert_eq!(attr("relq.store").map(|v| v.to_string()), Some("postgres".to_string()));
    }
}
