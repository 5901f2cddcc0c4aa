//! Tracing Setup
//!
//! Console logging through `tracing-subscriber`, optionally exporting spans to
//! an OTLP collector.
//!
//! Environment variables:
//! - `RUST_LOG` - filter directives (default level `info`)
//! - `LOG_FORMAT` - `json` for JSON lines (default: `text`)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT` - OTLP endpoint; export is off when unset
//! - `OTEL_SERVICE_NAME` - service name on exported spans (default: `slotway`)

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
    Resource,
};
use std::sync::OnceLock;
use tracing::level_filters::LevelFilter;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
    pub log_format: LogFormat,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            service_name: "slotway".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl TracingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            service_name: std::env::var("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
            log_format: std::env::var("LOG_FORMAT")
                .map(|raw| LogFormat::parse(&raw))
                .unwrap_or(defaults.log_format),
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
}

fn fmt_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Json => fmt::layer().json().boxed(),
        LogFormat::Text => fmt::layer().boxed(),
    }
}

/// Install the global subscriber.
///
/// Call once at process start; a second call fails because a global
/// subscriber is already set.
pub fn init_tracing(config: &TracingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(endpoint) = &config.otlp_endpoint else {
        tracing_subscriber::registry()
            .with(fmt_layer(config.log_format))
            .with(env_filter())
            .try_init()?;
        tracing::debug!("Tracing initialized (no OTLP export)");
        return Ok(());
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let provider = SdkTracerProvider::builder()
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(
            Resource::builder()
                .with_service_name(config.service_name.clone())
                .build(),
        )
        .with_batch_exporter(exporter)
        .build();
    let tracer = provider.tracer("slotway");
    let _ = TRACER_PROVIDER.set(provider);

    tracing_subscriber::registry()
        .with(fmt_layer(config.log_format))
        .with(OpenTelemetryLayer::new(tracer))
        .with(env_filter())
        .try_init()?;

    tracing::info!(
        endpoint = %endpoint,
        service_name = %config.service_name,
        "OpenTelemetry tracing initialized"
    );
    Ok(())
}

/// Flush pending spans.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "Error shutting down tracer provider");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("text"), LogFormat::Text);
        assert_eq!(LogFormat::parse("anything"), LogFormat::Text);
    }

    #[test]
    fn test_default_config() {
        let config = TracingConfig::default();
        assert_eq!(config.service_name, "slotway");
        assert!(config.otlp_endpoint.is_none());
    }
}
