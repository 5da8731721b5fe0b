use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::BatchSpanProcessor, trace::SdkTracerProvider};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{AppConfig, TelemetryConfig};

static GLOBAL_GUARD: OnceLock<Mutex<Option<TelemetryGuard>>> = OnceLock::new();

/// Owns the tracer provider so buffered spans are flushed on drop.
#[derive(Clone)]
pub struct TelemetryGuard {
    provider: Option<Arc<SdkTracerProvider>>,
    shutdown_on_drop: bool,
}

impl TelemetryGuard {
    fn disabled() -> Self {
        Self {
            provider: None,
            shutdown_on_drop: false,
        }
    }

    pub fn exports_traces(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.shutdown_on_drop {
            if let Some(provider) = self.provider.take() {
                if Arc::strong_count(&provider) == 1 {
                    let _ = provider.shutdown();
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to set tracing subscriber: {0}")]
    SubscriberInit(String),
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(String),
}

/// Initialize `RUST_LOG`-driven logging and, when configured, OTLP trace export.
///
/// The `dev` environment logs human-readable lines to stderr; every other
/// environment logs one JSON object per event.
pub fn init_telemetry(
    app: &AppConfig,
    telemetry: &TelemetryConfig,
) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;

    let provider = build_provider(app, telemetry)?;
    let otel_layer = provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(app.service_name.clone()))
    });

    let fmt_layer = if app.env.eq_ignore_ascii_case("dev") {
        fmt::layer()
            .with_target(true)
            .pretty()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed()
    };

    Registry::default()
        .with(fmt_layer)
        .with(otel_layer)
        .with(env_filter)
        .try_init()
        .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;

    Ok(provider.map(retain_provider).unwrap_or_else(TelemetryGuard::disabled))
}

/// Logging-only initializer for binaries that run without a config file.
pub fn init_logging(env: &str) -> Result<(), TelemetryError> {
    let app = AppConfig {
        service_name: "miramail".to_string(),
        env: env.to_string(),
    };
    init_telemetry(&app, &TelemetryConfig::default()).map(|_guard| ())
}

fn build_provider(
    app: &AppConfig,
    telemetry: &TelemetryConfig,
) -> Result<Option<Arc<SdkTracerProvider>>, TelemetryError> {
    if !telemetry.export_traces {
        return Ok(None);
    }

    let endpoint = match telemetry.otlp_endpoint.as_deref() {
        Some(endpoint) if !endpoint.is_empty() => endpoint,
        _ => return Ok(None),
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_timeout(Duration::from_secs(3))
        .with_endpoint(endpoint)
        .build()
        .map_err(|err| TelemetryError::ExporterBuild(err.to_string()))?;

    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", app.service_name.clone()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("deployment.environment", app.env.clone()),
        ])
        .build();
    let provider = SdkTracerProvider::builder()
        .with_span_processor(BatchSpanProcessor::builder(exporter).build())
        .with_resource(resource)
        .build();

    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(opentelemetry_sdk::propagation::TraceContextPropagator::new());

    Ok(Some(Arc::new(provider)))
}

// A second handle lives in a process-wide slot so spans still flush if the
// caller drops its guard early.
fn retain_provider(provider: Arc<SdkTracerProvider>) -> TelemetryGuard {
    let global_guard = TelemetryGuard {
        provider: Some(provider.clone()),
        shutdown_on_drop: true,
    };

    let slot = GLOBAL_GUARD.get_or_init(|| Mutex::new(None));
    if let Ok(mut slot) = slot.lock() {
        *slot = Some(global_guard);
    }

    TelemetryGuard {
        provider: Some(provider),
        shutdown_on_drop: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_is_disabled_without_export_flag() {
        let app = AppConfig {
            service_name: "miramail".into(),
            env: "dev".into(),
        };
        let telemetry = TelemetryConfig {
            otlp_endpoint: Some("http://localhost:4318".into()),
            export_traces: false,
        };

        let provider = build_provider(&app, &telemetry).expect("build provider");
        assert!(provider.is_none());
    }

    #[test]
    fn tracing_is_disabled_without_endpoint() {
        let app = AppConfig {
            service_name: "miramail".into(),
            env: "prod".into(),
        };
        let telemetry = TelemetryConfig {
            otlp_endpoint: Some(String::new()),
            export_traces: true,
        };

        let provider = build_provider(&app, &telemetry).expect("build provider");
        assert!(provider.is_none());
    }

    #[test]
    fn disabled_guard_reports_no_export() {
        assert!(!TelemetryGuard::disabled().exports_traces());
    }
}
