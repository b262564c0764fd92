//! Tracing for processes embedding the bridge.
//!
//! The bridge only emits `tracing` spans and events. Embedders that want them
//! printed or exported call [`init_telemetry`] once and hold the returned
//! guard for the life of the process.

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const DEFAULT_SERVICE_NAME: &str = "bigquery-bridge";

static INCLUDE_SQL: OnceLock<bool> = OnceLock::new();

/// Subscriber settings, read from the standard environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// `RUST_LOG` directives
    pub filter: String,
    /// `OTEL_EXPORTER_OTLP_ENDPOINT`; spans are exported only when set
    pub otlp_endpoint: Option<String>,
    /// `OTEL_SERVICE_NAME`
    pub service_name: String,
    /// `OTEL_BQBRIDGE_INCLUDE_SQL`: record SQL text on spans
    pub include_sql: bool,
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            filter: get("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            otlp_endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT").filter(|e| !e.is_empty()),
            service_name: get("OTEL_SERVICE_NAME")
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            include_sql: sql_flag(get("OTEL_BQBRIDGE_INCLUDE_SQL").as_deref()),
        }
    }
}

/// Flushes exported spans when dropped.
#[must_use = "dropping the guard stops span export"]
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("Error shutting down tracer provider: {:?}", e);
            }
        }
    }
}

/// Install the global subscriber: fmt output, plus OTLP export when an
/// endpoint is configured. Fails if a global subscriber is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, BoxError> {
    let _ = INCLUDE_SQL.set(config.include_sql);
    let filter = EnvFilter::try_new(&config.filter)?;

    let provider = match &config.otlp_endpoint {
        Some(endpoint) => {
            opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()?;
            Some(
                SdkTracerProvider::builder()
                    .with_resource(
                        Resource::builder()
                            .with_service_name(config.service_name.clone())
                            .build(),
                    )
                    .with_batch_exporter(exporter)
                    .build(),
            )
        }
        None => None,
    };
    let otel_layer = provider.as_ref().map(|p| {
        tracing_opentelemetry::layer().with_tracer(p.tracer(config.service_name.clone()))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer)
        .try_init()?;

    if let Some(endpoint) = &config.otlp_endpoint {
        tracing::info!(endpoint = %endpoint, "OTLP span export enabled");
    }
    Ok(TelemetryGuard { provider })
}

/// Whether SQL text may be attached to spans. Fixed by [`init_telemetry`];
/// otherwise read once from `OTEL_BQBRIDGE_INCLUDE_SQL` (default true).
pub fn include_sql_in_traces() -> bool {
    *INCLUDE_SQL
        .get_or_init(|| sql_flag(std::env::var("OTEL_BQBRIDGE_INCLUDE_SQL").ok().as_deref()))
}

fn sql_flag(value: Option<&str>) -> bool {
    value.map(|v| v != "false" && v != "0").unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> TelemetryConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TelemetryConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = config(&[]);
        assert_eq!(config.filter, "info");
        assert_eq!(config.otlp_endpoint, None);
        assert_eq!(config.service_name, "bigquery-bridge");
        assert!(config.include_sql);
    }

    #[test]
    fn test_environment_overrides() {
        let overridden = config(&[
            ("RUST_LOG", "bigquery_bridge=debug"),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://collector:4317"),
            ("OTEL_SERVICE_NAME", "etl"),
            ("OTEL_BQBRIDGE_INCLUDE_SQL", "0"),
        ]);
        assert_eq!(overridden.filter, "bigquery_bridge=debug");
        assert_eq!(overridden.otlp_endpoint.as_deref(), Some("http://collector:4317"));
        assert_eq!(overridden.service_name, "etl");
        assert!(!overridden.include_sql);

        // An empty endpoint leaves export off
        assert_eq!(
            config(&[("OTEL_EXPORTER_OTLP_ENDPOINT", "")]).otlp_endpoint,
            None
        );
    }

    #[test]
    fn test_sql_flag_values() {
        assert!(sql_flag(None));
        assert!(sql_flag(Some("true")));
        assert!(!sql_flag(Some("false")));
        assert!(!sql_flag(Some("0")));
    }
}
