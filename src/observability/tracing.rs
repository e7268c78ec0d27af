//! `tracing-subscriber` initialisation, with optional OpenTelemetry
//! export behind the `otel` feature.
//!
//! Grounded on `observability::tracing::init`'s guard-and-branch shape
//! (`OtelGuard` RAII shutdown, JSON stdout fallback when disabled),
//! trimmed of the teacher's `RedactionLayer`/OTLP log-bridge: this
//! crate's spans carry only ids and byte/packet counters, so there is
//! no analogous PII-bearing field surface to scrub.

use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Registry};

/// RAII guard that shuts down the OTel tracer provider (if any) on
/// drop. Bind this to a variable that lives until the end of `main`.
pub struct OtelGuard {
    #[cfg(feature = "otel")]
    tracer_provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
}

#[cfg(feature = "otel")]
impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take() {
            if let Err(err) = provider.shutdown() {
                tracing::warn!(%err, "otel tracer provider shutdown error");
            }
        }
    }
}

/// Initialises the global `tracing` subscriber. `log_format` is
/// `"json"` for structured stdout output, anything else for
/// pretty/compact dev output (§10). `otel_endpoint`, when `Some` and
/// the crate is built with the `otel` feature, additionally exports
/// spans via OTLP.
#[must_use]
pub fn init(log_format: &str, otel_endpoint: Option<&str>) -> OtelGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otel_endpoint {
            match build_tracer_provider(endpoint) {
                Ok(provider) => {
                    let otel_layer = tracing_opentelemetry::layer()
                        .with_tracer(opentelemetry::trace::TracerProvider::tracer(&provider, "forge-sfu"));
                    if log_format == "json" {
                        Registry::default()
                            .with(filter)
                            .with(otel_layer)
                            .with(fmt_layer.json())
                            .init();
                    } else {
                        Registry::default()
                            .with(filter)
                            .with(otel_layer)
                            .with(fmt_layer.pretty())
                            .init();
                    }
                    return OtelGuard {
                        tracer_provider: Some(provider),
                    };
                }
                Err(err) => {
                    eprintln!("failed to build otel tracer provider: {err}, falling back to stdout only");
                }
            }
        }
    }
    let _ = otel_endpoint;

    if log_format == "json" {
        Registry::default().with(filter).with(fmt_layer.json()).init();
    } else {
        Registry::default().with(filter).with(fmt_layer.pretty()).init();
    }

    #[cfg(feature = "otel")]
    return OtelGuard { tracer_provider: None };
    #[cfg(not(feature = "otel"))]
    OtelGuard {}
}

#[cfg(feature = "otel")]
fn build_tracer_provider(endpoint: &str) -> anyhow::Result<opentelemetry_sdk::trace::SdkTracerProvider> {
    use opentelemetry_otlp::WithExportConfig as _;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    Ok(opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .build())
}
