//! OpenTelemetry tracer provider for gateway spans.
//!
//! Spans are sampled and given ids so that trace context is propagated to
//! the RPC backends; no exporter is installed.

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, Tracer, TracerProvider};

/// Owns the tracer provider.
///
/// When dropped, shuts the provider down.
#[derive(Debug)]
pub struct TelemetryGuard {
    provider: TracerProvider,
}

impl TelemetryGuard {
    /// Tracer for the gateway, usable with [`Builder::tracer`](crate::Builder::tracer).
    pub fn tracer(&self, name: &'static str) -> Tracer {
        self.provider.tracer(name)
    }

    pub fn provider(&self) -> &TracerProvider {
        &self.provider
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            tracing::debug!(error = %e, "Tracer provider shutdown failed");
        }
    }
}

/// Build the tracer provider.
///
/// The provider is not installed globally; hand its tracer to the service
/// builder.
///
/// Returns `None` when tracing is disabled. The gateway then uses a no-op
/// tracer and still propagates incoming context.
pub fn init_telemetry(service_name: &str, enabled: bool) -> Option<TelemetryGuard> {
    if !enabled {
        tracing::info!("OpenTelemetry tracing disabled");
        return None;
    }

    let provider = build_provider(service_name);
    tracing::info!(service_name, "OpenTelemetry tracing initialized");

    Some(TelemetryGuard { provider })
}

fn build_provider(service_name: &str) -> TracerProvider {
    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION").to_string()),
    ]);

    TracerProvider::builder()
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{Span as _, Tracer as _};

    #[test]
    fn test_disabled_returns_none() {
        assert!(init_telemetry("micro-server", false).is_none());
    }

    #[test]
    fn test_spans_are_sampled_with_valid_ids() {
        let guard = TelemetryGuard {
            provider: build_provider("micro-server-test"),
        };
        let tracer = guard.tracer("gateway");

        let mut span = tracer.start("request");
        let context = span.span_context().clone();
        span.end();

        assert!(context.is_valid());
        assert!(context.is_sampled());
    }
}
