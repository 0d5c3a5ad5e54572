use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub json_logs: bool,
    /// Export spans over OTLP/HTTP. Needs the `otel` feature.
    pub otel: bool,
    pub otel_endpoint: Option<String>,
}

/// Keeps the span exporter alive; flushes it on drop.
#[derive(Debug, Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        if let Some(provider) = self.provider.take() {
            let _ = provider.shutdown();
        }
    }
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

fn fmt_layer<S>(json_logs: bool) -> Box<dyn tracing_subscriber::Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    }
}

pub fn init_tracing(
    config: &TelemetryConfig,
) -> Result<TelemetryGuard, Box<dyn std::error::Error>> {
    if config.otel {
        #[cfg(feature = "otel")]
        return init_with_otel(config);

        #[cfg(not(feature = "otel"))]
        return Err("--otel requires building with the `otel` feature".into());
    }

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer(config.json_logs))
        .try_init()?;
    Ok(TelemetryGuard::default())
}

#[cfg(feature = "otel")]
fn init_with_otel(
    config: &TelemetryConfig,
) -> Result<TelemetryGuard, Box<dyn std::error::Error>> {
    use opentelemetry::global;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::SpanExporter;
    use opentelemetry_otlp::WithExportConfig as _;
    use opentelemetry_sdk::Resource;

    let mut exporter = SpanExporter::builder().with_http();
    if let Some(endpoint) = config.otel_endpoint.as_deref() {
        exporter = exporter.with_endpoint(endpoint.to_string());
    }
    let exporter = exporter.build()?;

    let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            Resource::builder_empty()
                .with_service_name(config.service_name.clone())
                .build(),
        )
        .build();
    global::set_tracer_provider(provider.clone());

    let tracer = provider.tracer(config.service_name.clone());
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer(config.json_logs))
        .with(otel_layer)
        .try_init()?;

    Ok(TelemetryGuard {
        provider: Some(provider),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "otel"))]
    #[test]
    fn otel_export_needs_the_feature() {
        let err = init_tracing(&TelemetryConfig {
            service_name: "imagegen-gateway".to_string(),
            otel: true,
            ..TelemetryConfig::default()
        })
        .expect_err("otel without feature");
        assert!(err.to_string().contains("otel"));
    }
}
