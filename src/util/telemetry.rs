//! Log and trace setup for the CLI.
//!
//! Logs go to stderr through `tracing-subscriber`, filtered by `RUST_LOG` (default
//! `info`), so that command output on stdout stays machine-readable. With the
//! `telemetry` feature and any `OTEL_EXPORTER_OTLP_*` variable set, spans and metrics
//! are also exported over OTLP. `OTEL_TRACES_EXPORTER=console` (or
//! `OTEL_METRICS_EXPORTER=console`) prints them to stdout instead.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(feature = "telemetry")]
mod otel {
    use opentelemetry::{KeyValue, global};
    use opentelemetry_sdk::{
        Resource,
        metrics::{MeterProviderBuilder, PeriodicReader, SdkMeterProvider},
        trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
    };
    use opentelemetry_semantic_conventions::{
        SCHEMA_URL,
        attribute::{DEPLOYMENT_ENVIRONMENT_NAME, SERVICE_VERSION},
    };
    use std::env;

    #[allow(clippy::upper_case_acronyms)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum TelemetryProtocol {
        HTTP,
        GRPC,
        /// Spans and metrics printed to stdout, for local inspection.
        Console,
    }

    impl TelemetryProtocol {
        pub fn from_env() -> Option<Self> {
            Self::from_vars(|name| env::var(name).ok())
        }

        /// `console` in `OTEL_TRACES_EXPORTER` or `OTEL_METRICS_EXPORTER` selects the stdout
        /// exporters. Otherwise any `OTEL_EXPORTER_OTLP_*` variable enables OTLP.
        pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Option<Self> {
            let console = ["OTEL_TRACES_EXPORTER", "OTEL_METRICS_EXPORTER"]
                .into_iter()
                .any(|name| var(name).as_deref() == Some("console"));
            if console {
                return Some(TelemetryProtocol::Console);
            }
            let is_enabled = var("OTEL_EXPORTER_OTLP_ENDPOINT").is_some()
                || var("OTEL_EXPORTER_OTLP_HEADERS").is_some()
                || var("OTEL_EXPORTER_OTLP_PROTOCOL").is_some();
            if !is_enabled {
                return None;
            }
            let protocol = match var("OTEL_EXPORTER_OTLP_PROTOCOL").as_deref() {
                Some("grpc") => TelemetryProtocol::GRPC,
                _ => TelemetryProtocol::HTTP,
            };
            Some(protocol)
        }
    }

    fn resource() -> Resource {
        let deployment_env = env::var("DEPLOYMENT_ENV").unwrap_or_else(|_| "develop".to_string());
        Resource::builder()
            .with_service_name(env!("CARGO_PKG_NAME"))
            .with_schema_url(
                [
                    KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
                    KeyValue::new(DEPLOYMENT_ENVIRONMENT_NAME, deployment_env),
                ],
                SCHEMA_URL,
            )
            .build()
    }

    pub fn init_meter_provider(
        protocol: TelemetryProtocol,
    ) -> Result<SdkMeterProvider, opentelemetry_otlp::ExporterBuildError> {
        let interval = std::time::Duration::from_secs(30);
        let builder = MeterProviderBuilder::default().with_resource(resource());
        let builder = match protocol {
            TelemetryProtocol::HTTP => {
                let exporter = opentelemetry_otlp::MetricExporter::builder()
                    .with_http()
                    .with_temporality(opentelemetry_sdk::metrics::Temporality::default())
                    .build()?;
                builder.with_reader(PeriodicReader::builder(exporter).with_interval(interval).build())
            }
            TelemetryProtocol::GRPC => {
                let exporter = opentelemetry_otlp::MetricExporter::builder()
                    .with_tonic()
                    .with_temporality(opentelemetry_sdk::metrics::Temporality::default())
                    .build()?;
                builder.with_reader(PeriodicReader::builder(exporter).with_interval(interval).build())
            }
            TelemetryProtocol::Console => builder.with_reader(
                PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default()).build(),
            ),
        };
        let meter_provider = builder.build();
        global::set_meter_provider(meter_provider.clone());
        Ok(meter_provider)
    }

    pub fn init_tracer_provider(
        protocol: TelemetryProtocol,
    ) -> Result<SdkTracerProvider, opentelemetry_otlp::ExporterBuildError> {
        let builder = SdkTracerProvider::builder()
            .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                1.0,
            ))))
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(resource());
        let builder = match protocol {
            TelemetryProtocol::HTTP => builder
                .with_batch_exporter(opentelemetry_otlp::SpanExporter::builder().with_http().build()?),
            TelemetryProtocol::GRPC => builder
                .with_batch_exporter(opentelemetry_otlp::SpanExporter::builder().with_tonic().build()?),
            TelemetryProtocol::Console => {
                builder.with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            }
        };
        Ok(builder.build())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::collections::HashMap;

        fn protocol(vars: &[(&str, &str)]) -> Option<TelemetryProtocol> {
            let vars: HashMap<String, String> = vars
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            TelemetryProtocol::from_vars(|name| vars.get(name).cloned())
        }

        #[test]
        fn test_protocol_from_vars() {
            assert_eq!(protocol(&[]), None);
            assert_eq!(
                protocol(&[("OTEL_EXPORTER_OTLP_ENDPOINT", "http://localhost:4318")]),
                Some(TelemetryProtocol::HTTP)
            );
            assert_eq!(
                protocol(&[("OTEL_EXPORTER_OTLP_PROTOCOL", "grpc")]),
                Some(TelemetryProtocol::GRPC)
            );
            assert_eq!(
                protocol(&[
                    ("OTEL_METRICS_EXPORTER", "console"),
                    ("OTEL_EXPORTER_OTLP_PROTOCOL", "grpc")
                ]),
                Some(TelemetryProtocol::Console)
            );
            assert_eq!(protocol(&[("OTEL_TRACES_EXPORTER", "otlp")]), None);
        }
    }
}

/// Installed subscriber plus exporters to flush on drop.
pub struct Telemetry {
    #[cfg(feature = "telemetry")]
    tracer_provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
    #[cfg(feature = "telemetry")]
    meter_provider: Option<opentelemetry_sdk::metrics::SdkMeterProvider>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    #[cfg(not(feature = "telemetry"))]
    pub fn new() -> Self {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
        Self {}
    }

    #[cfg(feature = "telemetry")]
    pub fn new() -> Self {
        use opentelemetry::trace::TracerProvider as _;
        use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};

        let providers = otel::TelemetryProtocol::from_env().map(|protocol| {
            let tracer = otel::init_tracer_provider(protocol)?;
            let meter = otel::init_meter_provider(protocol)?;
            Ok::<_, opentelemetry_otlp::ExporterBuildError>((protocol, tracer, meter))
        });
        match providers {
            Some(Ok((protocol, tracer_provider, meter_provider))) => {
                let tracer = tracer_provider.tracer("microapi-x402");
                tracing_subscriber::registry()
                    .with(env_filter())
                    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                    .with(MetricsLayer::new(meter_provider.clone()))
                    .with(OpenTelemetryLayer::new(tracer))
                    .init();
                tracing::info!(?protocol, "OpenTelemetry export enabled");
                Self {
                    tracer_provider: Some(tracer_provider),
                    meter_provider: Some(meter_provider),
                }
            }
            other => {
                tracing_subscriber::registry()
                    .with(env_filter())
                    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                    .init();
                if let Some(Err(e)) = other {
                    tracing::warn!(error = %e, "OTLP exporter unavailable, logging locally only");
                }
                Self {
                    tracer_provider: None,
                    meter_provider: None,
                }
            }
        }
    }
}

#[cfg(feature = "telemetry")]
impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(tracer_provider) = self.tracer_provider.as_ref() {
            if let Err(err) = tracer_provider.shutdown() {
                eprintln!("{err:?}");
            }
        }
        if let Some(meter_provider) = self.meter_provider.as_ref() {
            if let Err(err) = meter_provider.shutdown() {
                eprintln!("{err:?}");
            }
        }
    }
}
