//! Tracing subscriber setup
//!
//! Installs an `EnvFilter` + `fmt` subscriber. With the `otel` feature and an
//! OTLP endpoint configured, spans are also exported over gRPC.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Configuration for logging and trace export
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for traces
    pub service_name: String,
    pub service_version: Option<String>,
    /// OTLP endpoint (e.g., "http://localhost:4317"); ignored without the `otel` feature
    pub otlp_endpoint: Option<String>,
    /// Deployment environment (e.g., "staging")
    pub environment: Option<String>,
    pub enable_console: bool,
    /// Log filter (e.g., "info", "ledgerflow_durable=debug")
    pub log_filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "ledgerflow-durable".to_string(),
            service_version: None,
            otlp_endpoint: None,
            environment: None,
            enable_console: true,
            log_filter: None,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `OTEL_SERVICE_NAME`: Service name (default: "ledgerflow-durable")
    /// - `OTEL_SERVICE_VERSION`: Service version
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint
    /// - `OTEL_ENVIRONMENT`: Deployment environment
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
            service_version: std::env::var("OTEL_SERVICE_VERSION").ok(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            environment: std::env::var("OTEL_ENVIRONMENT").ok(),
            enable_console: defaults.enable_console,
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
        }
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    pub fn with_otlp_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = Some(endpoint.into());
        self
    }

    fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

/// Flushes and shuts down the trace exporter when dropped
///
/// Keep it alive for the lifetime of the process.
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("Failed to shutdown tracer provider: {:?}", e);
            }
        }
    }
}

/// Install the global subscriber
///
/// Calling it twice keeps the first subscriber; the second install is logged
/// and ignored.
///
/// ```ignore
/// use ledgerflow_durable::telemetry::{init_telemetry, TelemetryConfig};
///
/// let _guard = init_telemetry(TelemetryConfig::from_env());
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let console_layer = config.enable_console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(config.filter())
    });

    #[cfg(feature = "otel")]
    {
        let (provider, otel_layer, otel_status) = match &config.otlp_endpoint {
            Some(endpoint) => match otlp::build_tracer(&config, endpoint) {
                Ok((provider, tracer)) => {
                    let layer = tracing_opentelemetry::layer().with_tracer(tracer);
                    (Some(provider), Some(layer), Some(Ok(endpoint.clone())))
                }
                Err(e) => (None, None, Some(Err(e.to_string()))),
            },
            None => (None, None, None),
        };

        let installed = tracing_subscriber::registry()
            .with(console_layer)
            .with(otel_layer)
            .try_init();
        if installed.is_err() {
            tracing::debug!("global subscriber already installed");
        }

        match otel_status {
            Some(Ok(endpoint)) => tracing::info!(%endpoint, "OpenTelemetry tracing enabled"),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "failed to initialize OTLP tracer, continuing without export")
            }
            None => tracing::debug!("OpenTelemetry tracing disabled: no OTLP endpoint"),
        }

        TelemetryGuard { provider }
    }

    #[cfg(not(feature = "otel"))]
    {
        let installed = tracing_subscriber::registry().with(console_layer).try_init();
        if installed.is_err() {
            tracing::debug!("global subscriber already installed");
        }
        if config.otlp_endpoint.is_some() {
            tracing::warn!("OTLP endpoint set but the `otel` feature is disabled");
        }
        TelemetryGuard {}
    }
}

#[cfg(feature = "otel")]
mod otlp {
    use std::time::Duration;

    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::{SpanExporter, WithExportConfig};
    use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider, Tracer};
    use opentelemetry_sdk::Resource;

    use super::TelemetryConfig;

    pub(super) fn build_tracer(
        config: &TelemetryConfig,
        endpoint: &str,
    ) -> Result<(SdkTracerProvider, Tracer), Box<dyn std::error::Error + Send + Sync>> {
        let mut attributes = vec![KeyValue::new("service.name", config.service_name.clone())];
        if let Some(version) = &config.service_version {
            attributes.push(KeyValue::new("service.version", version.clone()));
        }
        if let Some(env) = &config.environment {
            attributes.push(KeyValue::new("deployment.environment", env.clone()));
        }
        let resource = Resource::builder().with_attributes(attributes).build();

        let exporter = SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .with_timeout(Duration::from_secs(10))
            .build()?;

        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_sampler(Sampler::AlwaysOn)
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(resource)
            .build();
        let tracer = provider.tracer("ledgerflow-durable");
        Ok((provider, tracer))
    }
}
