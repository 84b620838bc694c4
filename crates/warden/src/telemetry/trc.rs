//! OTLP trace export. One span is recorded per ext_proc stream, at stream
//! completion, carrying the route and pipeline outcome.

use std::time::SystemTime;

use opentelemetry::trace::{Span, SpanKind, Tracer as _, TracerProvider as _};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{
	BatchConfigBuilder, BatchSpanProcessor, Sampler, SdkTracer, SdkTracerProvider,
};
use serde::Serialize;
use tracing::debug;

#[derive(Clone, Debug, Serialize)]
pub struct Config {
	pub enabled: bool,
	pub endpoint: String,
	pub sampling_rate: f64,
	pub service_name: String,
	pub service_version: String,
	#[serde(skip)]
	pub batch_timeout: std::time::Duration,
	pub max_export_batch_size: usize,
	pub insecure: bool,
}

#[derive(Clone, Debug)]
pub struct Tracer {
	tracer: SdkTracer,
	provider: SdkTracerProvider,
}

/// Builds the exporter pipeline, or `None` when tracing is disabled.
pub fn init(cfg: &Config) -> anyhow::Result<Option<Tracer>> {
	if !cfg.enabled {
		return Ok(None);
	}
	if !cfg.insecure {
		debug!("tracing.insecure=false: endpoint TLS is delegated to the collector scheme");
	}
	let exporter = opentelemetry_otlp::SpanExporter::builder()
		.with_tonic()
		.with_endpoint(cfg.endpoint.clone())
		.build()?;
	let batch_config = BatchConfigBuilder::default()
		.with_scheduled_delay(cfg.batch_timeout)
		.with_max_export_batch_size(cfg.max_export_batch_size)
		.build();
	let processor = BatchSpanProcessor::builder(exporter)
		.with_batch_config(batch_config)
		.build();
	let resource = Resource::builder()
		.with_service_name(cfg.service_name.clone())
		.with_attribute(KeyValue::new(
			"service.version",
			cfg.service_version.clone(),
		))
		.build();
	let provider = SdkTracerProvider::builder()
		.with_span_processor(processor)
		.with_resource(resource)
		.with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
			cfg.sampling_rate,
		))))
		.build();
	let tracer = provider.tracer("warden");
	Ok(Some(Tracer { tracer, provider }))
}

impl Tracer {
	/// Emits the per-stream span. Called once, after the stream completes.
	pub fn record_stream(
		&self,
		route: &str,
		request_id: &str,
		started: SystemTime,
		policies_run: usize,
		outcome: &str,
	) {
		let mut span = self.tracer.build(
			opentelemetry::trace::SpanBuilder::from_name("ext_proc.stream")
				.with_kind(SpanKind::Server)
				.with_start_time(started)
				.with_attributes(vec![
					KeyValue::new("warden.route", route.to_string()),
					KeyValue::new("warden.request_id", request_id.to_string()),
					KeyValue::new("warden.policies_run", policies_run as i64),
					KeyValue::new("warden.outcome", outcome.to_string()),
				]),
		);
		span.end();
	}

	pub fn shutdown(&self) {
		if let Err(e) = self.provider.shutdown() {
			debug!("trace provider shutdown: {e}");
		}
	}
}
