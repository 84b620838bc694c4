//! The ext_proc gRPC surface: one bidirectional stream per HTTP request,
//! dispatched onto a per-stream `Session`.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use protos::envoy::service::ext_proc::v3::external_processor_server::ExternalProcessor;
pub use protos::envoy::service::ext_proc::v3::external_processor_server::ExternalProcessorServer;
use protos::envoy::service::ext_proc::v3::{ProcessingRequest, ProcessingResponse};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use crate::http::{Headers, Metadata, RequestContext, ResponseContext};
use crate::pipeline::Pipeline;
use crate::pool::Pool;
use crate::store::SnapshotStore;
use crate::telemetry::metrics::Metrics;
use crate::telemetry::trc;

pub mod merge;
pub mod session;
pub mod wire;

use session::Session;

/// Freelists for the per-request context maps. Borrowed on stream start,
/// cleared and returned on stream close.
pub struct ContextPools {
	pub headers: Pool<Headers>,
	pub metadata: Pool<Metadata>,
}

impl ContextPools {
	pub fn new(cap: usize) -> Self {
		Self {
			headers: Pool::new(cap),
			metadata: Pool::new(cap),
		}
	}

	pub fn release_request(&self, ctx: RequestContext) {
		self.headers.put(ctx.headers);
		self.metadata.put(ctx.metadata);
	}

	pub fn release_response(&self, ctx: ResponseContext) {
		self.headers.put(ctx.request.headers);
		self.headers.put(ctx.headers);
		self.metadata.put(ctx.metadata);
	}
}

/// Everything shared across streams.
pub struct Engine {
	pub store: Arc<SnapshotStore>,
	pub pipeline: Pipeline,
	pub pools: ContextPools,
	pub metrics: Arc<Metrics>,
	pub tracer: Option<trc::Tracer>,
}

impl Engine {
	pub fn new(
		store: Arc<SnapshotStore>,
		policy_timeout: Duration,
		metrics: Arc<Metrics>,
		tracer: Option<trc::Tracer>,
	) -> Self {
		Self {
			store,
			pipeline: Pipeline::new(policy_timeout, metrics.clone()),
			pools: ContextPools::new(128),
			metrics,
			tracer,
		}
	}
}

pub struct ExtProcService {
	engine: Arc<Engine>,
}

impl ExtProcService {
	pub fn new(engine: Arc<Engine>) -> Self {
		Self { engine }
	}

	/// The tonic service wrapper the transport server mounts.
	pub fn into_server(self) -> ExternalProcessorServer<ExtProcService> {
		ExternalProcessorServer::new(self)
	}
}

#[tonic::async_trait]
impl ExternalProcessor for ExtProcService {
	type ProcessStream =
		Pin<Box<dyn Stream<Item = Result<ProcessingResponse, Status>> + Send + 'static>>;

	async fn process(
		&self,
		request: Request<Streaming<ProcessingRequest>>,
	) -> Result<Response<Self::ProcessStream>, Status> {
		let engine = self.engine.clone();
		engine.metrics.streams.inc();
		let mut inbound = request.into_inner();
		let (tx, rx) = mpsc::channel::<Result<ProcessingResponse, Status>>(16);
		tokio::spawn(async move {
			let mut session = Session::new(engine);
			loop {
				let msg = match inbound.message().await {
					Ok(Some(msg)) => msg,
					Ok(None) => break,
					Err(status) => {
						// Transport errors are scoped to this stream only.
						debug!("ext_proc stream error: {status}");
						break;
					},
				};
				if let Some(resp) = session.on_message(msg).await {
					if tx.send(Ok(resp)).await.is_err() {
						break;
					}
				}
				// After an immediate response the proxy gets nothing more.
				if session.is_complete() {
					break;
				}
			}
		});
		Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
	}
}
