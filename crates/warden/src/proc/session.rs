//! The per-stream state machine. One session handles exactly one HTTP
//! request: it pins a snapshot on the first message, resolves the route's
//! chain, and drives the pipeline across the four phases.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use protos::envoy::service::ext_proc::v3::processing_request::Request;
use protos::envoy::service::ext_proc::v3::{HttpBody, HttpHeaders, ProcessingRequest, ProcessingResponse};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::http::{BodyState, RequestContext, ResponseContext};
use crate::pipeline::{RequestPhaseAction, Stage};
use crate::policy::chain::PolicyChain;
use crate::proc::{Engine, wire};
use crate::store::Snapshot;

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
	AwaitRequestHeaders,
	AwaitRequestBody,
	AwaitResponseHeaders,
	AwaitResponseBody,
	Complete,
}

pub struct Session {
	engine: Arc<Engine>,
	state: State,
	// Pinned for the life of the request; concurrent snapshot swaps never
	// change what this stream executes.
	snapshot: Option<Arc<Snapshot>>,
	chain: Option<Arc<PolicyChain>>,
	request: Option<RequestContext>,
	response: Option<ResponseContext>,
	route_key: String,
	request_id: String,
	started: SystemTime,
	executed: usize,
	outcome: &'static str,
}

impl Session {
	pub fn new(engine: Arc<Engine>) -> Self {
		Self {
			engine,
			state: State::AwaitRequestHeaders,
			snapshot: None,
			chain: None,
			request: None,
			response: None,
			route_key: String::new(),
			request_id: String::new(),
			started: SystemTime::now(),
			executed: 0,
			outcome: "continue",
		}
	}

	pub fn is_complete(&self) -> bool {
		self.state == State::Complete
	}

	/// Handles one inbound message, producing at most one outbound message.
	pub async fn on_message(&mut self, msg: ProcessingRequest) -> Option<ProcessingResponse> {
		match msg.request {
			Some(Request::RequestHeaders(headers)) => {
				Some(self.on_request_headers(headers, &msg.attributes).await)
			},
			Some(Request::RequestBody(body)) => Some(self.on_request_body(body).await),
			Some(Request::ResponseHeaders(headers)) => Some(self.on_response_headers(headers).await),
			Some(Request::ResponseBody(body)) => Some(self.on_response_body(body).await),
			// Trailers are ignored, but the proxy still expects an answer.
			Some(Request::RequestTrailers(_)) => Some(wire::request_trailers_response()),
			Some(Request::ResponseTrailers(_)) => Some(wire::response_trailers_response()),
			None => None,
		}
	}

	async fn on_request_headers(
		&mut self,
		headers: HttpHeaders,
		attributes: &std::collections::HashMap<String, prost_types::Struct>,
	) -> ProcessingResponse {
		if self.state != State::AwaitRequestHeaders {
			warn!(state = ?self.state, "unexpected request_headers message");
			return wire::request_headers_response(None, None);
		}
		let snapshot = self.engine.store.current();
		let chain = wire::route_key(attributes)
			.inspect(|key| self.route_key = key.clone())
			.and_then(|key| snapshot.chain(&key));
		self.snapshot = Some(snapshot);

		let mut ctx = RequestContext {
			headers: self.engine.pools.headers.get(),
			metadata: self.engine.pools.metadata.get(),
			..Default::default()
		};
		let pseudo = wire::split_headers(headers.headers.as_ref(), &mut ctx.headers);
		ctx.path = pseudo.path;
		ctx.method = pseudo.method;
		ctx.authority = pseudo.authority;
		ctx.scheme = pseudo.scheme;
		ctx.request_id = ctx
			.headers
			.get("x-request-id")
			.map(str::to_string)
			.unwrap_or_else(|| Uuid::new_v4().to_string());
		self.request_id = ctx.request_id.clone();

		let Some(chain) = chain else {
			// Unknown route: pass the request through untouched.
			debug!(route = %self.route_key, "no chain for route, passing through");
			self.outcome = "passthrough";
			self.request = Some(ctx);
			self.state = State::AwaitResponseHeaders;
			return wire::request_headers_response(None, None);
		};
		ctx.api_name = chain.route.api_name.clone();
		ctx.api_version = chain.route.api_version.clone();
		ctx.api_context = chain.route.api_context.clone();
		ctx.operation_path = chain.route.operation_path.clone();

		let result = self
			.engine
			.pipeline
			.run_request(&chain, &mut ctx, Stage::Headers)
			.await;
		self.executed += result.executed;
		self.request = Some(ctx);
		match result.action {
			RequestPhaseAction::ShortCircuit(resp) => {
				self.engine.metrics.immediate_responses.inc();
				self.outcome = "immediate";
				self.state = State::Complete;
				self.chain = Some(chain);
				wire::immediate_response(&resp)
			},
			RequestPhaseAction::Continue(mutations) => {
				let mode = wire::mode_override(&chain);
				self.state = if chain.requires_request_body {
					State::AwaitRequestBody
				} else {
					State::AwaitResponseHeaders
				};
				self.chain = Some(chain);
				wire::request_headers_response(mutations.into_common_response(), mode)
			},
		}
	}

	async fn on_request_body(&mut self, body: HttpBody) -> ProcessingResponse {
		if self.state != State::AwaitRequestBody {
			warn!(state = ?self.state, "unexpected request_body message");
			return wire::request_body_response(None);
		}
		let (Some(chain), Some(mut ctx)) = (self.chain.clone(), self.request.take()) else {
			self.state = State::AwaitResponseHeaders;
			return wire::request_body_response(None);
		};
		ctx.body = BodyState::received(Bytes::from(body.body), body.end_of_stream);
		let result = self
			.engine
			.pipeline
			.run_request(&chain, &mut ctx, Stage::Body)
			.await;
		self.executed += result.executed;
		self.request = Some(ctx);
		match result.action {
			RequestPhaseAction::ShortCircuit(resp) => {
				self.engine.metrics.immediate_responses.inc();
				self.outcome = "immediate";
				self.state = State::Complete;
				wire::immediate_response(&resp)
			},
			RequestPhaseAction::Continue(mutations) => {
				self.state = State::AwaitResponseHeaders;
				wire::request_body_response(mutations.into_common_response())
			},
		}
	}

	async fn on_response_headers(&mut self, headers: HttpHeaders) -> ProcessingResponse {
		// A buffered request body is not guaranteed: the proxy skips the
		// body message entirely for bodiless requests.
		if !matches!(
			self.state,
			State::AwaitResponseHeaders | State::AwaitRequestBody
		) {
			warn!(state = ?self.state, "unexpected response_headers message");
			return wire::response_headers_response(None);
		}
		let Some(req) = self.request.take() else {
			warn!("response headers arrived before request headers");
			self.state = State::Complete;
			return wire::response_headers_response(None);
		};
		let mut resp_headers = self.engine.pools.headers.get();
		let pseudo = wire::split_headers(headers.headers.as_ref(), &mut resp_headers);
		let status = pseudo.status.unwrap_or(200);
		let mut ctx = ResponseContext::from_request(req, status, resp_headers);

		let Some(chain) = self.chain.clone() else {
			self.response = Some(ctx);
			self.state = State::Complete;
			return wire::response_headers_response(None);
		};
		let result = self
			.engine
			.pipeline
			.run_response(&chain, &mut ctx, Stage::Headers)
			.await;
		self.executed += result.executed;
		self.response = Some(ctx);
		self.state = if chain.requires_response_body {
			State::AwaitResponseBody
		} else {
			State::Complete
		};
		wire::response_headers_response(result.mutations.into_common_response())
	}

	async fn on_response_body(&mut self, body: HttpBody) -> ProcessingResponse {
		if self.state != State::AwaitResponseBody {
			warn!(state = ?self.state, "unexpected response_body message");
			return wire::response_body_response(None);
		}
		let (Some(chain), Some(mut ctx)) = (self.chain.clone(), self.response.take()) else {
			self.state = State::Complete;
			return wire::response_body_response(None);
		};
		ctx.body = BodyState::received(Bytes::from(body.body), body.end_of_stream);
		let result = self
			.engine
			.pipeline
			.run_response(&chain, &mut ctx, Stage::Body)
			.await;
		self.executed += result.executed;
		self.response = Some(ctx);
		self.state = State::Complete;
		wire::response_body_response(result.mutations.into_common_response())
	}
}

impl Drop for Session {
	fn drop(&mut self) {
		// Stream teardown: pooled context maps go back, the pinned snapshot
		// is released, and the per-stream span is recorded.
		if let Some(req) = self.request.take() {
			self.engine.pools.release_request(req);
		}
		if let Some(resp) = self.response.take() {
			self.engine.pools.release_response(resp);
		}
		self.snapshot = None;
		if let Some(tracer) = &self.engine.tracer {
			tracer.record_stream(
				&self.route_key,
				&self.request_id,
				self.started,
				self.executed,
				self.outcome,
			);
		}
	}
}
