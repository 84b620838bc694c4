//! The policy contract: what a compiled-in policy implements and what it may
//! return from each phase.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::http::{BodyState, RequestContext, ResponseContext};

pub mod apikey;
pub mod builtin;
pub mod chain;
pub mod jwt;
pub mod ratelimit;
pub mod regex_guardrail;
pub mod registry;
pub mod transform;

/// Resolved parameter bag handed to factories and phase hooks.
pub type ParamMap = serde_json::Map<String, serde_json::Value>;

pub type PolicyError = anyhow::Error;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HeaderMode {
	#[default]
	Process,
	Skip,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BodyMode {
	#[default]
	Skip,
	/// The proxy accumulates the full body before handing it over.
	Buffered,
}

/// What the proxy should send for each phase of a request handled by this
/// policy. The chain ORs these across members before answering the proxy.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingMode {
	pub request_header_mode: HeaderMode,
	pub request_body_mode: BodyMode,
	pub response_header_mode: HeaderMode,
	pub response_body_mode: BodyMode,
}

impl ProcessingMode {
	pub const fn request_headers_only() -> Self {
		Self {
			request_header_mode: HeaderMode::Process,
			request_body_mode: BodyMode::Skip,
			response_header_mode: HeaderMode::Skip,
			response_body_mode: BodyMode::Skip,
		}
	}
}

/// Header/body/pseudo mutations to apply to the upstream request. All header
/// names are treated case-insensitively.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestModifications {
	pub set_headers: Vec<(String, String)>,
	pub append_headers: Vec<(String, String)>,
	pub remove_headers: Vec<String>,
	/// `None` means no change; an empty buffer clears the body.
	pub body: Option<Bytes>,
	pub path: Option<String>,
	pub method: Option<String>,
}

impl RequestModifications {
	pub fn is_empty(&self) -> bool {
		self == &Self::default()
	}

	/// Applies the mutation to the in-memory context so the next policy in
	/// the chain observes the cumulative effect. Removes apply last.
	pub fn apply_to(&self, ctx: &mut RequestContext) {
		for (name, value) in &self.set_headers {
			ctx.headers.set(name, value.clone());
		}
		for (name, value) in &self.append_headers {
			ctx.headers.append(name, value.clone());
		}
		for name in &self.remove_headers {
			ctx.headers.remove(name);
		}
		if let Some(body) = &self.body {
			ctx.body = BodyState::received(body.clone(), true);
		}
		if let Some(path) = &self.path {
			ctx.path = path.clone();
		}
		if let Some(method) = &self.method {
			ctx.method = method.clone();
		}
	}
}

/// A short-circuit response returned directly to the client.
#[derive(Clone, Debug, PartialEq)]
pub struct ImmediateResponseSpec {
	pub status: u16,
	pub headers: Vec<(String, String)>,
	pub body: String,
}

impl ImmediateResponseSpec {
	pub fn json(status: u16, body: serde_json::Value) -> Self {
		Self {
			status,
			headers: vec![("content-type".to_string(), "application/json".to_string())],
			body: body.to_string(),
		}
	}
}

/// Request-phase outcome: either keep going with modifications, or stop the
/// pipeline and answer the client immediately.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestAction {
	Modify(RequestModifications),
	Immediate(ImmediateResponseSpec),
}

impl RequestAction {
	pub fn stops_execution(&self) -> bool {
		matches!(self, RequestAction::Immediate(_))
	}
}

/// Response-phase mutations. There is no immediate variant: by the time the
/// response phase runs, the upstream has already answered.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResponseModifications {
	pub set_headers: Vec<(String, String)>,
	pub append_headers: Vec<(String, String)>,
	pub remove_headers: Vec<String>,
	pub body: Option<Bytes>,
	pub status: Option<u16>,
}

pub type ResponseAction = ResponseModifications;

impl ResponseModifications {
	pub fn is_empty(&self) -> bool {
		self == &Self::default()
	}

	pub fn apply_to(&self, ctx: &mut ResponseContext) {
		for (name, value) in &self.set_headers {
			ctx.headers.set(name, value.clone());
		}
		for (name, value) in &self.append_headers {
			ctx.headers.append(name, value.clone());
		}
		for name in &self.remove_headers {
			ctx.headers.remove(name);
		}
		if let Some(body) = &self.body {
			ctx.body = BodyState::received(body.clone(), true);
		}
		if let Some(status) = self.status {
			ctx.status = status;
		}
	}
}

/// A compiled-in policy. Instances are shared across concurrent requests on
/// the same route; any mutable state must be internally synchronized. Hooks
/// must not panic and should complete promptly; the pipeline enforces a
/// timeout and recovers panics, treating both as "no action".
#[async_trait::async_trait]
pub trait Policy: Send + Sync + 'static {
	fn name(&self) -> &str;
	fn version(&self) -> &str;
	fn mode(&self) -> ProcessingMode;

	async fn on_request(
		&self,
		_ctx: &mut RequestContext,
		_params: &ParamMap,
	) -> Result<Option<RequestAction>, PolicyError> {
		Ok(None)
	}

	async fn on_response(
		&self,
		_ctx: &mut ResponseContext,
		_params: &ParamMap,
	) -> Result<Option<ResponseAction>, PolicyError> {
		Ok(None)
	}
}
