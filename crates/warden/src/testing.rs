//! Shared helpers for unit tests: configurable probe policies and small
//! builders for registries and chains.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::http::{RequestContext, ResponseContext};
use crate::policy::registry::{PolicyDefinition, Registry};
use crate::policy::{
	BodyMode, ParamMap, Policy, PolicyError, ProcessingMode, RequestAction, ResponseAction,
};

type RequestHook =
	dyn Fn(&mut RequestContext, &ParamMap) -> Result<Option<RequestAction>, PolicyError>
		+ Send
		+ Sync;
type ResponseHook =
	dyn Fn(&mut ResponseContext, &ParamMap) -> Result<Option<ResponseAction>, PolicyError>
		+ Send
		+ Sync;

/// A policy whose behavior is supplied by closures, with invocation
/// counters for ordering assertions.
pub struct ProbePolicy {
	name: String,
	mode: ProcessingMode,
	request_hook: Option<Box<RequestHook>>,
	response_hook: Option<Box<ResponseHook>>,
	pub request_calls: AtomicUsize,
	pub response_calls: AtomicUsize,
	delay: Option<Duration>,
	panic_on_request: bool,
}

impl ProbePolicy {
	pub fn named(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			mode: ProcessingMode::default(),
			request_hook: None,
			response_hook: None,
			request_calls: AtomicUsize::new(0),
			response_calls: AtomicUsize::new(0),
			delay: None,
			panic_on_request: false,
		}
	}

	pub fn with_mode(mut self, mode: ProcessingMode) -> Self {
		self.mode = mode;
		self
	}

	pub fn buffering_request_body(mut self) -> Self {
		self.mode.request_body_mode = BodyMode::Buffered;
		self
	}

	pub fn buffering_response_body(mut self) -> Self {
		self.mode.response_body_mode = BodyMode::Buffered;
		self
	}

	pub fn on_request(
		mut self,
		f: impl Fn(&mut RequestContext, &ParamMap) -> Result<Option<RequestAction>, PolicyError>
		+ Send
		+ Sync
		+ 'static,
	) -> Self {
		self.request_hook = Some(Box::new(f));
		self
	}

	pub fn on_response(
		mut self,
		f: impl Fn(&mut ResponseContext, &ParamMap) -> Result<Option<ResponseAction>, PolicyError>
		+ Send
		+ Sync
		+ 'static,
	) -> Self {
		self.response_hook = Some(Box::new(f));
		self
	}

	pub fn sleeping(mut self, delay: Duration) -> Self {
		self.delay = Some(delay);
		self
	}

	pub fn panicking(mut self) -> Self {
		self.panic_on_request = true;
		self
	}

	/// A matching definition with both phases enabled and body flags taken
	/// from the processing mode.
	pub fn definition(&self) -> PolicyDefinition {
		PolicyDefinition {
			name: self.name.clone(),
			version: "v1".to_string(),
			description: "test probe".to_string(),
			init_parameters: ParamMap::new(),
			supports_request_phase: true,
			supports_response_phase: true,
			requires_request_body: self.mode.request_body_mode == BodyMode::Buffered,
			requires_response_body: self.mode.response_body_mode == BodyMode::Buffered,
		}
	}
}

#[async_trait::async_trait]
impl Policy for ProbePolicy {
	fn name(&self) -> &str {
		&self.name
	}

	fn version(&self) -> &str {
		"v1"
	}

	fn mode(&self) -> ProcessingMode {
		self.mode
	}

	async fn on_request(
		&self,
		ctx: &mut RequestContext,
		params: &ParamMap,
	) -> Result<Option<RequestAction>, PolicyError> {
		self.request_calls.fetch_add(1, Ordering::SeqCst);
		if let Some(delay) = self.delay {
			tokio::time::sleep(delay).await;
		}
		if self.panic_on_request {
			panic!("probe policy panic");
		}
		match &self.request_hook {
			Some(f) => f(ctx, params),
			None => Ok(None),
		}
	}

	async fn on_response(
		&self,
		ctx: &mut ResponseContext,
		params: &ParamMap,
	) -> Result<Option<ResponseAction>, PolicyError> {
		self.response_calls.fetch_add(1, Ordering::SeqCst);
		match &self.response_hook {
			Some(f) => f(ctx, params),
			None => Ok(None),
		}
	}
}

/// Registers an already-built instance under `<name>/v1`, sharing the one
/// instance across every chain that references it.
pub fn register_instance(registry: &Registry, policy: Arc<ProbePolicy>) {
	let definition = policy.definition();
	registry
		.register(definition, move |_: &PolicyDefinition, _: &ParamMap| {
			Ok(policy.clone() as Arc<dyn Policy>)
		})
		.expect("register probe");
}

/// Builds a chain entry around a probe without going through the registry.
pub fn chain_entry(
	policy: Arc<ProbePolicy>,
	condition: Option<&str>,
) -> crate::policy::chain::ChainEntry {
	use crate::policy::chain::{ChainEntry, PolicySpec};
	let spec = PolicySpec::new(policy.name().to_string(), "v1");
	ChainEntry {
		definition: Arc::new(policy.definition()),
		params: Arc::new(ParamMap::new()),
		condition: condition.map(|c| Arc::new(crate::cel::Expression::compile(c).unwrap())),
		spec,
		policy,
	}
}

/// Assembles a chain with the flags the builder would have computed.
pub fn chain_of(
	route_key: &str,
	entries: Vec<crate::policy::chain::ChainEntry>,
) -> crate::policy::chain::PolicyChain {
	use crate::policy::chain::{PolicyChain, RouteInfo};
	let requires_request_body = entries
		.iter()
		.any(|e| e.policy.mode().request_body_mode == BodyMode::Buffered);
	let requires_response_body = entries
		.iter()
		.any(|e| e.policy.mode().response_body_mode == BodyMode::Buffered);
	let has_execution_conditions = entries.iter().any(|e| e.condition.is_some());
	PolicyChain {
		route: RouteInfo {
			key: route_key.to_string(),
			api_name: "petstore".to_string(),
			api_version: "v1".to_string(),
			api_context: "/petstore/v1".to_string(),
			operation_path: String::new(),
		},
		entries,
		requires_request_body,
		requires_response_body,
		has_execution_conditions,
	}
}

