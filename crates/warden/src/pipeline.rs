//! Runs a policy chain over one phase of one request: gate on the CEL
//! condition, invoke the hook under a timeout with panic recovery, apply the
//! returned mutations to the in-memory context so later policies see the
//! cumulative effect, and fold the same mutations into the wire response.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, warn};

use crate::cel::{self, Phase};
use crate::http::{RequestContext, ResponseContext};
use crate::policy::chain::{ChainEntry, PolicyChain};
use crate::policy::{BodyMode, ImmediateResponseSpec, RequestAction};
use crate::proc::merge::PhaseMutations;
use crate::telemetry::metrics::{Metrics, PolicyResult};

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;

/// Which message of the phase is being processed. Policies that buffer the
/// body run on the body continuation; everything else runs on headers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Stage {
	Headers,
	Body,
}

#[derive(Debug)]
pub enum RequestPhaseAction {
	Continue(PhaseMutations),
	ShortCircuit(ImmediateResponseSpec),
}

#[derive(Debug)]
pub struct RequestPhaseResult {
	pub action: RequestPhaseAction,
	pub executed: usize,
}

#[derive(Debug)]
pub struct ResponsePhaseResult {
	pub mutations: PhaseMutations,
	pub executed: usize,
}

#[derive(Clone)]
pub struct Pipeline {
	timeout: Duration,
	metrics: Arc<Metrics>,
}

impl Pipeline {
	pub fn new(timeout: Duration, metrics: Arc<Metrics>) -> Self {
		Self { timeout, metrics }
	}

	pub async fn run_request(
		&self,
		chain: &PolicyChain,
		ctx: &mut RequestContext,
		stage: Stage,
	) -> RequestPhaseResult {
		let mut mutations = PhaseMutations::default();
		let mut executed = 0usize;
		for entry in &chain.entries {
			if !entry.definition.supports_request_phase {
				continue;
			}
			let buffers = entry.policy.mode().request_body_mode == BodyMode::Buffered;
			if buffers != (stage == Stage::Body) {
				continue;
			}
			if !self.gate(entry, &ctx.activation(), Phase::Request) {
				continue;
			}
			executed += 1;
			let invocation =
				AssertUnwindSafe(entry.policy.on_request(ctx, &entry.params)).catch_unwind();
			match tokio::time::timeout(self.timeout, invocation).await {
				Err(_) => {
					warn!(policy = %entry.spec.name, "request-phase policy exceeded {:?}; abandoning", self.timeout);
					self
						.metrics
						.record_policy(&entry.spec.name, Phase::Request, PolicyResult::Timeout);
				},
				Ok(Err(_)) => {
					warn!(policy = %entry.spec.name, "request-phase policy panicked; treating as no action");
					self
						.metrics
						.record_policy(&entry.spec.name, Phase::Request, PolicyResult::Panic);
				},
				Ok(Ok(Err(e))) => {
					warn!(policy = %entry.spec.name, "request-phase policy failed: {e:#}");
					self
						.metrics
						.record_policy(&entry.spec.name, Phase::Request, PolicyResult::Error);
				},
				Ok(Ok(Ok(None))) => {
					self
						.metrics
						.record_policy(&entry.spec.name, Phase::Request, PolicyResult::Ok);
				},
				Ok(Ok(Ok(Some(RequestAction::Modify(m))))) => {
					m.apply_to(ctx);
					mutations.merge_request(&m);
					self
						.metrics
						.record_policy(&entry.spec.name, Phase::Request, PolicyResult::Ok);
				},
				Ok(Ok(Ok(Some(RequestAction::Immediate(resp))))) => {
					debug!(policy = %entry.spec.name, status = resp.status, "policy short-circuited the request");
					self
						.metrics
						.record_policy(&entry.spec.name, Phase::Request, PolicyResult::Ok);
					return RequestPhaseResult {
						action: RequestPhaseAction::ShortCircuit(resp),
						executed,
					};
				},
			}
		}
		RequestPhaseResult {
			action: RequestPhaseAction::Continue(mutations),
			executed,
		}
	}

	pub async fn run_response(
		&self,
		chain: &PolicyChain,
		ctx: &mut ResponseContext,
		stage: Stage,
	) -> ResponsePhaseResult {
		let mut mutations = PhaseMutations::default();
		let mut executed = 0usize;
		for entry in &chain.entries {
			if !entry.definition.supports_response_phase {
				continue;
			}
			let buffers = entry.policy.mode().response_body_mode == BodyMode::Buffered;
			if buffers != (stage == Stage::Body) {
				continue;
			}
			if !self.gate(entry, &ctx.activation(), Phase::Response) {
				continue;
			}
			executed += 1;
			let invocation =
				AssertUnwindSafe(entry.policy.on_response(ctx, &entry.params)).catch_unwind();
			match tokio::time::timeout(self.timeout, invocation).await {
				Err(_) => {
					warn!(policy = %entry.spec.name, "response-phase policy exceeded {:?}; abandoning", self.timeout);
					self
						.metrics
						.record_policy(&entry.spec.name, Phase::Response, PolicyResult::Timeout);
				},
				Ok(Err(_)) => {
					warn!(policy = %entry.spec.name, "response-phase policy panicked; treating as no action");
					self
						.metrics
						.record_policy(&entry.spec.name, Phase::Response, PolicyResult::Panic);
				},
				Ok(Ok(Err(e))) => {
					warn!(policy = %entry.spec.name, "response-phase policy failed: {e:#}");
					self
						.metrics
						.record_policy(&entry.spec.name, Phase::Response, PolicyResult::Error);
				},
				Ok(Ok(Ok(None))) => {
					self
						.metrics
						.record_policy(&entry.spec.name, Phase::Response, PolicyResult::Ok);
				},
				Ok(Ok(Ok(Some(m)))) => {
					m.apply_to(ctx);
					mutations.merge_response(&m);
					self
						.metrics
						.record_policy(&entry.spec.name, Phase::Response, PolicyResult::Ok);
				},
			}
		}
		ResponsePhaseResult {
			mutations,
			executed,
		}
	}

	/// Evaluates the entry's gating condition. Errors gate to "do not
	/// execute".
	fn gate(&self, entry: &ChainEntry, activation: &cel::Activation, phase: Phase) -> bool {
		let Some(condition) = &entry.condition else {
			return true;
		};
		match cel::evaluate_bool(condition, activation) {
			Ok(true) => true,
			Ok(false) => {
				self
					.metrics
					.record_policy(&entry.spec.name, phase, PolicyResult::Skipped);
				false
			},
			Err(e) => {
				warn!(policy = %entry.spec.name, condition = condition.source(), "condition failed, skipping policy: {e}");
				self
					.metrics
					.record_policy(&entry.spec.name, phase, PolicyResult::Skipped);
				false
			},
		}
	}
}
