//! Engine metrics. The registry is owned by the application; the scrape
//! surface is deliberately out of scope here.

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::cel::Phase;

#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, EncodeLabelValue)]
pub enum PolicyResult {
	Ok,
	Skipped,
	Error,
	Panic,
	Timeout,
}

#[derive(Clone, Hash, PartialEq, Eq, Debug, EncodeLabelSet)]
pub struct PolicyLabels {
	pub policy: String,
	pub phase: &'static str,
	pub result: PolicyResult,
}

#[derive(Default)]
pub struct Metrics {
	pub streams: Counter,
	pub policy_executions: Family<PolicyLabels, Counter>,
	pub immediate_responses: Counter,
	pub snapshot_updates: Counter,
	pub routes_active: Gauge,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let m = Metrics::default();
		registry.register(
			"warden_streams",
			"ext_proc streams accepted",
			m.streams.clone(),
		);
		registry.register(
			"warden_policy_executions",
			"policy invocations by policy, phase, and result",
			m.policy_executions.clone(),
		);
		registry.register(
			"warden_immediate_responses",
			"requests short-circuited by a policy",
			m.immediate_responses.clone(),
		);
		registry.register(
			"warden_snapshot_updates",
			"route snapshots installed",
			m.snapshot_updates.clone(),
		);
		registry.register(
			"warden_routes_active",
			"routes in the current snapshot",
			m.routes_active.clone(),
		);
		m
	}

	/// A registry-less instance for tests and embedded use.
	pub fn unregistered() -> Self {
		Metrics::default()
	}

	pub fn record_policy(&self, policy: &str, phase: Phase, result: PolicyResult) {
		self
			.policy_executions
			.get_or_create(&PolicyLabels {
				policy: policy.to_string(),
				phase: phase.as_str(),
				result,
			})
			.inc();
	}
}
