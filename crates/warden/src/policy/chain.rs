//! Builds the per-route policy chain from the control plane's ordered
//! policy specs. Chains are immutable once built; replacing one requires a
//! full snapshot swap.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cel::{Expression, ProgramCache};
use crate::config::resolve::Resolver;
use crate::policy::registry::{PolicyDefinition, Registry};
use crate::policy::{BodyMode, ParamMap, Policy};

#[cfg(test)]
#[path = "chain_tests.rs"]
mod tests;

/// The route-scoped deployment of one policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicySpec {
	pub name: String,
	pub version: String,
	#[serde(default = "default_enabled")]
	pub enabled: bool,
	/// CEL boolean gating per-request execution.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub execution_condition: Option<String>,
	#[serde(default)]
	pub parameters: ParamMap,
}

fn default_enabled() -> bool {
	true
}

impl PolicySpec {
	pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			version: version.into(),
			enabled: true,
			execution_condition: None,
			parameters: ParamMap::new(),
		}
	}
}

/// Identity and API metadata for the route a chain is bound to.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteInfo {
	pub key: String,
	#[serde(default)]
	pub api_name: String,
	#[serde(default)]
	pub api_version: String,
	#[serde(default)]
	pub api_context: String,
	#[serde(default)]
	pub operation_path: String,
}

pub struct ChainEntry {
	pub policy: Arc<dyn Policy>,
	pub definition: Arc<PolicyDefinition>,
	pub params: Arc<ParamMap>,
	pub condition: Option<Arc<Expression>>,
	pub spec: PolicySpec,
}

/// Ordered, instantiated policies for one route plus the precomputed flags
/// the stream handler answers the proxy with.
pub struct PolicyChain {
	pub route: RouteInfo,
	pub entries: Vec<ChainEntry>,
	pub requires_request_body: bool,
	pub requires_response_body: bool,
	pub has_execution_conditions: bool,
}

impl PolicyChain {
	pub fn empty(route: RouteInfo) -> Self {
		Self {
			route,
			entries: Vec::new(),
			requires_request_body: false,
			requires_response_body: false,
			has_execution_conditions: false,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

pub struct ChainBuilder<'a> {
	pub registry: &'a Registry,
	pub resolver: &'a Resolver,
	pub programs: &'a ProgramCache,
}

impl ChainBuilder<'_> {
	/// Instantiates the chain. A spec that cannot be instantiated (unknown
	/// policy, bad configuration, bad condition) is dropped with a
	/// diagnostic; the rest of the chain still serves.
	pub fn build(&self, route: RouteInfo, specs: &[PolicySpec]) -> PolicyChain {
		let mut entries = Vec::with_capacity(specs.len());
		for spec in specs {
			if !spec.enabled {
				continue;
			}
			let created = match self.registry.create_instance(
				&spec.name,
				&spec.version,
				&spec.parameters,
				self.resolver,
			) {
				Ok(created) => created,
				Err(e) => {
					warn!(route = %route.key, policy = %spec.name, version = %spec.version, "dropping policy from chain: {e}");
					continue;
				},
			};
			let condition = match spec.execution_condition.as_deref() {
				None | Some("") => None,
				Some(src) => match self.programs.get(src) {
					Ok(expr) => Some(expr),
					Err(e) => {
						warn!(route = %route.key, policy = %spec.name, "dropping policy with invalid condition: {e}");
						continue;
					},
				},
			};
			entries.push(ChainEntry {
				policy: created.policy,
				definition: created.definition,
				params: created.params,
				condition,
				spec: spec.clone(),
			});
		}
		let requires_request_body = entries
			.iter()
			.any(|e| e.policy.mode().request_body_mode == BodyMode::Buffered);
		let requires_response_body = entries
			.iter()
			.any(|e| e.policy.mode().response_body_mode == BodyMode::Buffered);
		let has_execution_conditions = entries.iter().any(|e| e.condition.is_some());
		PolicyChain {
			route,
			entries,
			requires_request_body,
			requires_response_body,
			has_execution_conditions,
		}
	}
}
