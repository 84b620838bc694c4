use std::sync::Arc;

use serde_json::json;

use super::*;
use crate::cel::ProgramCache;
use crate::config::resolve::Resolver;
use crate::policy::registry::Registry;
use crate::testing::{ProbePolicy, register_instance};

struct Fixture {
	registry: Registry,
	resolver: Resolver,
	programs: ProgramCache,
}

impl Fixture {
	fn new() -> Self {
		Self {
			registry: Registry::new(),
			resolver: Resolver::new(Arc::new(json!({}))),
			programs: ProgramCache::new(),
		}
	}

	fn build(&self, specs: &[PolicySpec]) -> PolicyChain {
		ChainBuilder {
			registry: &self.registry,
			resolver: &self.resolver,
			programs: &self.programs,
		}
		.build(
			RouteInfo {
				key: "r1".into(),
				..Default::default()
			},
			specs,
		)
	}
}

#[test]
fn disabled_policies_are_skipped() {
	let f = Fixture::new();
	register_instance(&f.registry, Arc::new(ProbePolicy::named("a")));
	let mut disabled = PolicySpec::new("a", "v1");
	disabled.enabled = false;
	let chain = f.build(&[disabled, PolicySpec::new("a", "v1")]);
	assert_eq!(chain.entries.len(), 1);
}

#[test]
fn unknown_policies_are_dropped_and_rest_survive() {
	let f = Fixture::new();
	register_instance(&f.registry, Arc::new(ProbePolicy::named("known")));
	let chain = f.build(&[PolicySpec::new("ghost", "v1"), PolicySpec::new("known", "v1")]);
	assert_eq!(chain.entries.len(), 1);
	assert_eq!(chain.entries[0].spec.name, "known");
}

#[test]
fn factory_failure_drops_only_that_policy() {
	let f = Fixture::new();
	f.registry
		.register(
			ProbePolicy::named("broken").definition(),
			|_: &crate::policy::registry::PolicyDefinition, _: &ParamMap| {
				Err(anyhow::anyhow!("boom"))
			},
		)
		.unwrap();
	register_instance(&f.registry, Arc::new(ProbePolicy::named("ok")));
	let chain = f.build(&[PolicySpec::new("broken", "v1"), PolicySpec::new("ok", "v1")]);
	assert_eq!(chain.entries.len(), 1);
}

#[test]
fn body_flags_are_or_of_member_modes() {
	let f = Fixture::new();
	register_instance(&f.registry, Arc::new(ProbePolicy::named("plain")));
	register_instance(
		&f.registry,
		Arc::new(ProbePolicy::named("reqbody").buffering_request_body()),
	);
	register_instance(
		&f.registry,
		Arc::new(ProbePolicy::named("respbody").buffering_response_body()),
	);

	let chain = f.build(&[PolicySpec::new("plain", "v1")]);
	assert!(!chain.requires_request_body);
	assert!(!chain.requires_response_body);

	let chain = f.build(&[PolicySpec::new("plain", "v1"), PolicySpec::new("reqbody", "v1")]);
	assert!(chain.requires_request_body);
	assert!(!chain.requires_response_body);

	let chain = f.build(&[PolicySpec::new("respbody", "v1")]);
	assert!(!chain.requires_request_body);
	assert!(chain.requires_response_body);
}

#[test]
fn conditions_are_compiled_once_and_flagged() {
	let f = Fixture::new();
	register_instance(&f.registry, Arc::new(ProbePolicy::named("a")));
	let mut spec = PolicySpec::new("a", "v1");
	spec.execution_condition = Some("request.Method == \"GET\"".to_string());
	let chain = f.build(std::slice::from_ref(&spec));
	assert!(chain.has_execution_conditions);
	assert!(chain.entries[0].condition.is_some());

	// The same source text resolves to the same cached program.
	let again = f.build(&[spec]);
	assert!(Arc::ptr_eq(
		chain.entries[0].condition.as_ref().unwrap(),
		again.entries[0].condition.as_ref().unwrap()
	));
	assert_eq!(f.programs.len(), 1);
}

#[test]
fn invalid_condition_drops_the_policy() {
	let f = Fixture::new();
	register_instance(&f.registry, Arc::new(ProbePolicy::named("a")));
	let mut bad = PolicySpec::new("a", "v1");
	bad.execution_condition = Some("request.Method ==".to_string());
	let chain = f.build(&[bad, PolicySpec::new("a", "v1")]);
	assert_eq!(chain.entries.len(), 1);
	assert!(!chain.has_execution_conditions);
}

#[test]
fn empty_condition_string_is_no_condition() {
	let f = Fixture::new();
	register_instance(&f.registry, Arc::new(ProbePolicy::named("a")));
	let mut spec = PolicySpec::new("a", "v1");
	spec.execution_condition = Some(String::new());
	let chain = f.build(&[spec]);
	assert!(!chain.has_execution_conditions);
	assert!(chain.entries[0].condition.is_none());
}
