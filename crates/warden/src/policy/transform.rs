//! Declarative header transformation for either phase. Values are plain
//! strings by the time the factory sees them; `${…}` references were
//! expanded at chain-build time.

use std::sync::Arc;

use anyhow::Context;
use indexmap::IndexMap;
use serde::Deserialize;

use crate::http::{RequestContext, ResponseContext};
use crate::policy::registry::PolicyDefinition;
use crate::policy::{
	ParamMap, Policy, PolicyError, ProcessingMode, RequestAction, RequestModifications,
	ResponseAction, ResponseModifications,
};

pub const NAME: &str = "header-transform";
pub const VERSION: &str = "v1";

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
struct TransformConfig {
	#[serde(default)]
	request: Option<Rules>,
	#[serde(default)]
	response: Option<Rules>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
struct Rules {
	#[serde(default)]
	set: IndexMap<String, String>,
	#[serde(default)]
	add: IndexMap<String, String>,
	#[serde(default)]
	remove: Vec<String>,
}

impl Rules {
	fn is_empty(&self) -> bool {
		self.set.is_empty() && self.add.is_empty() && self.remove.is_empty()
	}
}

pub fn definition() -> PolicyDefinition {
	PolicyDefinition {
		name: NAME.to_string(),
		version: VERSION.to_string(),
		description: "sets, appends, and removes request/response headers".to_string(),
		init_parameters: ParamMap::new(),
		supports_request_phase: true,
		supports_response_phase: true,
		requires_request_body: false,
		requires_response_body: false,
	}
}

pub fn factory(
	_def: &PolicyDefinition,
	params: &ParamMap,
) -> anyhow::Result<Arc<dyn Policy>> {
	let config: TransformConfig = serde_json::from_value(serde_json::Value::Object(params.clone()))
		.context("header-transform config")?;
	Ok(Arc::new(HeaderTransform {
		request: config.request.unwrap_or_default(),
		response: config.response.unwrap_or_default(),
	}))
}

pub struct HeaderTransform {
	request: Rules,
	response: Rules,
}

#[async_trait::async_trait]
impl Policy for HeaderTransform {
	fn name(&self) -> &str {
		NAME
	}

	fn version(&self) -> &str {
		VERSION
	}

	fn mode(&self) -> ProcessingMode {
		ProcessingMode::default()
	}

	async fn on_request(
		&self,
		_ctx: &mut RequestContext,
		_params: &ParamMap,
	) -> Result<Option<RequestAction>, PolicyError> {
		if self.request.is_empty() {
			return Ok(None);
		}
		let rules = &self.request;
		Ok(Some(RequestAction::Modify(RequestModifications {
			set_headers: rules
				.set
				.iter()
				.map(|(k, v)| (k.clone(), v.clone()))
				.collect(),
			append_headers: rules
				.add
				.iter()
				.map(|(k, v)| (k.clone(), v.clone()))
				.collect(),
			remove_headers: rules.remove.clone(),
			..Default::default()
		})))
	}

	async fn on_response(
		&self,
		_ctx: &mut ResponseContext,
		_params: &ParamMap,
	) -> Result<Option<ResponseAction>, PolicyError> {
		if self.response.is_empty() {
			return Ok(None);
		}
		let rules = &self.response;
		Ok(Some(ResponseModifications {
			set_headers: rules
				.set
				.iter()
				.map(|(k, v)| (k.clone(), v.clone()))
				.collect(),
			append_headers: rules
				.add
				.iter()
				.map(|(k, v)| (k.clone(), v.clone()))
				.collect(),
			remove_headers: rules.remove.clone(),
			..Default::default()
		}))
	}
}
