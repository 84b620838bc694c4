//! API key authentication. Looks a key up in the configured key set and
//! hands its user metadata to later policies through the metadata bag.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use serde_json::json;

use crate::http::RequestContext;
use crate::policy::registry::PolicyDefinition;
use crate::policy::{
	ImmediateResponseSpec, ParamMap, Policy, PolicyError, ProcessingMode, RequestAction,
	RequestModifications,
};

pub const NAME: &str = "api-key-auth";
pub const VERSION: &str = "v1";

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "lowercase")]
enum Mode {
	/// A valid key must be present.
	#[default]
	Strict,
	/// Validate a key if one is supplied; requests without credentials
	/// pass through unauthenticated.
	Optional,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
struct ApiKeyConfig {
	#[serde(default = "default_header")]
	header: String,
	/// Key value → free-form user metadata for that key.
	keys: HashMap<String, serde_json::Value>,
	#[serde(default)]
	mode: Mode,
	/// Remove the credential before forwarding upstream.
	#[serde(default)]
	strip_credential: bool,
}

fn default_header() -> String {
	"x-api-key".to_string()
}

pub fn definition() -> PolicyDefinition {
	PolicyDefinition {
		name: NAME.to_string(),
		version: VERSION.to_string(),
		description: "validates an API key against a configured key set".to_string(),
		init_parameters: json!({"header": "x-api-key"})
			.as_object()
			.cloned()
			.unwrap_or_default(),
		supports_request_phase: true,
		supports_response_phase: false,
		requires_request_body: false,
		requires_response_body: false,
	}
}

pub fn factory(
	_def: &PolicyDefinition,
	params: &ParamMap,
) -> anyhow::Result<Arc<dyn Policy>> {
	let config: ApiKeyConfig = serde_json::from_value(serde_json::Value::Object(params.clone()))
		.context("api-key-auth config")?;
	if config.keys.is_empty() {
		return Err(anyhow::anyhow!("api-key-auth requires at least one key"));
	}
	Ok(Arc::new(ApiKeyAuth {
		header: config.header.to_ascii_lowercase(),
		keys: config.keys,
		mode: config.mode,
		strip_credential: config.strip_credential,
	}))
}

pub struct ApiKeyAuth {
	header: String,
	keys: HashMap<String, serde_json::Value>,
	mode: Mode,
	strip_credential: bool,
}

fn unauthorized(message: &str) -> RequestAction {
	RequestAction::Immediate(ImmediateResponseSpec::json(
		401,
		json!({"error": "Unauthorized", "message": message}),
	))
}

#[async_trait::async_trait]
impl Policy for ApiKeyAuth {
	fn name(&self) -> &str {
		NAME
	}

	fn version(&self) -> &str {
		VERSION
	}

	fn mode(&self) -> ProcessingMode {
		ProcessingMode::request_headers_only()
	}

	async fn on_request(
		&self,
		ctx: &mut RequestContext,
		_params: &ParamMap,
	) -> Result<Option<RequestAction>, PolicyError> {
		let Some(presented) = ctx.headers.get(&self.header) else {
			return match self.mode {
				Mode::Strict => Ok(Some(unauthorized("missing API key"))),
				Mode::Optional => Ok(None),
			};
		};
		let Some(user) = self.keys.get(presented) else {
			return Ok(Some(unauthorized("invalid API key")));
		};
		ctx
			.metadata
			.insert("auth.success".to_string(), serde_json::Value::Bool(true));
		ctx.metadata.insert("apikey.user".to_string(), user.clone());
		if self.strip_credential {
			return Ok(Some(RequestAction::Modify(RequestModifications {
				remove_headers: vec![self.header.clone()],
				..Default::default()
			})));
		}
		Ok(None)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn policy(params: serde_json::Value) -> Arc<dyn Policy> {
		factory(&definition(), params.as_object().unwrap()).unwrap()
	}

	fn keys() -> serde_json::Value {
		json!({"keys": {"k-1": {"org": "acme"}, "k-2": {"org": "globex"}}})
	}

	#[tokio::test]
	async fn known_key_records_user_metadata() {
		let p = policy(keys());
		let mut ctx = RequestContext::default();
		ctx.headers.set("x-api-key", "k-1");
		let action = p.on_request(&mut ctx, &ParamMap::new()).await.unwrap();
		assert!(action.is_none());
		assert_eq!(ctx.metadata["auth.success"], json!(true));
		assert_eq!(ctx.metadata["apikey.user"], json!({"org": "acme"}));
	}

	#[tokio::test]
	async fn unknown_key_short_circuits_401() {
		let p = policy(keys());
		let mut ctx = RequestContext::default();
		ctx.headers.set("x-api-key", "nope");
		let action = p.on_request(&mut ctx, &ParamMap::new()).await.unwrap();
		assert!(matches!(action, Some(RequestAction::Immediate(r)) if r.status == 401));
	}

	#[tokio::test]
	async fn strict_mode_requires_a_credential() {
		let p = policy(keys());
		let mut ctx = RequestContext::default();
		let action = p.on_request(&mut ctx, &ParamMap::new()).await.unwrap();
		assert!(matches!(action, Some(RequestAction::Immediate(_))));
	}

	#[tokio::test]
	async fn optional_mode_passes_missing_credentials_through() {
		let mut params = keys();
		params["mode"] = json!("optional");
		let p = policy(params);
		let mut ctx = RequestContext::default();
		let action = p.on_request(&mut ctx, &ParamMap::new()).await.unwrap();
		assert!(action.is_none());
		assert!(!ctx.metadata.contains_key("auth.success"));
	}

	#[tokio::test]
	async fn strip_credential_removes_the_header() {
		let mut params = keys();
		params["strip_credential"] = json!(true);
		let p = policy(params);
		let mut ctx = RequestContext::default();
		ctx.headers.set("x-api-key", "k-2");
		let action = p.on_request(&mut ctx, &ParamMap::new()).await.unwrap();
		let Some(RequestAction::Modify(mods)) = action else {
			panic!("expected modifications");
		};
		assert_eq!(mods.remove_headers, vec!["x-api-key".to_string()]);
	}

	#[test]
	fn factory_rejects_an_empty_key_set() {
		assert!(factory(&definition(), json!({"keys": {}}).as_object().unwrap()).is_err());
	}
}
