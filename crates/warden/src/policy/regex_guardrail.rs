//! Content guardrail: asserts a regex against the buffered request or
//! response body. A violated assertion blocks the request with status 446
//! (request phase) or rewrites the response with the same intervention
//! payload (response phase).

use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;

use crate::http::{RequestContext, ResponseContext};
use crate::policy::registry::PolicyDefinition;
use crate::policy::{
	BodyMode, HeaderMode, ImmediateResponseSpec, ParamMap, Policy, PolicyError, ProcessingMode,
	RequestAction, ResponseAction, ResponseModifications,
};

pub const NAME: &str = "regex-guardrail";
pub const VERSION: &str = "v1";

/// The status guardrail interventions surface as.
pub const GUARDRAIL_STATUS: u16 = 446;

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "lowercase")]
enum Direction {
	#[default]
	Request,
	Response,
	Both,
}

impl Direction {
	fn checks_request(&self) -> bool {
		matches!(self, Direction::Request | Direction::Both)
	}

	fn checks_response(&self) -> bool {
		matches!(self, Direction::Response | Direction::Both)
	}
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
struct GuardrailConfig {
	regex: String,
	/// When false (the default) the body must match the regex to pass;
	/// when true a match is the violation.
	#[serde(default)]
	invert: bool,
	#[serde(default)]
	direction: Direction,
}

pub fn definition() -> PolicyDefinition {
	PolicyDefinition {
		name: NAME.to_string(),
		version: VERSION.to_string(),
		description: "asserts a regex over the message body".to_string(),
		init_parameters: json!({"direction": "request"})
			.as_object()
			.cloned()
			.unwrap_or_default(),
		supports_request_phase: true,
		supports_response_phase: true,
		requires_request_body: true,
		requires_response_body: false,
	}
}

pub fn factory(
	_def: &PolicyDefinition,
	params: &ParamMap,
) -> anyhow::Result<Arc<dyn Policy>> {
	let config: GuardrailConfig = serde_json::from_value(serde_json::Value::Object(params.clone()))
		.context("regex-guardrail config")?;
	let regex = Regex::new(&config.regex).context("regex-guardrail pattern")?;
	Ok(Arc::new(RegexGuardrail {
		regex,
		invert: config.invert,
		direction: config.direction,
	}))
}

pub struct RegexGuardrail {
	regex: Regex,
	invert: bool,
	direction: Direction,
}

impl RegexGuardrail {
	/// An absent body is checked as the empty string.
	fn violates(&self, body: &[u8]) -> bool {
		let text = String::from_utf8_lossy(body);
		let matched = self.regex.is_match(&text);
		if self.invert { matched } else { !matched }
	}

	fn intervention(&self, direction: &str) -> serde_json::Value {
		json!({
			"type": "REGEX_GUARDRAIL",
			"action": "GUARDRAIL_INTERVENED",
			"direction": direction,
			"message": "violation of regex guardrail detected",
		})
	}
}

#[async_trait::async_trait]
impl Policy for RegexGuardrail {
	fn name(&self) -> &str {
		NAME
	}

	fn version(&self) -> &str {
		VERSION
	}

	fn mode(&self) -> ProcessingMode {
		ProcessingMode {
			request_header_mode: HeaderMode::Process,
			request_body_mode: if self.direction.checks_request() {
				BodyMode::Buffered
			} else {
				BodyMode::Skip
			},
			response_header_mode: HeaderMode::Process,
			response_body_mode: if self.direction.checks_response() {
				BodyMode::Buffered
			} else {
				BodyMode::Skip
			},
		}
	}

	async fn on_request(
		&self,
		ctx: &mut RequestContext,
		_params: &ParamMap,
	) -> Result<Option<RequestAction>, PolicyError> {
		if !self.direction.checks_request() {
			return Ok(None);
		}
		if self.violates(&ctx.body.content) {
			return Ok(Some(RequestAction::Immediate(ImmediateResponseSpec::json(
				GUARDRAIL_STATUS,
				self.intervention("REQUEST"),
			))));
		}
		Ok(None)
	}

	async fn on_response(
		&self,
		ctx: &mut ResponseContext,
		_params: &ParamMap,
	) -> Result<Option<ResponseAction>, PolicyError> {
		if !self.direction.checks_response() {
			return Ok(None);
		}
		if self.violates(&ctx.body.content) {
			let body = self.intervention("RESPONSE").to_string();
			return Ok(Some(ResponseModifications {
				set_headers: vec![("content-type".to_string(), "application/json".to_string())],
				body: Some(Bytes::from(body)),
				status: Some(GUARDRAIL_STATUS),
				..Default::default()
			}));
		}
		Ok(None)
	}
}

#[cfg(test)]
mod tests {
	use crate::http::BodyState;

	use super::*;

	fn policy(params: serde_json::Value) -> Arc<dyn Policy> {
		factory(&definition(), params.as_object().unwrap()).unwrap()
	}

	fn request_with_body(body: &str) -> RequestContext {
		RequestContext {
			body: BodyState::received(Bytes::copy_from_slice(body.as_bytes()), true),
			..Default::default()
		}
	}

	#[tokio::test]
	async fn inverted_guardrail_blocks_matching_body() {
		let p = policy(json!({"regex": "credit[- ]?card", "invert": true}));
		let mut ctx = request_with_body(r#"{"text":"my credit card is 4111"}"#);
		let action = p.on_request(&mut ctx, &ParamMap::new()).await.unwrap();
		let Some(RequestAction::Immediate(resp)) = action else {
			panic!("expected an intervention");
		};
		assert_eq!(resp.status, GUARDRAIL_STATUS);
		let body: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
		assert_eq!(body["type"], json!("REGEX_GUARDRAIL"));
		assert_eq!(body["direction"], json!("REQUEST"));
	}

	#[tokio::test]
	async fn inverted_guardrail_passes_clean_body() {
		let p = policy(json!({"regex": "credit[- ]?card", "invert": true}));
		let mut ctx = request_with_body(r#"{"text":"nothing sensitive"}"#);
		let action = p.on_request(&mut ctx, &ParamMap::new()).await.unwrap();
		assert_eq!(action, None);
	}

	#[tokio::test]
	async fn plain_guardrail_requires_a_match() {
		let p = policy(json!({"regex": "^ok$"}));
		let mut ctx = request_with_body("ok");
		assert_eq!(p.on_request(&mut ctx, &ParamMap::new()).await.unwrap(), None);
		let mut ctx = request_with_body("nope");
		assert!(matches!(
			p.on_request(&mut ctx, &ParamMap::new()).await.unwrap(),
			Some(RequestAction::Immediate(_))
		));
	}

	#[tokio::test]
	async fn absent_body_is_checked_as_empty() {
		let p = policy(json!({"regex": ".+"}));
		let mut ctx = RequestContext::default();
		assert!(matches!(
			p.on_request(&mut ctx, &ParamMap::new()).await.unwrap(),
			Some(RequestAction::Immediate(_))
		));
	}

	#[tokio::test]
	async fn response_direction_rewrites_the_response() {
		let p = policy(json!({"regex": "leak", "invert": true, "direction": "response"}));
		assert_eq!(p.mode().response_body_mode, BodyMode::Buffered);
		assert_eq!(p.mode().request_body_mode, BodyMode::Skip);
		let mut ctx = ResponseContext {
			body: BodyState::received(Bytes::from_static(b"a leak happened"), true),
			status: 200,
			..Default::default()
		};
		let action = p.on_response(&mut ctx, &ParamMap::new()).await.unwrap();
		let Some(mods) = action else {
			panic!("expected modifications");
		};
		assert_eq!(mods.status, Some(GUARDRAIL_STATUS));
		assert!(mods.body.is_some());
		// Request direction leaves responses alone.
		let req_only = policy(json!({"regex": "leak", "invert": true}));
		let mut ctx = ResponseContext {
			body: BodyState::received(Bytes::from_static(b"a leak happened"), true),
			..Default::default()
		};
		assert_eq!(
			req_only.on_response(&mut ctx, &ParamMap::new()).await.unwrap(),
			None
		);
	}
}
