//! Bearer-token authentication. Validates a JWT from the configured header,
//! forwards selected claims upstream as headers, and short-circuits 401
//! when the credential is missing or invalid.

use std::sync::Arc;

use anyhow::{Context, anyhow};
use indexmap::IndexMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::http::RequestContext;
use crate::policy::registry::PolicyDefinition;
use crate::policy::{
	ImmediateResponseSpec, ParamMap, Policy, PolicyError, ProcessingMode, RequestAction,
	RequestModifications,
};

pub const NAME: &str = "jwt-auth";
pub const VERSION: &str = "v1";

#[derive(Deserialize, Debug)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
struct JwtConfig {
	#[serde(default = "default_header")]
	header: String,
	/// HMAC shared secret. Exactly one of `secret` / `public_key_pem`.
	secret: Option<String>,
	/// RSA public key, PEM encoded.
	public_key_pem: Option<String>,
	#[serde(default = "default_algorithms")]
	algorithms: Vec<String>,
	issuer: Option<String>,
	audience: Option<String>,
	/// Upstream header name → claim name.
	#[serde(default = "default_forward_claims")]
	forward_claims: IndexMap<String, String>,
	#[serde(default)]
	strip_credential: bool,
}

fn default_header() -> String {
	"authorization".to_string()
}

fn default_algorithms() -> Vec<String> {
	vec!["HS256".to_string()]
}

fn default_forward_claims() -> IndexMap<String, String> {
	IndexMap::from_iter([("x-user-id".to_string(), "sub".to_string())])
}

pub fn definition() -> PolicyDefinition {
	PolicyDefinition {
		name: NAME.to_string(),
		version: VERSION.to_string(),
		description: "validates a bearer JWT and forwards claims upstream".to_string(),
		init_parameters: json!({"header": "authorization"})
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
	let config: JwtConfig =
		serde_json::from_value(serde_json::Value::Object(params.clone())).context("jwt-auth config")?;
	let key = match (&config.secret, &config.public_key_pem) {
		(Some(secret), None) => DecodingKey::from_secret(secret.as_bytes()),
		(None, Some(pem)) => {
			DecodingKey::from_rsa_pem(pem.as_bytes()).context("jwt-auth public key")?
		},
		_ => return Err(anyhow!("jwt-auth requires exactly one of secret / public_key_pem")),
	};
	if config.algorithms.is_empty() {
		return Err(anyhow!("jwt-auth requires at least one algorithm"));
	}
	let algorithms = config
		.algorithms
		.iter()
		.map(|a| {
			a.parse::<Algorithm>()
				.map_err(|_| anyhow!("unknown JWT algorithm {a:?}"))
		})
		.collect::<Result<Vec<_>, _>>()?;
	let mut validation = Validation::new(algorithms[0]);
	validation.algorithms = algorithms;
	if let Some(issuer) = &config.issuer {
		validation.set_issuer(&[issuer]);
	}
	match &config.audience {
		Some(audience) => validation.set_audience(&[audience]),
		None => validation.validate_aud = false,
	}
	Ok(Arc::new(JwtAuth {
		header: config.header.to_ascii_lowercase(),
		key,
		validation,
		forward_claims: config.forward_claims,
		strip_credential: config.strip_credential,
	}))
}

pub struct JwtAuth {
	header: String,
	key: DecodingKey,
	validation: Validation,
	forward_claims: IndexMap<String, String>,
	strip_credential: bool,
}

impl JwtAuth {
	fn unauthorized(&self, message: &str) -> RequestAction {
		RequestAction::Immediate(ImmediateResponseSpec::json(
			401,
			json!({"error": "Unauthorized", "message": message}),
		))
	}
}

#[async_trait::async_trait]
impl Policy for JwtAuth {
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
		let Some(raw) = ctx.headers.get(&self.header) else {
			return Ok(Some(self.unauthorized("missing credential")));
		};
		let token = raw
			.strip_prefix("Bearer ")
			.or_else(|| raw.strip_prefix("bearer "))
			.unwrap_or(raw)
			.trim();
		let data = match decode::<serde_json::Value>(token, &self.key, &self.validation) {
			Ok(data) => data,
			Err(e) => {
				debug!(request_id = %ctx.request_id, "JWT validation failed: {e}");
				return Ok(Some(self.unauthorized("invalid credential")));
			},
		};
		let claims = data.claims;
		let mut mods = RequestModifications::default();
		for (header, claim) in &self.forward_claims {
			let Some(value) = claims.get(claim) else {
				continue;
			};
			let rendered = match value {
				serde_json::Value::String(s) => s.clone(),
				other => other.to_string(),
			};
			mods.set_headers.push((header.clone(), rendered));
		}
		if self.strip_credential {
			mods.remove_headers.push(self.header.clone());
		}
		ctx
			.metadata
			.insert("auth.success".to_string(), serde_json::Value::Bool(true));
		if let Some(sub) = claims.get("sub") {
			ctx.metadata.insert("auth.subject".to_string(), sub.clone());
		}
		Ok(Some(RequestAction::Modify(mods)))
	}
}

#[cfg(test)]
mod tests {
	use jsonwebtoken::{EncodingKey, Header, encode};
	use serde_json::json;

	use super::*;

	const SECRET: &str = "top-secret";
	// Far-future expiry keeps the default exp validation satisfied.
	const EXP: u64 = 4102444800;

	fn policy(params: serde_json::Value) -> Arc<dyn Policy> {
		factory(&definition(), params.as_object().unwrap()).unwrap()
	}

	fn token(claims: serde_json::Value) -> String {
		encode(
			&Header::default(),
			&claims,
			&EncodingKey::from_secret(SECRET.as_bytes()),
		)
		.unwrap()
	}

	fn ctx_with_auth(value: &str) -> RequestContext {
		let mut ctx = RequestContext::default();
		ctx.headers.set("authorization", value);
		ctx
	}

	#[tokio::test]
	async fn valid_token_forwards_subject_header() {
		let p = policy(json!({"secret": SECRET}));
		let mut ctx = ctx_with_auth(&format!(
			"Bearer {}",
			token(json!({"sub": "alice", "exp": EXP}))
		));
		let action = p.on_request(&mut ctx, &ParamMap::new()).await.unwrap();
		match action {
			Some(RequestAction::Modify(mods)) => {
				assert!(mods
					.set_headers
					.contains(&("x-user-id".to_string(), "alice".to_string())));
			},
			other => panic!("expected modifications, got {other:?}"),
		}
		assert_eq!(ctx.metadata["auth.success"], json!(true));
		assert_eq!(ctx.metadata["auth.subject"], json!("alice"));
	}

	#[tokio::test]
	async fn missing_credential_short_circuits_401() {
		let p = policy(json!({"secret": SECRET}));
		let mut ctx = RequestContext::default();
		let action = p.on_request(&mut ctx, &ParamMap::new()).await.unwrap();
		match action {
			Some(RequestAction::Immediate(resp)) => {
				assert_eq!(resp.status, 401);
				assert!(resp.body.contains("Unauthorized"));
				assert!(resp
					.headers
					.contains(&("content-type".to_string(), "application/json".to_string())));
			},
			other => panic!("expected immediate response, got {other:?}"),
		}
		assert!(!ctx.metadata.contains_key("auth.success"));
	}

	#[tokio::test]
	async fn wrong_signature_short_circuits_401() {
		let p = policy(json!({"secret": "different-secret"}));
		let mut ctx = ctx_with_auth(&format!("Bearer {}", token(json!({"sub": "a", "exp": EXP}))));
		let action = p.on_request(&mut ctx, &ParamMap::new()).await.unwrap();
		assert!(matches!(action, Some(RequestAction::Immediate(r)) if r.status == 401));
	}

	#[tokio::test]
	async fn issuer_mismatch_is_rejected() {
		let p = policy(json!({"secret": SECRET, "issuer": "https://idp"}));
		let mut ctx = ctx_with_auth(&format!(
			"Bearer {}",
			token(json!({"sub": "a", "iss": "https://other", "exp": EXP}))
		));
		let action = p.on_request(&mut ctx, &ParamMap::new()).await.unwrap();
		assert!(matches!(action, Some(RequestAction::Immediate(r)) if r.status == 401));
	}

	#[tokio::test]
	async fn forward_claims_and_strip_credential() {
		let p = policy(json!({
			"secret": SECRET,
			"forward_claims": {"x-user-id": "sub", "x-org": "org"},
			"strip_credential": true,
		}));
		let mut ctx = ctx_with_auth(&format!(
			"Bearer {}",
			token(json!({"sub": "alice", "org": "acme", "exp": EXP}))
		));
		let action = p.on_request(&mut ctx, &ParamMap::new()).await.unwrap();
		let Some(RequestAction::Modify(mods)) = action else {
			panic!("expected modifications");
		};
		assert!(mods
			.set_headers
			.contains(&("x-org".to_string(), "acme".to_string())));
		assert_eq!(mods.remove_headers, vec!["authorization".to_string()]);
	}

	#[test]
	fn factory_rejects_ambiguous_keys() {
		assert!(factory(&definition(), json!({}).as_object().unwrap()).is_err());
		assert!(
			factory(
				&definition(),
				json!({"secret": "a", "public_key_pem": "b"}).as_object().unwrap()
			)
			.is_err()
		);
	}
}
