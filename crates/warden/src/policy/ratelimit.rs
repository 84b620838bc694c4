//! Local fixed-window rate limiting. State is owned by the instance and
//! shared across every request on the route, per the policy contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;

use crate::config::parse_duration;
use crate::http::RequestContext;
use crate::policy::registry::PolicyDefinition;
use crate::policy::{
	ImmediateResponseSpec, ParamMap, Policy, PolicyError, ProcessingMode, RequestAction,
};

pub const NAME: &str = "rate-limit";
pub const VERSION: &str = "v1";

#[derive(Deserialize, Debug)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
struct RateLimitConfig {
	limit: u64,
	#[serde(default = "default_window")]
	window: String,
	/// Buckets are keyed by this request header; absent means one global
	/// bucket for the route.
	key_header: Option<String>,
}

fn default_window() -> String {
	"1m".to_string()
}

pub fn definition() -> PolicyDefinition {
	PolicyDefinition {
		name: NAME.to_string(),
		version: VERSION.to_string(),
		description: "fixed-window request rate limiting".to_string(),
		init_parameters: json!({"window": "1m"})
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
	let config: RateLimitConfig = serde_json::from_value(serde_json::Value::Object(params.clone()))
		.context("rate-limit config")?;
	if config.limit == 0 {
		return Err(anyhow::anyhow!("rate-limit limit must be positive"));
	}
	let window = parse_duration(&config.window).context("rate-limit window")?;
	Ok(Arc::new(RateLimit {
		limit: config.limit,
		window,
		key_header: config.key_header.map(|h| h.to_ascii_lowercase()),
		buckets: Mutex::new(HashMap::new()),
	}))
}

struct Bucket {
	window_start: Instant,
	count: u64,
}

pub struct RateLimit {
	limit: u64,
	window: Duration,
	key_header: Option<String>,
	buckets: Mutex<HashMap<String, Bucket>>,
}

#[async_trait::async_trait]
impl Policy for RateLimit {
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
		let key = self
			.key_header
			.as_deref()
			.and_then(|h| ctx.headers.get(h))
			.unwrap_or("global")
			.to_string();
		let now = Instant::now();
		let mut buckets = self.buckets.lock();
		let bucket = buckets.entry(key).or_insert(Bucket {
			window_start: now,
			count: 0,
		});
		if now.duration_since(bucket.window_start) >= self.window {
			bucket.window_start = now;
			bucket.count = 0;
		}
		bucket.count += 1;
		if bucket.count > self.limit {
			let retry_after = self
				.window
				.saturating_sub(now.duration_since(bucket.window_start))
				.as_secs()
				.max(1);
			let mut resp = ImmediateResponseSpec::json(
				429,
				json!({"error": "Too Many Requests", "message": "rate limit exceeded"}),
			);
			resp
				.headers
				.push(("retry-after".to_string(), retry_after.to_string()));
			return Ok(Some(RequestAction::Immediate(resp)));
		}
		let remaining = self.limit - bucket.count;
		drop(buckets);
		ctx
			.metadata
			.insert("ratelimit.remaining".to_string(), json!(remaining));
		Ok(None)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn policy(params: serde_json::Value) -> Arc<dyn Policy> {
		factory(&definition(), params.as_object().unwrap()).unwrap()
	}

	#[tokio::test]
	async fn requests_over_the_limit_get_429() {
		let p = policy(json!({"limit": 2, "window": "1m"}));
		let mut ctx = RequestContext::default();
		assert!(p.on_request(&mut ctx, &ParamMap::new()).await.unwrap().is_none());
		assert_eq!(ctx.metadata["ratelimit.remaining"], json!(1));
		assert!(p.on_request(&mut ctx, &ParamMap::new()).await.unwrap().is_none());
		let action = p.on_request(&mut ctx, &ParamMap::new()).await.unwrap();
		let Some(RequestAction::Immediate(resp)) = action else {
			panic!("expected a 429");
		};
		assert_eq!(resp.status, 429);
		assert!(resp.headers.iter().any(|(k, _)| k == "retry-after"));
	}

	#[tokio::test]
	async fn buckets_are_keyed_by_header() {
		let p = policy(json!({"limit": 1, "window": "1m", "key_header": "x-api-key"}));
		let mut alice = RequestContext::default();
		alice.headers.set("x-api-key", "alice");
		let mut bob = RequestContext::default();
		bob.headers.set("x-api-key", "bob");
		assert!(p.on_request(&mut alice, &ParamMap::new()).await.unwrap().is_none());
		assert!(p.on_request(&mut bob, &ParamMap::new()).await.unwrap().is_none());
		assert!(matches!(
			p.on_request(&mut alice, &ParamMap::new()).await.unwrap(),
			Some(RequestAction::Immediate(_))
		));
	}

	#[tokio::test]
	async fn window_expiry_resets_the_bucket() {
		let p = policy(json!({"limit": 1, "window": "30ms"}));
		let mut ctx = RequestContext::default();
		assert!(p.on_request(&mut ctx, &ParamMap::new()).await.unwrap().is_none());
		assert!(matches!(
			p.on_request(&mut ctx, &ParamMap::new()).await.unwrap(),
			Some(RequestAction::Immediate(_))
		));
		std::thread::sleep(Duration::from_millis(40));
		assert!(p.on_request(&mut ctx, &ParamMap::new()).await.unwrap().is_none());
	}

	#[test]
	fn factory_rejects_zero_limit_and_bad_window() {
		assert!(factory(&definition(), json!({"limit": 0}).as_object().unwrap()).is_err());
		assert!(
			factory(
				&definition(),
				json!({"limit": 1, "window": "never"}).as_object().unwrap()
			)
			.is_err()
		);
	}
}
