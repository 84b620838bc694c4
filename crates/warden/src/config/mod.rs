//! Startup configuration: a YAML tree loaded once, read-only afterwards.
//! `policy_configurations` is the subtree exposed to `${config.…}`
//! references in policy init parameters.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::Deserialize;

use crate::telemetry::trc;

pub mod resolve;

/// What a user can put in the config file. `Config` is the validated form.
#[derive(Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
	tracing: Option<RawTracing>,
	metrics: Option<RawMetrics>,
	/// Per-policy, per-phase invocation budget, e.g. "1s" or "250ms".
	policy_timeout: Option<String>,
	/// Route snapshot file served by the local control-plane source.
	routes_file: Option<PathBuf>,
	policy_configurations: Option<serde_json::Value>,
}

#[derive(Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields)]
struct RawTracing {
	enabled: Option<bool>,
	endpoint: Option<String>,
	sampling_rate: Option<f64>,
	service_name: Option<String>,
	service_version: Option<String>,
	batch_timeout: Option<String>,
	max_export_batch_size: Option<usize>,
	insecure: Option<bool>,
}

#[derive(Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields)]
struct RawMetrics {
	enabled: Option<bool>,
}

#[derive(Clone, Debug)]
pub struct Config {
	pub tracing: trc::Config,
	pub metrics_enabled: bool,
	pub policy_timeout: Duration,
	pub routes_file: Option<PathBuf>,
	pub policy_configurations: Arc<serde_json::Value>,
}

impl Default for Config {
	fn default() -> Self {
		Self::from_raw(RawConfig::default()).expect("defaults are valid")
	}
}

impl Config {
	pub fn load(path: &Path) -> anyhow::Result<Config> {
		let contents = fs_err::read_to_string(path)?;
		let raw: RawConfig =
			serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
		Self::from_raw(raw)
	}

	pub fn from_raw(raw: RawConfig) -> anyhow::Result<Config> {
		let t = raw.tracing.unwrap_or_default();
		let tracing = trc::Config {
			enabled: t.enabled.unwrap_or(false),
			endpoint: t
				.endpoint
				.unwrap_or_else(|| "http://127.0.0.1:4317".to_string()),
			sampling_rate: t.sampling_rate.unwrap_or(1.0),
			service_name: t.service_name.unwrap_or_else(|| "warden".to_string()),
			service_version: t
				.service_version
				.unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
			batch_timeout: t
				.batch_timeout
				.as_deref()
				.map(parse_duration)
				.transpose()
				.context("tracing.batch_timeout")?
				.unwrap_or(Duration::from_secs(5)),
			max_export_batch_size: t.max_export_batch_size.unwrap_or(512),
			insecure: t.insecure.unwrap_or(true),
		};
		if !(0.0..=1.0).contains(&tracing.sampling_rate) {
			return Err(anyhow!(
				"tracing.sampling_rate must be within [0, 1], got {}",
				tracing.sampling_rate
			));
		}
		Ok(Config {
			tracing,
			metrics_enabled: raw.metrics.and_then(|m| m.enabled).unwrap_or(true),
			policy_timeout: raw
				.policy_timeout
				.as_deref()
				.map(parse_duration)
				.transpose()
				.context("policy_timeout")?
				.unwrap_or(Duration::from_secs(1)),
			routes_file: raw.routes_file,
			policy_configurations: Arc::new(
				raw
					.policy_configurations
					.unwrap_or(serde_json::Value::Object(Default::default())),
			),
		})
	}
}

/// Go-style duration strings ("1s", "250ms", "2m30s").
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
	let nanos = go_parse_duration::parse_duration(s)
		.map_err(|e| anyhow!("invalid duration {s:?}: {e:?}"))?;
	if nanos < 0 {
		return Err(anyhow!("duration {s:?} must not be negative"));
	}
	Ok(Duration::from_nanos(nanos as u64))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_apply_when_sections_missing() {
		let cfg: Config = Config::from_raw(serde_yaml::from_str("{}").unwrap()).unwrap();
		assert!(!cfg.tracing.enabled);
		assert!(cfg.metrics_enabled);
		assert_eq!(cfg.policy_timeout, Duration::from_secs(1));
	}

	#[test]
	fn full_config_parses() {
		let raw = serde_yaml::from_str(
			r#"
tracing:
  enabled: true
  endpoint: http://collector:4317
  sampling_rate: 0.25
  service_name: edge
  batch_timeout: 2s
  max_export_batch_size: 128
  insecure: false
metrics:
  enabled: false
policy_timeout: 250ms
policy_configurations:
  auth:
    secret: s3cret
"#,
		)
		.unwrap();
		let cfg = Config::from_raw(raw).unwrap();
		assert!(cfg.tracing.enabled);
		assert_eq!(cfg.tracing.endpoint, "http://collector:4317");
		assert_eq!(cfg.tracing.batch_timeout, Duration::from_secs(2));
		assert_eq!(cfg.tracing.max_export_batch_size, 128);
		assert!(!cfg.metrics_enabled);
		assert_eq!(cfg.policy_timeout, Duration::from_millis(250));
		assert_eq!(
			cfg.policy_configurations["auth"]["secret"],
			serde_json::json!("s3cret")
		);
	}

	#[test]
	fn unknown_fields_are_rejected() {
		let raw: Result<RawConfig, _> = serde_yaml::from_str("bogus: true");
		assert!(raw.is_err());
	}

	#[test]
	fn bad_sampling_rate_is_rejected() {
		let raw = serde_yaml::from_str("tracing: {sampling_rate: 3.0}").unwrap();
		assert!(Config::from_raw(raw).is_err());
	}
}
