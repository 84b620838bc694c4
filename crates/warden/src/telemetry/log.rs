//! Log subscriber setup for the engine binary.

use std::str::FromStr;

use anyhow::anyhow;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum LogFormat {
	#[default]
	Text,
	Json,
}

impl FromStr for LogFormat {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"text" => Ok(LogFormat::Text),
			"json" => Ok(LogFormat::Json),
			other => Err(anyhow!("unknown log format {other:?}")),
		}
	}
}

/// Installs the global subscriber. `RUST_LOG` overrides the CLI level when
/// set.
pub fn setup(level: &str, format: LogFormat) -> anyhow::Result<()> {
	let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
	match format {
		LogFormat::Text => tracing_subscriber::registry()
			.with(filter)
			.with(fmt::layer())
			.try_init()
			.map_err(|e| anyhow!("installing subscriber: {e}"))?,
		LogFormat::Json => tracing_subscriber::registry()
			.with(filter)
			.with(fmt::layer().json().flatten_event(true))
			.try_init()
			.map_err(|e| anyhow!("installing subscriber: {e}"))?,
	}
	Ok(())
}
