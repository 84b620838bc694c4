//! The control-plane boundary. The engine consumes complete route→policy
//! snapshots from a subscription; whoever produces them (an xDS client, the
//! local file source, a test) is outside the engine proper.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cel::ProgramCache;
use crate::config::resolve::Resolver;
use crate::policy::chain::{ChainBuilder, PolicySpec, RouteInfo};
use crate::policy::registry::Registry;
use crate::store::{Snapshot, SnapshotStore};
use crate::telemetry::metrics::Metrics;

pub mod local;

/// One complete route→policy-specs snapshot, versioned monotonically.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RouteSnapshot {
	#[serde(default)]
	pub version: u64,
	#[serde(default)]
	pub routes: Vec<RouteEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RouteEntry {
	/// The route key the proxy will present in its request attributes.
	pub route: String,
	#[serde(default)]
	pub api: ApiMetadata,
	#[serde(default)]
	pub policies: Vec<PolicySpec>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ApiMetadata {
	#[serde(default)]
	pub name: String,
	#[serde(default)]
	pub version: String,
	#[serde(default)]
	pub context: String,
	#[serde(default)]
	pub operation: String,
}

/// Chain-builds incoming snapshots and installs them atomically. One
/// subscriber exists per process; it is the snapshot store's only writer.
pub struct Subscriber {
	store: Arc<SnapshotStore>,
	registry: Arc<Registry>,
	resolver: Arc<Resolver>,
	programs: Arc<ProgramCache>,
	metrics: Arc<Metrics>,
}

impl Subscriber {
	pub fn new(
		store: Arc<SnapshotStore>,
		registry: Arc<Registry>,
		resolver: Arc<Resolver>,
		programs: Arc<ProgramCache>,
		metrics: Arc<Metrics>,
	) -> Self {
		Self {
			store,
			registry,
			resolver,
			programs,
			metrics,
		}
	}

	/// Builds every route's chain and swaps the snapshot in. Returns false
	/// when the snapshot was discarded as out of order.
	pub fn apply(&self, snapshot: RouteSnapshot) -> bool {
		let builder = ChainBuilder {
			registry: &self.registry,
			resolver: &self.resolver,
			programs: &self.programs,
		};
		let mut chains = HashMap::with_capacity(snapshot.routes.len());
		for entry in &snapshot.routes {
			if chains.contains_key(&entry.route) {
				warn!(route = %entry.route, "duplicate route in snapshot, keeping the first");
				continue;
			}
			let route = RouteInfo {
				key: entry.route.clone(),
				api_name: entry.api.name.clone(),
				api_version: entry.api.version.clone(),
				api_context: entry.api.context.clone(),
				operation_path: entry.api.operation.clone(),
			};
			let chain = builder.build(route, &entry.policies);
			chains.insert(entry.route.clone(), Arc::new(chain));
		}
		let routes = chains.len();
		let installed = self.store.install(Snapshot::new(snapshot.version, chains));
		if installed {
			self.metrics.snapshot_updates.inc();
			self.metrics.routes_active.set(routes as i64);
			info!(version = snapshot.version, routes, "applied route snapshot");
		}
		installed
	}

	/// Drains the subscription until the source closes.
	pub async fn run(self, mut rx: mpsc::Receiver<RouteSnapshot>) {
		while let Some(snapshot) = rx.recv().await {
			self.apply(snapshot);
		}
		info!("snapshot subscription closed");
	}
}
