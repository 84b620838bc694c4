//! The route → chain snapshot store. One atomic pointer holds the current
//! snapshot; requests pin it once at stream start and keep it for their
//! lifetime, so a swap never mutates what an in-flight request observes.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, info};

use crate::policy::chain::PolicyChain;

/// An immutable route-key → chain mapping produced from one control-plane
/// update.
pub struct Snapshot {
	version: u64,
	chains: HashMap<String, Arc<PolicyChain>>,
}

impl Snapshot {
	pub fn empty() -> Self {
		Self {
			version: 0,
			chains: HashMap::new(),
		}
	}

	pub fn new(version: u64, chains: HashMap<String, Arc<PolicyChain>>) -> Self {
		Self { version, chains }
	}

	pub fn version(&self) -> u64 {
		self.version
	}

	pub fn chain(&self, route_key: &str) -> Option<Arc<PolicyChain>> {
		self.chains.get(route_key).cloned()
	}

	pub fn len(&self) -> usize {
		self.chains.len()
	}

	pub fn is_empty(&self) -> bool {
		self.chains.is_empty()
	}
}

pub struct SnapshotStore {
	current: ArcSwap<Snapshot>,
}

impl Default for SnapshotStore {
	fn default() -> Self {
		Self::new()
	}
}

impl SnapshotStore {
	pub fn new() -> Self {
		Self {
			current: ArcSwap::from_pointee(Snapshot::empty()),
		}
	}

	/// Pins the current snapshot. Callers hold the Arc for the life of the
	/// request; superseded snapshots stay alive until the last holder drops.
	pub fn current(&self) -> Arc<Snapshot> {
		self.current.load_full()
	}

	/// Installs a snapshot if its version is newer than the current one.
	/// Out-of-order deliveries are discarded. There is a single writer (the
	/// control-plane subscriber), so load-then-store does not race.
	pub fn install(&self, snapshot: Snapshot) -> bool {
		let current = self.current.load();
		if snapshot.version <= current.version() {
			debug!(
				incoming = snapshot.version,
				current = current.version(),
				"discarding out-of-order snapshot"
			);
			return false;
		}
		info!(
			version = snapshot.version,
			routes = snapshot.len(),
			"installing route snapshot"
		);
		self.current.store(Arc::new(snapshot));
		true
	}
}
