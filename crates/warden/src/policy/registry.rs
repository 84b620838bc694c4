//! The process-wide policy registry: immutable (definition, factory) pairs
//! keyed by (name, version). Registration happens once at startup through
//! the builtin registration hook; afterwards the registry is frozen and all
//! reads go through a lock-free snapshot pointer.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::resolve::Resolver;
use crate::policy::{ParamMap, Policy};

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
pub struct PolicyKey {
	pub name: String,
	pub version: String,
}

impl PolicyKey {
	pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			version: version.into(),
		}
	}
}

impl Display for PolicyKey {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}/{}", self.name, self.version)
	}
}

/// Static metadata for a policy kind. Immutable after registration.
#[derive(Clone, Debug, Serialize)]
pub struct PolicyDefinition {
	pub name: String,
	pub version: String,
	pub description: String,
	/// Declared init parameters; runtime parameters win on key collision.
	pub init_parameters: ParamMap,
	pub supports_request_phase: bool,
	pub supports_response_phase: bool,
	pub requires_request_body: bool,
	pub requires_response_body: bool,
}

impl PolicyDefinition {
	pub fn key(&self) -> PolicyKey {
		PolicyKey::new(self.name.clone(), self.version.clone())
	}
}

/// A pure constructor: definition plus fully resolved parameters in, policy
/// instance out.
pub trait PolicyFactory: Send + Sync {
	fn create(
		&self,
		definition: &PolicyDefinition,
		params: &ParamMap,
	) -> anyhow::Result<Arc<dyn Policy>>;
}

impl<F> PolicyFactory for F
where
	F: Fn(&PolicyDefinition, &ParamMap) -> anyhow::Result<Arc<dyn Policy>> + Send + Sync,
{
	fn create(
		&self,
		definition: &PolicyDefinition,
		params: &ParamMap,
	) -> anyhow::Result<Arc<dyn Policy>> {
		self(definition, params)
	}
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("policy {0} is already registered")]
	Duplicate(PolicyKey),
	#[error("registry is frozen; registration is a startup-only operation")]
	Frozen,
	#[error("unknown policy {0}")]
	Unknown(PolicyKey),
	#[error("resolving configuration for {key}: {source}")]
	Resolve {
		key: PolicyKey,
		source: crate::config::resolve::Error,
	},
	#[error("constructing {key}: {source}")]
	Factory {
		key: PolicyKey,
		source: anyhow::Error,
	},
}

#[derive(Clone)]
struct RegistryEntry {
	definition: Arc<PolicyDefinition>,
	factory: Arc<dyn PolicyFactory>,
}

#[derive(Default)]
struct RegistryState {
	entries: HashMap<PolicyKey, RegistryEntry>,
	frozen: bool,
}

/// A successfully instantiated policy plus everything the chain needs to
/// run it.
pub struct CreatedPolicy {
	pub policy: Arc<dyn Policy>,
	pub definition: Arc<PolicyDefinition>,
	pub params: Arc<ParamMap>,
}

impl std::fmt::Debug for CreatedPolicy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CreatedPolicy")
			.field("policy", &self.policy.name())
			.field("definition", &self.definition)
			.field("params", &self.params)
			.finish()
	}
}

pub struct Registry {
	state: ArcSwap<RegistryState>,
	// Serializes writers; readers never take it.
	write: Mutex<()>,
}

impl Default for Registry {
	fn default() -> Self {
		Self::new()
	}
}

impl Registry {
	pub fn new() -> Self {
		Self {
			state: ArcSwap::from_pointee(RegistryState::default()),
			write: Mutex::new(()),
		}
	}

	pub fn register(
		&self,
		definition: PolicyDefinition,
		factory: impl PolicyFactory + 'static,
	) -> Result<(), Error> {
		let _guard = self.write.lock();
		let current = self.state.load();
		if current.frozen {
			return Err(Error::Frozen);
		}
		let key = definition.key();
		if current.entries.contains_key(&key) {
			return Err(Error::Duplicate(key));
		}
		let mut entries = current.entries.clone();
		entries.insert(
			key,
			RegistryEntry {
				definition: Arc::new(definition),
				factory: Arc::new(factory),
			},
		);
		self.state.store(Arc::new(RegistryState {
			entries,
			frozen: false,
		}));
		Ok(())
	}

	/// Rejects all further registration. Called once startup registration
	/// completes.
	pub fn freeze(&self) {
		let _guard = self.write.lock();
		let current = self.state.load();
		self.state.store(Arc::new(RegistryState {
			entries: current.entries.clone(),
			frozen: true,
		}));
	}

	pub fn definition(&self, name: &str, version: &str) -> Option<Arc<PolicyDefinition>> {
		self
			.state
			.load()
			.entries
			.get(&PolicyKey::new(name, version))
			.map(|e| e.definition.clone())
	}

	pub fn factory(&self, name: &str, version: &str) -> Option<Arc<dyn PolicyFactory>> {
		self
			.state
			.load()
			.entries
			.get(&PolicyKey::new(name, version))
			.map(|e| e.factory.clone())
	}

	pub fn len(&self) -> usize {
		self.state.load().entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.state.load().entries.is_empty()
	}

	/// Merges init parameters with runtime parameters (runtime wins),
	/// expands `${…}` references, and invokes the factory. Errors here are
	/// fatal to the enclosing route chain entry, never to the process.
	pub fn create_instance(
		&self,
		name: &str,
		version: &str,
		runtime_params: &ParamMap,
		resolver: &Resolver,
	) -> Result<CreatedPolicy, Error> {
		let key = PolicyKey::new(name, version);
		let entry = {
			let state = self.state.load();
			state
				.entries
				.get(&key)
				.cloned()
				.ok_or_else(|| Error::Unknown(key.clone()))?
		};
		let mut merged = entry.definition.init_parameters.clone();
		for (k, v) in runtime_params {
			merged.insert(k.clone(), v.clone());
		}
		let resolved = resolver
			.resolve_params(&merged)
			.map_err(|source| Error::Resolve {
				key: key.clone(),
				source,
			})?;
		let policy = entry
			.factory
			.create(&entry.definition, &resolved)
			.map_err(|source| Error::Factory { key, source })?;
		Ok(CreatedPolicy {
			policy,
			definition: entry.definition.clone(),
			params: Arc::new(resolved),
		})
	}
}
