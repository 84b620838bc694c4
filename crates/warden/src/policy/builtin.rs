//! The one-shot registration hook. The build toolchain's generated
//! registration lands here; the engine binary calls it exactly once at
//! startup and then freezes the registry.

use crate::policy::registry::{Error, Registry};
use crate::policy::{apikey, jwt, ratelimit, regex_guardrail, transform};

pub fn register_builtin(registry: &Registry) -> Result<(), Error> {
	registry.register(jwt::definition(), jwt::factory)?;
	registry.register(apikey::definition(), apikey::factory)?;
	registry.register(regex_guardrail::definition(), regex_guardrail::factory)?;
	registry.register(ratelimit::definition(), ratelimit::factory)?;
	registry.register(transform::definition(), transform::factory)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn all_builtins_register_once() {
		let registry = Registry::new();
		register_builtin(&registry).unwrap();
		assert_eq!(registry.len(), 5);
		assert!(registry.definition(jwt::NAME, jwt::VERSION).is_some());
		assert!(
			registry
				.definition(regex_guardrail::NAME, regex_guardrail::VERSION)
				.is_some()
		);
		// A second registration is a duplicate, not a silent overwrite.
		assert!(register_builtin(&registry).is_err());
	}
}
