use std::sync::Arc;

use assert_matches::assert_matches;
use serde_json::json;

use super::*;

fn resolver() -> Resolver {
	Resolver::new(Arc::new(json!({
		"auth": {
			"secret": "s3cret",
			"ttl": 300,
			"issuers": ["idp-a", "idp-b"],
			"strict": true,
		},
		"limits": {"rps": 50},
	})))
}

#[test]
fn whole_string_expression_keeps_type() {
	let r = resolver();
	assert_eq!(r.resolve_string("${config.auth.ttl}").unwrap(), json!(300));
	assert_eq!(
		r.resolve_string("${config.auth.strict}").unwrap(),
		json!(true)
	);
	assert_eq!(
		r.resolve_string("${config.auth.issuers}").unwrap(),
		json!(["idp-a", "idp-b"])
	);
}

#[test]
fn mixed_string_interpolates() {
	let r = resolver();
	assert_eq!(
		r.resolve_string("Bearer ${config.auth.secret}!").unwrap(),
		json!("Bearer s3cret!")
	);
	assert_eq!(
		r.resolve_string("${config.limits.rps}-${config.auth.ttl}")
			.unwrap(),
		json!("50-300")
	);
}

#[test]
fn plain_string_passes_through() {
	let r = resolver();
	assert_eq!(r.resolve_string("no references").unwrap(), json!("no references"));
}

#[test]
fn expression_may_contain_braces_in_string_literals() {
	let r = resolver();
	assert_eq!(
		r.resolve_string("${config.auth.secret + \"}\"}").unwrap(),
		json!("s3cret}")
	);
}

#[test]
fn unterminated_reference_is_an_error() {
	let r = resolver();
	assert_matches!(
		r.resolve_string("${config.auth.secret"),
		Err(Error::Unterminated { .. })
	);
}

#[test]
fn undefined_path_is_a_descriptive_error() {
	let r = resolver();
	let err = r.resolve_string("${config.nope.missing}").unwrap_err();
	assert_matches!(err, Error::Eval { .. });
}

#[test]
fn invalid_expression_is_a_parse_error() {
	let r = resolver();
	assert_matches!(r.resolve_string("${config..}"), Err(Error::Parse { .. }));
}

#[test]
fn recursion_covers_nested_maps_and_arrays() {
	let r = resolver();
	let params = json!({
		"secret": "${config.auth.secret}",
		"nested": {"ttl": "${config.auth.ttl}"},
		"list": ["${config.limits.rps}", "literal"],
		"count": 7,
	});
	let resolved = r.resolve_value(&params).unwrap();
	assert_eq!(
		resolved,
		json!({
			"secret": "s3cret",
			"nested": {"ttl": 300},
			"list": [50, "literal"],
			"count": 7,
		})
	);
}

#[test]
fn non_string_scalars_pass_through() {
	let r = resolver();
	assert_eq!(r.resolve_value(&json!(42)).unwrap(), json!(42));
	assert_eq!(r.resolve_value(&json!(null)).unwrap(), json!(null));
	assert_eq!(r.resolve_value(&json!(2.5)).unwrap(), json!(2.5));
}
