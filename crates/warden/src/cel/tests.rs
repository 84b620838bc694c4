use std::sync::Arc;

use assert_matches::assert_matches;
use bytes::Bytes;
use rstest::rstest;
use serde_json::json;

use super::*;
use crate::http::{BodyState, Headers, RequestContext, ResponseContext};

fn get_request() -> RequestContext {
	let mut ctx = RequestContext {
		path: "/petstore/v1/pets/42".to_string(),
		method: "GET".to_string(),
		authority: "api.example.com".to_string(),
		scheme: "https".to_string(),
		request_id: "req-1".to_string(),
		..Default::default()
	};
	ctx.headers.set("Authorization", "Bearer abc");
	ctx
}

fn eval(expr: &str, activation: &Activation) -> Result<bool, Error> {
	evaluate_bool(&Expression::compile(expr).unwrap(), activation)
}

#[rstest]
#[case("request.Method == \"GET\"", true)]
#[case("request.Method == \"POST\"", false)]
#[case("request.Path.startsWith(\"/petstore\")", true)]
#[case("processing.phase == \"request\"", true)]
#[case("processing.phase == \"response\"", false)]
#[case("request.RequestID == \"req-1\"", true)]
#[case("\"authorization\" in request.Headers", true)]
#[case("request.Headers[\"authorization\"][0] == \"Bearer abc\"", true)]
fn request_phase_conditions(#[case] expr: &str, #[case] expected: bool) {
	let ctx = get_request();
	assert_eq!(eval(expr, &ctx.activation()).unwrap(), expected, "{expr}");
}

#[test]
fn dual_phase_condition_flips_between_phases() {
	// The S3 shape: a condition that holds only in the request phase.
	let expr = "request.Method == \"GET\" && processing.phase == \"request\"";
	let req = get_request();
	assert!(eval(expr, &req.activation()).unwrap());

	let resp = ResponseContext::from_request(req, 200, Headers::new());
	assert!(!eval(expr, &resp.activation()).unwrap());
	// The request alias stays visible in the response phase.
	assert!(eval("request.Method == \"GET\"", &resp.activation()).unwrap());
}

#[test]
fn response_phase_sees_response_fields() {
	let req = get_request();
	let mut resp = ResponseContext::from_request(req, 503, Headers::new());
	resp.headers.set("content-type", "application/json");
	let act = resp.activation();
	assert!(eval("response.Status == 503", &act).unwrap());
	assert!(eval("response.ResponseHeaders[\"content-type\"][0].contains(\"json\")", &act).unwrap());
	assert!(eval("response.Method == \"GET\"", &act).unwrap());
}

#[test]
fn metadata_written_in_request_phase_is_visible() {
	let mut ctx = get_request();
	ctx.metadata.insert("auth.success".into(), json!(true));
	assert!(eval("request.Metadata[\"auth.success\"] == true", &ctx.activation()).unwrap());

	let resp = ResponseContext::from_request(ctx, 200, Headers::new());
	assert!(eval("response.Metadata[\"auth.success\"] == true", &resp.activation()).unwrap());
}

#[test]
fn absent_body_is_distinguishable_from_empty_body() {
	let mut ctx = get_request();
	assert!(eval("!request.Body.Present", &ctx.activation()).unwrap());

	ctx.body = BodyState::received(Bytes::new(), true);
	assert!(eval("request.Body.Present && request.Body.Content == \"\"", &ctx.activation()).unwrap());

	ctx.body = BodyState::received(Bytes::from_static(b"x"), true);
	assert!(eval("request.Body.Content == \"x\"", &ctx.activation()).unwrap());
}

#[test]
fn off_phase_response_object_is_zero_valued() {
	let ctx = get_request();
	// Conditions touching response fields still type-check during the
	// request phase; they just see zero values.
	assert!(eval("response.Status == 0", &ctx.activation()).unwrap());
	assert!(eval("response.ResponseBody.Present == false", &ctx.activation()).unwrap());
}

#[test]
fn non_boolean_result_is_an_error() {
	let ctx = get_request();
	assert_matches!(
		eval("request.Path", &ctx.activation()),
		Err(Error::NotBoolean("string"))
	);
	assert_matches!(eval("1 + 1", &ctx.activation()), Err(Error::NotBoolean("int")));
}

#[test]
fn evaluation_errors_are_reported() {
	let ctx = get_request();
	assert_matches!(
		eval("unknown_variable == 1", &ctx.activation()),
		Err(Error::Eval(_))
	);
}

#[test]
fn cache_returns_the_same_program_for_the_same_source() {
	let cache = ProgramCache::new();
	let a = cache.get("request.Method == \"GET\"").unwrap();
	let b = cache.get("request.Method == \"GET\"").unwrap();
	assert!(Arc::ptr_eq(&a, &b));
	assert_eq!(cache.len(), 1);

	let c = cache.get("request.Method == \"POST\"").unwrap();
	assert!(!Arc::ptr_eq(&a, &c));
	assert_eq!(cache.len(), 2);
}

#[test]
fn cache_remembers_compile_failures() {
	let cache = ProgramCache::new();
	assert_matches!(cache.get("request.Method =="), Err(Error::Parse(_)));
	assert_matches!(cache.get("request.Method =="), Err(Error::Parse(_)));
	assert_eq!(cache.len(), 1);
}

#[test]
fn value_conversions_round_trip_through_json() {
	let r = Expression::compile("{\"a\": 1, \"b\": [true, \"x\"]}").unwrap();
	let ctx = Context::default();
	let v = r.program.execute(&ctx).unwrap();
	assert_eq!(
		value_to_json(&v).unwrap(),
		json!({"a": 1, "b": [true, "x"]})
	);

	let n = Expression::compile("21 * 2").unwrap();
	let v = n.program.execute(&ctx).unwrap();
	assert_eq!(value_to_string(&v).unwrap(), "42");
}
