//! CEL expression support: compilation, a shared program cache, and the
//! request/response evaluation contexts used to gate policy execution.
//!
//! One unified set of variables (`request`, `response`, `processing`) is
//! declared in both phases so a single condition compiles and type-checks
//! everywhere; the off-phase object carries zero values and conditions that
//! care must gate on `processing.phase`.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use cel_interpreter::objects::Key;
use cel_interpreter::{Context, Program, Value};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Serialize, Serializer};

use crate::http::{BodyState, Headers, Metadata};

#[cfg(test)]
#[path = "tests.rs"]
mod tests;

#[derive(thiserror::Error, Clone, Debug)]
pub enum Error {
	#[error("parse: {0}")]
	Parse(String),
	#[error("execution: {0}")]
	Eval(String),
	#[error("expected a boolean result, got {0}")]
	NotBoolean(&'static str),
	#[error("variable: {0}")]
	Variable(String),
	#[error("conversion: {0}")]
	Convert(String),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase {
	Request,
	Response,
}

impl Phase {
	pub fn as_str(&self) -> &'static str {
		match self {
			Phase::Request => "request",
			Phase::Response => "response",
		}
	}
}

/// A compiled CEL expression together with its source text.
pub struct Expression {
	program: Program,
	source: String,
}

impl Expression {
	pub fn compile(source: impl Into<String>) -> Result<Self, Error> {
		let source = source.into();
		let program = Program::compile(&source).map_err(|e| Error::Parse(e.to_string()))?;
		Ok(Self { program, source })
	}

	pub fn source(&self) -> &str {
		&self.source
	}
}

impl Debug for Expression {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Expression")
			.field("expression", &self.source)
			.finish()
	}
}

impl Serialize for Expression {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.source)
	}
}

/// Caches compiled programs by source text. Compile failures are cached too,
/// so a bad condition is reported once per process rather than per request.
#[derive(Default)]
pub struct ProgramCache {
	programs: RwLock<HashMap<String, Result<Arc<Expression>, Error>>>,
}

impl ProgramCache {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, source: &str) -> Result<Arc<Expression>, Error> {
		if let Some(cached) = self.programs.read().get(source) {
			return cached.clone();
		}
		// Double-checked: another thread may have compiled while we waited.
		let mut programs = self.programs.write();
		if let Some(cached) = programs.get(source) {
			return cached.clone();
		}
		let compiled = Expression::compile(source).map(Arc::new);
		programs.insert(source.to_string(), compiled.clone());
		compiled
	}

	pub fn len(&self) -> usize {
		self.programs.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.programs.read().is_empty()
	}
}

static EMPTY_HEADERS: Lazy<Headers> = Lazy::new(Headers::default);
static EMPTY_METADATA: Lazy<Metadata> = Lazy::new(Metadata::default);

/// `request.Body` / `response.ResponseBody` as seen from CEL. `Present`
/// distinguishes "no body arrived" from an explicitly empty body.
#[derive(Serialize, Clone, Debug)]
pub struct BodyView<'a> {
	#[serde(rename = "Present")]
	pub present: bool,
	#[serde(rename = "EndOfStream")]
	pub end_of_stream: bool,
	#[serde(rename = "Content")]
	pub content: Cow<'a, str>,
}

impl<'a> BodyView<'a> {
	pub fn of(body: &'a BodyState) -> Self {
		Self {
			present: body.present,
			end_of_stream: body.end_of_stream,
			content: String::from_utf8_lossy(&body.content),
		}
	}

	pub fn absent() -> Self {
		Self {
			present: false,
			end_of_stream: false,
			content: Cow::Borrowed(""),
		}
	}
}

/// The `request` variable.
#[derive(Serialize, Clone, Debug)]
pub struct RequestView<'a> {
	#[serde(rename = "Headers")]
	pub headers: &'a Headers,
	#[serde(rename = "Body")]
	pub body: BodyView<'a>,
	#[serde(rename = "Path")]
	pub path: &'a str,
	#[serde(rename = "Method")]
	pub method: &'a str,
	#[serde(rename = "Authority")]
	pub authority: &'a str,
	#[serde(rename = "Scheme")]
	pub scheme: &'a str,
	#[serde(rename = "RequestID")]
	pub request_id: &'a str,
	#[serde(rename = "Metadata")]
	pub metadata: &'a Metadata,
}

impl RequestView<'_> {
	pub fn empty() -> Self {
		Self {
			headers: &EMPTY_HEADERS,
			body: BodyView::absent(),
			path: "",
			method: "",
			authority: "",
			scheme: "",
			request_id: "",
			metadata: &EMPTY_METADATA,
		}
	}
}

/// The `response` variable. The request-side fields are the frozen request.
#[derive(Serialize, Clone, Debug)]
pub struct ResponseView<'a> {
	#[serde(rename = "RequestHeaders")]
	pub request_headers: &'a Headers,
	#[serde(rename = "RequestBody")]
	pub request_body: BodyView<'a>,
	#[serde(rename = "Path")]
	pub path: &'a str,
	#[serde(rename = "Method")]
	pub method: &'a str,
	#[serde(rename = "ResponseHeaders")]
	pub response_headers: &'a Headers,
	#[serde(rename = "ResponseBody")]
	pub response_body: BodyView<'a>,
	// Signed so CEL integer literals compare directly against it.
	#[serde(rename = "Status")]
	pub status: i64,
	#[serde(rename = "RequestID")]
	pub request_id: &'a str,
	#[serde(rename = "Metadata")]
	pub metadata: &'a Metadata,
}

impl ResponseView<'_> {
	pub fn empty() -> Self {
		Self {
			request_headers: &EMPTY_HEADERS,
			request_body: BodyView::absent(),
			path: "",
			method: "",
			response_headers: &EMPTY_HEADERS,
			response_body: BodyView::absent(),
			status: 0,
			request_id: "",
			metadata: &EMPTY_METADATA,
		}
	}
}

#[derive(Serialize, Clone, Debug)]
struct ProcessingView {
	phase: &'static str,
}

/// Everything a gating condition can see for one evaluation.
#[derive(Debug)]
pub struct Activation<'a> {
	pub phase: Phase,
	pub request: RequestView<'a>,
	pub response: ResponseView<'a>,
}

/// Evaluates a gating condition. Anything other than a clean boolean result
/// is an error; callers treat errors as "do not execute".
pub fn evaluate_bool(expr: &Expression, activation: &Activation) -> Result<bool, Error> {
	let mut ctx = Context::default();
	ctx.add_variable("request", &activation.request)
		.map_err(|e| Error::Variable(e.to_string()))?;
	ctx.add_variable("response", &activation.response)
		.map_err(|e| Error::Variable(e.to_string()))?;
	ctx.add_variable(
		"processing",
		ProcessingView {
			phase: activation.phase.as_str(),
		},
	)
	.map_err(|e| Error::Variable(e.to_string()))?;
	match expr.program.execute(&ctx) {
		Ok(Value::Bool(b)) => Ok(b),
		Ok(other) => Err(Error::NotBoolean(value_kind(&other))),
		Err(e) => Err(Error::Eval(e.to_string())),
	}
}

pub fn value_kind(v: &Value) -> &'static str {
	match v {
		Value::Bool(_) => "bool",
		Value::Int(_) => "int",
		Value::UInt(_) => "uint",
		Value::Float(_) => "double",
		Value::String(_) => "string",
		Value::Bytes(_) => "bytes",
		Value::List(_) => "list",
		Value::Map(_) => "map",
		Value::Null => "null",
		_ => "unknown",
	}
}

/// Converts an evaluated CEL value into JSON, for config template expansion.
pub fn value_to_json(v: &Value) -> Result<serde_json::Value, Error> {
	Ok(match v {
		Value::Null => serde_json::Value::Null,
		Value::Bool(b) => serde_json::Value::Bool(*b),
		Value::Int(i) => serde_json::Value::from(*i),
		Value::UInt(u) => serde_json::Value::from(*u),
		Value::Float(f) => serde_json::Number::from_f64(*f)
			.map(serde_json::Value::Number)
			.ok_or_else(|| Error::Convert(format!("non-finite float {f}")))?,
		Value::String(s) => serde_json::Value::String(s.to_string()),
		Value::Bytes(b) => {
			use base64::Engine;
			serde_json::Value::String(base64::prelude::BASE64_STANDARD.encode(b.as_slice()))
		},
		Value::List(items) => serde_json::Value::Array(
			items
				.iter()
				.map(value_to_json)
				.collect::<Result<Vec<_>, _>>()?,
		),
		Value::Map(m) => {
			let mut out = serde_json::Map::with_capacity(m.map.len());
			for (k, v) in m.map.iter() {
				out.insert(key_to_string(k), value_to_json(v)?);
			}
			serde_json::Value::Object(out)
		},
		other => return Err(Error::Convert(format!("unsupported {} value", value_kind(other)))),
	})
}

/// Stringifies an evaluated CEL value for `${…}` interpolation inside a
/// larger string. Scalars render bare; structured values render as JSON.
pub fn value_to_string(v: &Value) -> Result<String, Error> {
	Ok(match v {
		Value::Null => String::new(),
		Value::Bool(b) => b.to_string(),
		Value::Int(i) => i.to_string(),
		Value::UInt(u) => u.to_string(),
		Value::Float(f) => f.to_string(),
		Value::String(s) => s.to_string(),
		Value::Bytes(b) => {
			use base64::Engine;
			base64::prelude::BASE64_STANDARD.encode(b.as_slice())
		},
		other => value_to_json(other)?.to_string(),
	})
}

fn key_to_string(k: &Key) -> String {
	match k {
		Key::String(s) => s.to_string(),
		Key::Int(i) => i.to_string(),
		Key::Uint(u) => u.to_string(),
		Key::Bool(b) => b.to_string(),
	}
}
