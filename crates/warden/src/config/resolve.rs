//! Expands `${<CEL expression>}` references inside policy init parameters.
//! The expression environment binds exactly one variable, `config`, pointing
//! at the loaded `policy_configurations` tree. Resolution happens once at
//! chain-build time, never on the hot path.

use std::sync::Arc;

use cel_interpreter::{Context, Program, Value};

use crate::cel::{value_to_json, value_to_string};
use crate::policy::ParamMap;

#[cfg(test)]
#[path = "resolve_tests.rs"]
mod tests;

#[derive(thiserror::Error, Clone, Debug)]
pub enum Error {
	#[error("parse `${{{expr}}}`: {message}")]
	Parse { expr: String, message: String },
	#[error("evaluate `${{{expr}}}`: {message}")]
	Eval { expr: String, message: String },
	#[error("unterminated ${{…}} reference in {input:?}")]
	Unterminated { input: String },
	#[error("convert `${{{expr}}}` result: {message}")]
	Convert { expr: String, message: String },
}

pub struct Resolver {
	tree: Arc<serde_json::Value>,
}

impl Resolver {
	pub fn new(tree: Arc<serde_json::Value>) -> Self {
		Self { tree }
	}

	/// Resolves every string reachable in the parameter bag. Non-string
	/// scalars pass through unchanged.
	pub fn resolve_params(&self, params: &ParamMap) -> Result<ParamMap, Error> {
		params
			.iter()
			.map(|(k, v)| Ok((k.clone(), self.resolve_value(v)?)))
			.collect()
	}

	pub fn resolve_value(&self, value: &serde_json::Value) -> Result<serde_json::Value, Error> {
		Ok(match value {
			serde_json::Value::String(s) => self.resolve_string(s)?,
			serde_json::Value::Array(items) => serde_json::Value::Array(
				items
					.iter()
					.map(|v| self.resolve_value(v))
					.collect::<Result<_, _>>()?,
			),
			serde_json::Value::Object(map) => serde_json::Value::Object(
				map
					.iter()
					.map(|(k, v)| Ok((k.clone(), self.resolve_value(v)?)))
					.collect::<Result<_, _>>()?,
			),
			other => other.clone(),
		})
	}

	/// A string that is entirely one `${…}` keeps the expression's type; a
	/// mixed string stringifies each expression result in place.
	pub fn resolve_string(&self, input: &str) -> Result<serde_json::Value, Error> {
		let segments = split_template(input)?;
		match segments.as_slice() {
			[Segment::Expr(expr)] => {
				let v = self.eval(expr)?;
				value_to_json(&v).map_err(|e| Error::Convert {
					expr: expr.clone(),
					message: e.to_string(),
				})
			},
			_ if !segments.iter().any(|s| matches!(s, Segment::Expr(_))) => {
				Ok(serde_json::Value::String(input.to_string()))
			},
			_ => {
				let mut out = String::with_capacity(input.len());
				for segment in &segments {
					match segment {
						Segment::Literal(text) => out.push_str(text),
						Segment::Expr(expr) => {
							let v = self.eval(expr)?;
							out.push_str(&value_to_string(&v).map_err(|e| Error::Convert {
								expr: expr.clone(),
								message: e.to_string(),
							})?);
						},
					}
				}
				Ok(serde_json::Value::String(out))
			},
		}
	}

	fn eval(&self, expr: &str) -> Result<Value, Error> {
		let program = Program::compile(expr).map_err(|e| Error::Parse {
			expr: expr.to_string(),
			message: e.to_string(),
		})?;
		let mut ctx = Context::default();
		ctx
			.add_variable("config", &*self.tree)
			.map_err(|e| Error::Eval {
				expr: expr.to_string(),
				message: e.to_string(),
			})?;
		program.execute(&ctx).map_err(|e| Error::Eval {
			expr: expr.to_string(),
			message: e.to_string(),
		})
	}
}

#[derive(Debug, PartialEq)]
enum Segment {
	Literal(String),
	Expr(String),
}

/// Splits a string into literal and `${…}` segments. The closing brace is
/// matched with brace-depth tracking that skips CEL string literals, so
/// expressions like `${config.x + "}"}` parse correctly.
fn split_template(input: &str) -> Result<Vec<Segment>, Error> {
	let mut segments = Vec::new();
	let mut literal = String::new();
	let mut chars = input.char_indices().peekable();
	while let Some((i, c)) = chars.next() {
		if c == '$' && matches!(chars.peek(), Some((_, '{'))) {
			chars.next();
			let start = i + 2;
			let end = find_closing_brace(input, start).ok_or_else(|| Error::Unterminated {
				input: input.to_string(),
			})?;
			if !literal.is_empty() {
				segments.push(Segment::Literal(std::mem::take(&mut literal)));
			}
			segments.push(Segment::Expr(input[start..end].to_string()));
			while let Some((j, _)) = chars.peek() {
				if *j > end {
					break;
				}
				chars.next();
			}
		} else {
			literal.push(c);
		}
	}
	if !literal.is_empty() {
		segments.push(Segment::Literal(literal));
	}
	Ok(segments)
}

fn find_closing_brace(input: &str, start: usize) -> Option<usize> {
	let mut depth = 1usize;
	let mut quote: Option<char> = None;
	let mut escaped = false;
	for (i, c) in input[start..].char_indices() {
		if let Some(q) = quote {
			if escaped {
				escaped = false;
			} else if c == '\\' {
				escaped = true;
			} else if c == q {
				quote = None;
			}
			continue;
		}
		match c {
			'"' | '\'' => quote = Some(c),
			'{' => depth += 1,
			'}' => {
				depth -= 1;
				if depth == 0 {
					return Some(start + i);
				}
			},
			_ => {},
		}
	}
	None
}
