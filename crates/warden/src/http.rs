//! HTTP-shaped state for one in-flight request: the lowercase header
//! multimap, buffered body state, and the per-phase policy contexts.

use bytes::Bytes;
use indexmap::IndexMap;
use serde::Serialize;

use crate::cel::{Activation, BodyView, Phase, RequestView, ResponseView};
use crate::pool::Reset;

/// Multimap of header name to ordered values. Names are lowercased on
/// insert so retrieval is case-insensitive.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Headers {
	entries: IndexMap<String, Vec<String>>,
}

impl Headers {
	pub fn new() -> Self {
		Self::default()
	}

	/// First value for the name, if any.
	pub fn get(&self, name: &str) -> Option<&str> {
		self
			.entries
			.get(&lower(name))
			.and_then(|v| v.first())
			.map(String::as_str)
	}

	pub fn get_all(&self, name: &str) -> &[String] {
		self
			.entries
			.get(&lower(name))
			.map(Vec::as_slice)
			.unwrap_or_default()
	}

	pub fn contains(&self, name: &str) -> bool {
		self.entries.contains_key(&lower(name))
	}

	/// Replaces all values for the name.
	pub fn set(&mut self, name: &str, value: impl Into<String>) {
		self.entries.insert(lower(name), vec![value.into()]);
	}

	pub fn append(&mut self, name: &str, value: impl Into<String>) {
		self.entries.entry(lower(name)).or_default().push(value.into());
	}

	pub fn remove(&mut self, name: &str) {
		self.entries.shift_remove(&lower(name));
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self
			.entries
			.iter()
			.flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
	}

	pub fn len(&self) -> usize {
		self.entries.values().map(Vec::len).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn clear(&mut self) {
		self.entries.clear();
	}
}

impl Reset for Headers {
	fn reset(&mut self) {
		self.clear();
	}
}

impl<S: Into<String>> FromIterator<(S, S)> for Headers {
	fn from_iter<T: IntoIterator<Item = (S, S)>>(iter: T) -> Self {
		let mut h = Headers::new();
		for (k, v) in iter {
			h.append(&k.into(), v.into());
		}
		h
	}
}

fn lower(name: &str) -> String {
	name.to_ascii_lowercase()
}

/// Buffered body state. `present` is false until the proxy has actually
/// delivered a body message, which is distinct from an empty body.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BodyState {
	pub content: Bytes,
	pub end_of_stream: bool,
	pub present: bool,
}

impl BodyState {
	pub fn absent() -> Self {
		Self::default()
	}

	pub fn received(content: Bytes, end_of_stream: bool) -> Self {
		Self {
			content,
			end_of_stream,
			present: true,
		}
	}
}

/// String-keyed bag policies use to hand state to later policies and to the
/// response phase.
pub type Metadata = IndexMap<String, serde_json::Value>;

/// Mutable request-phase view of one HTTP request.
#[derive(Debug, Default)]
pub struct RequestContext {
	pub headers: Headers,
	pub body: BodyState,
	pub path: String,
	pub method: String,
	pub authority: String,
	pub scheme: String,
	pub api_name: String,
	pub api_version: String,
	pub api_context: String,
	pub operation_path: String,
	pub request_id: String,
	pub metadata: Metadata,
}

impl RequestContext {
	pub fn activation(&self) -> Activation<'_> {
		Activation {
			phase: Phase::Request,
			request: RequestView {
				headers: &self.headers,
				body: BodyView::of(&self.body),
				path: &self.path,
				method: &self.method,
				authority: &self.authority,
				scheme: &self.scheme,
				request_id: &self.request_id,
				metadata: &self.metadata,
			},
			response: ResponseView::empty(),
		}
	}
}

/// The request-side fields frozen at the request/response boundary.
#[derive(Debug, Default)]
pub struct FrozenRequest {
	pub headers: Headers,
	pub body: BodyState,
	pub path: String,
	pub method: String,
	pub authority: String,
	pub scheme: String,
}

/// Response-phase view: the frozen request plus the mutable response side.
#[derive(Debug, Default)]
pub struct ResponseContext {
	pub request: FrozenRequest,
	pub headers: Headers,
	pub body: BodyState,
	pub status: u16,
	pub api_name: String,
	pub api_version: String,
	pub api_context: String,
	pub operation_path: String,
	pub request_id: String,
	pub metadata: Metadata,
}

impl ResponseContext {
	/// Freezes the request context and carries the metadata bag across the
	/// phase boundary.
	pub fn from_request(req: RequestContext, status: u16, headers: Headers) -> Self {
		Self {
			request: FrozenRequest {
				headers: req.headers,
				body: req.body,
				path: req.path,
				method: req.method,
				authority: req.authority,
				scheme: req.scheme,
			},
			headers,
			body: BodyState::absent(),
			status,
			api_name: req.api_name,
			api_version: req.api_version,
			api_context: req.api_context,
			operation_path: req.operation_path,
			request_id: req.request_id,
			metadata: req.metadata,
		}
	}

	pub fn activation(&self) -> Activation<'_> {
		Activation {
			phase: Phase::Response,
			request: RequestView {
				headers: &self.request.headers,
				body: BodyView::of(&self.request.body),
				path: &self.request.path,
				method: &self.request.method,
				authority: &self.request.authority,
				scheme: &self.request.scheme,
				request_id: &self.request_id,
				metadata: &self.metadata,
			},
			response: ResponseView {
				request_headers: &self.request.headers,
				request_body: BodyView::of(&self.request.body),
				path: &self.request.path,
				method: &self.request.method,
				response_headers: &self.headers,
				response_body: BodyView::of(&self.body),
				status: self.status as i64,
				request_id: &self.request_id,
				metadata: &self.metadata,
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn header_names_are_case_insensitive() {
		let mut h = Headers::new();
		h.set("X-User", "v");
		h.set("x-user", "w");
		assert_eq!(h.get("X-USER"), Some("w"));
		assert_eq!(h.len(), 1);
	}

	#[test]
	fn append_preserves_order() {
		let mut h = Headers::new();
		h.append("Accept", "a");
		h.append("accept", "b");
		assert_eq!(h.get_all("accept"), &["a".to_string(), "b".to_string()]);
	}

	#[test]
	fn absent_body_differs_from_empty_body() {
		let absent = BodyState::absent();
		let empty = BodyState::received(Bytes::new(), true);
		assert!(!absent.present);
		assert!(empty.present);
		assert_ne!(absent, empty);
	}

	#[test]
	fn freezing_carries_metadata_and_request_fields() {
		let mut req = RequestContext {
			path: "/pets".into(),
			method: "GET".into(),
			request_id: "r1".into(),
			..Default::default()
		};
		req
			.metadata
			.insert("auth.success".into(), serde_json::Value::Bool(true));
		let resp = ResponseContext::from_request(req, 200, Headers::new());
		assert_eq!(resp.request.path, "/pets");
		assert_eq!(resp.status, 200);
		assert_eq!(
			resp.metadata.get("auth.success"),
			Some(&serde_json::Value::Bool(true))
		);
	}
}
