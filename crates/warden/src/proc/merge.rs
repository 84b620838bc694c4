//! Deterministic merging of successive policy mutations within one phase,
//! and the translation of the merged result into a single proxy response.
//!
//! Ordering: `set` overwrites earlier sets of the same (case-insensitive)
//! key, `append` accumulates in order, and removes apply last when the
//! merged result is applied, so a remove wins over an earlier set or append
//! of the same key.

use bytes::Bytes;
use indexmap::{IndexMap, IndexSet};
use protos::envoy::config::core::v3 as core;
use protos::envoy::service::ext_proc::v3 as ext_proc;

use crate::policy::{RequestModifications, ResponseModifications};

#[cfg(test)]
#[path = "merge_tests.rs"]
mod tests;

#[derive(Debug, Default, PartialEq)]
pub struct PhaseMutations {
	set: IndexMap<String, String>,
	append: Vec<(String, String)>,
	remove: IndexSet<String>,
	body: Option<Bytes>,
	path: Option<String>,
	method: Option<String>,
	status: Option<u16>,
}

impl PhaseMutations {
	pub fn merge_request(&mut self, m: &RequestModifications) {
		self.merge_headers(&m.set_headers, &m.append_headers, &m.remove_headers);
		if let Some(body) = &m.body {
			self.body = Some(body.clone());
		}
		if let Some(path) = &m.path {
			self.path = Some(path.clone());
		}
		if let Some(method) = &m.method {
			self.method = Some(method.clone());
		}
	}

	pub fn merge_response(&mut self, m: &ResponseModifications) {
		self.merge_headers(&m.set_headers, &m.append_headers, &m.remove_headers);
		if let Some(body) = &m.body {
			self.body = Some(body.clone());
		}
		if let Some(status) = m.status {
			self.status = Some(status);
		}
	}

	fn merge_headers(
		&mut self,
		set: &[(String, String)],
		append: &[(String, String)],
		remove: &[String],
	) {
		for (name, value) in set {
			self.set.insert(name.to_ascii_lowercase(), value.clone());
		}
		for (name, value) in append {
			self.append.push((name.to_ascii_lowercase(), value.clone()));
		}
		for name in remove {
			self.remove.insert(name.to_ascii_lowercase());
		}
	}

	pub fn is_empty(&self) -> bool {
		self == &Self::default()
	}

	pub fn set_header(&self, name: &str) -> Option<&str> {
		self.set.get(&name.to_ascii_lowercase()).map(String::as_str)
	}

	pub fn appended(&self) -> &[(String, String)] {
		&self.append
	}

	pub fn removes(&self, name: &str) -> bool {
		self.remove.contains(&name.to_ascii_lowercase())
	}

	pub fn body(&self) -> Option<&Bytes> {
		self.body.as_ref()
	}

	pub fn status(&self) -> Option<u16> {
		self.status
	}

	/// Serializes the merged result for the wire. Returns `None` when there
	/// is nothing to mutate, which callers encode as a pass-through
	/// response.
	pub fn into_common_response(self) -> Option<ext_proc::CommonResponse> {
		if self.is_empty() {
			return None;
		}
		let mut set_headers = Vec::with_capacity(self.set.len() + self.append.len() + 3);
		for (name, value) in &self.set {
			set_headers.push(header_option(name, value, core::header_value_option::HeaderAppendAction::OverwriteIfExistsOrAdd));
		}
		for (name, value) in &self.append {
			set_headers.push(header_option(name, value, core::header_value_option::HeaderAppendAction::AppendIfExistsOrAdd));
		}
		if let Some(path) = &self.path {
			set_headers.push(header_option(":path", path, core::header_value_option::HeaderAppendAction::OverwriteIfExistsOrAdd));
		}
		if let Some(method) = &self.method {
			set_headers.push(header_option(":method", method, core::header_value_option::HeaderAppendAction::OverwriteIfExistsOrAdd));
		}
		if let Some(status) = self.status {
			set_headers.push(header_option(":status", &status.to_string(), core::header_value_option::HeaderAppendAction::OverwriteIfExistsOrAdd));
		}
		let header_mutation = if set_headers.is_empty() && self.remove.is_empty() {
			None
		} else {
			Some(ext_proc::HeaderMutation {
				set_headers,
				remove_headers: self.remove.iter().cloned().collect(),
			})
		};
		let body_mutation = self.body.map(|body| ext_proc::BodyMutation {
			mutation: Some(if body.is_empty() {
				ext_proc::body_mutation::Mutation::ClearBody(true)
			} else {
				ext_proc::body_mutation::Mutation::Body(body.to_vec())
			}),
		});
		Some(ext_proc::CommonResponse {
			status: ext_proc::common_response::ResponseStatus::Continue as i32,
			header_mutation,
			body_mutation,
			trailers: None,
			clear_route_cache: false,
		})
	}
}

fn header_option(
	name: &str,
	value: &str,
	action: core::header_value_option::HeaderAppendAction,
) -> core::HeaderValueOption {
	core::HeaderValueOption {
		header: Some(core::HeaderValue {
			key: name.to_string(),
			value: String::new(),
			raw_value: value.as_bytes().to_vec(),
		}),
		append: None,
		append_action: action as i32,
		keep_empty_value: false,
	}
}
