//! Conversions between the ext_proc wire types and the engine's internal
//! request state.

use std::collections::HashMap;

use protos::envoy::config::core::v3 as core;
use protos::envoy::extensions::filters::http::ext_proc::v3 as mode;
use protos::envoy::r#type::v3 as envoy_type;
use protos::envoy::service::ext_proc::v3 as ext_proc;
use protos::envoy::service::ext_proc::v3::processing_response::Response;

use crate::http::Headers;
use crate::policy::ImmediateResponseSpec;
use crate::policy::chain::PolicyChain;

#[cfg(test)]
#[path = "wire_tests.rs"]
mod tests;

/// The namespace Envoy files ext_proc request attributes under.
pub const ATTRIBUTES_NAMESPACE: &str = "envoy.filters.http.ext_proc";
/// The request attribute carrying the matched route's name.
pub const ROUTE_NAME_ATTRIBUTE: &str = "xds.route_name";

/// Pseudo-headers peeled off the proto header map.
#[derive(Debug, Default, PartialEq)]
pub struct PseudoHeaders {
	pub path: String,
	pub method: String,
	pub authority: String,
	pub scheme: String,
	pub status: Option<u16>,
}

/// Splits the proxy's header list into pseudo-headers and the lowercase
/// multimap. Raw values win over the deprecated string field, matching the
/// proto contract.
pub fn split_headers(map: Option<&core::HeaderMap>, into: &mut Headers) -> PseudoHeaders {
	let mut pseudo = PseudoHeaders::default();
	let Some(map) = map else {
		return pseudo;
	};
	for hv in &map.headers {
		let value = header_value(hv);
		match hv.key.as_str() {
			":path" => pseudo.path = value,
			":method" => pseudo.method = value,
			":authority" => pseudo.authority = value,
			":scheme" => pseudo.scheme = value,
			":status" => pseudo.status = value.parse().ok(),
			_ => into.append(&hv.key, value),
		}
	}
	pseudo
}

fn header_value(hv: &core::HeaderValue) -> String {
	if hv.raw_value.is_empty() {
		hv.value.clone()
	} else {
		String::from_utf8_lossy(&hv.raw_value).into_owned()
	}
}

/// Extracts the route key from the proxy-supplied request attributes.
pub fn route_key(attributes: &HashMap<String, prost_types::Struct>) -> Option<String> {
	let ns = attributes.get(ATTRIBUTES_NAMESPACE)?;
	let value = ns.fields.get(ROUTE_NAME_ATTRIBUTE)?;
	match value.kind.as_ref()? {
		prost_types::value::Kind::StringValue(s) if !s.is_empty() => Some(s.clone()),
		_ => None,
	}
}

/// The body-buffering override announced on the first response, derived
/// from the chain's precomputed flags. `None` when nothing needs buffering.
pub fn mode_override(chain: &PolicyChain) -> Option<mode::ProcessingMode> {
	if !chain.requires_request_body && !chain.requires_response_body {
		return None;
	}
	fn body_mode(buffered: bool) -> i32 {
		if buffered {
			mode::processing_mode::BodySendMode::Buffered as i32
		} else {
			mode::processing_mode::BodySendMode::None as i32
		}
	}
	Some(mode::ProcessingMode {
		request_header_mode: mode::processing_mode::HeaderSendMode::Default as i32,
		request_body_mode: body_mode(chain.requires_request_body),
		request_trailer_mode: mode::processing_mode::HeaderSendMode::Default as i32,
		response_header_mode: mode::processing_mode::HeaderSendMode::Default as i32,
		response_body_mode: body_mode(chain.requires_response_body),
		response_trailer_mode: mode::processing_mode::HeaderSendMode::Default as i32,
	})
}

pub fn request_headers_response(
	common: Option<ext_proc::CommonResponse>,
	mode_override: Option<mode::ProcessingMode>,
) -> ext_proc::ProcessingResponse {
	ext_proc::ProcessingResponse {
		response: Some(Response::RequestHeaders(ext_proc::HeadersResponse {
			response: common,
		})),
		mode_override,
		..Default::default()
	}
}

pub fn response_headers_response(
	common: Option<ext_proc::CommonResponse>,
) -> ext_proc::ProcessingResponse {
	ext_proc::ProcessingResponse {
		response: Some(Response::ResponseHeaders(ext_proc::HeadersResponse {
			response: common,
		})),
		..Default::default()
	}
}

pub fn request_body_response(
	common: Option<ext_proc::CommonResponse>,
) -> ext_proc::ProcessingResponse {
	ext_proc::ProcessingResponse {
		response: Some(Response::RequestBody(ext_proc::BodyResponse {
			response: common,
		})),
		..Default::default()
	}
}

pub fn response_body_response(
	common: Option<ext_proc::CommonResponse>,
) -> ext_proc::ProcessingResponse {
	ext_proc::ProcessingResponse {
		response: Some(Response::ResponseBody(ext_proc::BodyResponse {
			response: common,
		})),
		..Default::default()
	}
}

pub fn request_trailers_response() -> ext_proc::ProcessingResponse {
	ext_proc::ProcessingResponse {
		response: Some(Response::RequestTrailers(ext_proc::TrailersResponse {
			header_mutation: None,
		})),
		..Default::default()
	}
}

pub fn response_trailers_response() -> ext_proc::ProcessingResponse {
	ext_proc::ProcessingResponse {
		response: Some(Response::ResponseTrailers(ext_proc::TrailersResponse {
			header_mutation: None,
		})),
		..Default::default()
	}
}

pub fn immediate_response(spec: &ImmediateResponseSpec) -> ext_proc::ProcessingResponse {
	let headers = if spec.headers.is_empty() {
		None
	} else {
		Some(ext_proc::HeaderMutation {
			set_headers: spec
				.headers
				.iter()
				.map(|(name, value)| core::HeaderValueOption {
					header: Some(core::HeaderValue {
						key: name.clone(),
						value: String::new(),
						raw_value: value.as_bytes().to_vec(),
					}),
					append: None,
					append_action:
						core::header_value_option::HeaderAppendAction::OverwriteIfExistsOrAdd as i32,
					keep_empty_value: false,
				})
				.collect(),
			remove_headers: Vec::new(),
		})
	};
	ext_proc::ProcessingResponse {
		response: Some(Response::ImmediateResponse(ext_proc::ImmediateResponse {
			status: Some(envoy_type::HttpStatus {
				code: spec.status as i32,
			}),
			headers,
			body: spec.body.clone(),
			grpc_status: None,
			details: String::new(),
		})),
		..Default::default()
	}
}
