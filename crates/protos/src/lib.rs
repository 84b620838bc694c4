#![allow(clippy::large_enum_variant)]

//! Generated bindings for the trimmed Envoy ext_proc v3 protos. The module
//! tree mirrors the proto package tree so cross-package references resolve.

pub mod envoy {
	pub mod config {
		pub mod core {
			pub mod v3 {
				tonic::include_proto!("envoy.config.core.v3");
			}
		}
	}

	pub mod extensions {
		pub mod filters {
			pub mod http {
				pub mod ext_proc {
					pub mod v3 {
						tonic::include_proto!("envoy.extensions.filters.http.ext_proc.v3");
					}
				}
			}
		}
	}

	pub mod r#type {
		pub mod v3 {
			include!(concat!(env!("OUT_DIR"), "/envoy.r#type.v3.rs"));
		}
	}

	pub mod service {
		pub mod ext_proc {
			pub mod v3 {
				tonic::include_proto!("envoy.service.ext_proc.v3");
			}
		}
	}
}
