fn main() -> Result<(), anyhow::Error> {
	// protox compiles the vendored protos in-process so builds do not depend
	// on a system protoc.
	let fds = protox::compile(
		["proto/envoy/service/ext_proc/v3/external_processor.proto"],
		["proto"],
	)?;
	tonic_prost_build::configure()
		.build_client(true)
		.build_server(true)
		.compile_fds(fds)?;
	println!("cargo:rerun-if-changed=proto");
	Ok(())
}
