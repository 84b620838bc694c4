use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use warden::cel::ProgramCache;
use warden::config::Config;
use warden::config::resolve::Resolver;
use warden::control::Subscriber;
use warden::control::local::LocalFileSource;
use warden::policy::builtin::register_builtin;
use warden::policy::registry::Registry;
use warden::proc::{Engine, ExtProcService};
use warden::store::SnapshotStore;
use warden::telemetry::metrics::Metrics;
use warden::telemetry::{log, trc};

#[derive(Parser, Debug)]
#[command(name = "warden", version, about = "Out-of-process ext_proc policy engine")]
struct Args {
	/// Configuration file location.
	#[arg(long)]
	config: Option<PathBuf>,

	/// ext_proc gRPC listen address.
	#[arg(long)]
	listen: SocketAddr,

	#[arg(long, default_value = "info")]
	log_level: String,

	/// "text" or "json".
	#[arg(long, default_value = "text")]
	log_format: String,

	/// Route snapshot file; overrides routes_file from the config.
	#[arg(long)]
	routes: Option<PathBuf>,
}

fn main() -> ExitCode {
	let args = Args::parse();
	let format = match args.log_format.parse() {
		Ok(format) => format,
		Err(e) => {
			eprintln!("{e}");
			return ExitCode::FAILURE;
		},
	};
	if let Err(e) = log::setup(&args.log_level, format) {
		eprintln!("failed to initialize logging: {e:#}");
		return ExitCode::FAILURE;
	}
	match run(args) {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			error!("fatal: {e:#}");
			ExitCode::FAILURE
		},
	}
}

#[tokio::main]
async fn run(args: Args) -> anyhow::Result<()> {
	let config = match &args.config {
		Some(path) => Config::load(path)?,
		None => Config::default(),
	};

	let mut prom = prometheus_client::registry::Registry::default();
	let metrics = Arc::new(if config.metrics_enabled {
		Metrics::new(&mut prom)
	} else {
		Metrics::unregistered()
	});
	let tracer = trc::init(&config.tracing)?;

	let registry = Arc::new(Registry::new());
	register_builtin(&registry)?;
	registry.freeze();
	info!(policies = registry.len(), "policy registry frozen");

	let resolver = Arc::new(Resolver::new(config.policy_configurations.clone()));
	let programs = Arc::new(ProgramCache::new());
	let store = Arc::new(SnapshotStore::new());
	let subscriber = Subscriber::new(
		store.clone(),
		registry,
		resolver,
		programs,
		metrics.clone(),
	);
	let (snapshot_tx, snapshot_rx) = tokio::sync::mpsc::channel(4);
	tokio::spawn(subscriber.run(snapshot_rx));

	// Keep the channel open even without a local source, so an embedded
	// snapshot producer can be wired in later without the subscriber
	// winding down at startup.
	let mut _held_tx = None;
	match args.routes.clone().or_else(|| config.routes_file.clone()) {
		Some(path) => {
			info!(path = %path.display(), "loading routes from file");
			tokio::spawn(LocalFileSource::new(path).run(snapshot_tx));
		},
		None => {
			info!("no routes file configured; serving an empty snapshot");
			_held_tx = Some(snapshot_tx);
		},
	}

	let engine = Arc::new(Engine::new(
		store,
		config.policy_timeout,
		metrics,
		tracer.clone(),
	));
	info!(addr = %args.listen, "serving ext_proc");
	tonic::transport::Server::builder()
		.add_service(ExtProcService::new(engine).into_server())
		.serve_with_shutdown(args.listen, shutdown_signal())
		.await?;

	if let Some(tracer) = tracer {
		tracer.shutdown();
	}
	info!("shutdown complete");
	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = tokio::signal::ctrl_c();
	#[cfg(unix)]
	{
		let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
			.expect("installing SIGTERM handler");
		tokio::select! {
			_ = ctrl_c => {},
			_ = term.recv() => {},
		}
	}
	#[cfg(not(unix))]
	{
		let _ = ctrl_c.await;
	}
	info!("shutdown signal received");
}
