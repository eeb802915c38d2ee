//! NBD server binary: CLI parsing, config loading, logger wiring, and
//! graceful shutdown around the core NBD-over-S3 engine (§6 "boundary
//! glue", out of core scope per spec.md §1).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_smithy_types::timeout::TimeoutConfig;
use clap::Parser;
use env_logger::Env;
use tokio::sync::watch;

use nbd_object_store::config::{Config, ConfigError};
use nbd_object_store::lease::LeaseManager;
use nbd_object_store::nbd::session::SessionContext;
use nbd_object_store::object_client::S3ObjectClient;
use nbd_object_store::server::Listener;

#[derive(Parser, Debug)]
#[command(name = "nbd-object-server")]
#[command(about = "NBD server backed by an S3-compatible object store")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override `host` from the config file.
    #[arg(long)]
    host: Option<String>,

    /// Override `port` from the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Override `s3_bucket` from the config file.
    #[arg(long)]
    bucket: Option<String>,
}

const CONFIG_ERROR: u8 = 1;
const LISTEN_FAILURE: u8 = 2;
const S3_STARTUP_FAILURE: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(CONFIG_ERROR);
        }
    };

    env_logger::Builder::from_env(Env::default().default_filter_or(&config.log_level)).init();

    log::info!(
        "starting nbd-object-server: bind={} bucket={} export_size_bytes={} lease_ttl_seconds={} heartbeat_interval_seconds={} flush_parallelism={}",
        config.bind_addr(),
        config.s3_bucket,
        config.export_size_bytes,
        config.lease_ttl_seconds,
        config.heartbeat_interval_seconds,
        config.flush_parallelism,
    );

    let object_client = match build_object_client(&config).await {
        Ok(c) => c,
        Err(e) => {
            log::error!("failed to initialize S3 client: {e}");
            return ExitCode::from(S3_STARTUP_FAILURE);
        }
    };

    let lease_manager = Arc::new(LeaseManager::new(
        Arc::clone(&object_client),
        Duration::from_secs(config.lease_ttl_seconds),
        Duration::from_secs(config.heartbeat_interval_seconds),
    ));

    let ctx = Arc::new(SessionContext {
        object_client,
        lease_manager,
        export_size_bytes: config.export_size_bytes,
        flush_parallelism: config.flush_parallelism,
    });

    let listener = match Listener::bind(&config.bind_addr(), ctx).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("failed to bind {}: {e}", config.bind_addr());
            return ExitCode::from(LISTEN_FAILURE);
        }
    };
    log::info!("listening on {}", listener.local_addr().unwrap());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener_task = tokio::spawn(listener.run(shutdown_rx));

    wait_for_shutdown_signal().await;
    log::info!("shutdown requested, draining sessions");
    let _ = shutdown_tx.send(true);

    if let Err(e) = listener_task.await {
        log::error!("listener task panicked: {e}");
    }

    log::info!("clean shutdown");
    ExitCode::SUCCESS
}

fn load_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            let path = std::env::var("NBD_OBJECT_SERVER_CONFIG")
                .unwrap_or_else(|_| "nbd-object-server.toml".to_string());
            Config::load(&path)?
        }
    };

    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bucket) = &args.bucket {
        config.s3_bucket = bucket.clone();
    }
    Ok(config)
}

async fn build_object_client(config: &Config) -> anyhow::Result<Arc<S3ObjectClient>> {
    let credentials = Credentials::new(
        &config.s3_access_key,
        &config.s3_secret_key,
        None,
        None,
        "nbd-object-server-static",
    );

    // Per-call budget from spec.md §4.2: 5s connect, 60s read.
    let timeout_config = TimeoutConfig::builder()
        .connect_timeout(Duration::from_secs(5))
        .read_timeout(Duration::from_secs(60))
        .build();

    let shared_config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.s3_region.clone()))
        .endpoint_url(&config.s3_endpoint)
        .credentials_provider(credentials)
        .timeout_config(timeout_config)
        .load()
        .await;

    let s3_config = aws_sdk_s3::config::Builder::from(&shared_config)
        .force_path_style(true)
        .build();

    let client = aws_sdk_s3::Client::from_conf(s3_config);
    Ok(Arc::new(S3ObjectClient::new(client, config.s3_bucket.clone())))
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
