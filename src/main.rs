mod blacklist;
mod cache;
mod config;
mod database;
mod error;
mod fetch;
mod http_range;
mod humanfmt;
mod log_once;
mod logstore;
mod mirrors;
mod proxy;
mod ringbuffer;
mod stats;
mod task_cache_scan;
mod task_cleanup;
mod task_setup;
mod web_interface;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use bytes::Bytes;
use clap::Parser;
use http_body_util::{BodyExt as _, Empty, Full, combinators::BoxBody};
use hyper::header::{HeaderValue, SERVER};
use hyper::service::service_fn;
use hyper::{Response, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::graceful::GracefulShutdown;
use log::{LevelFilter, debug, error, info, warn};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, TermLogger, TerminalMode, WriteLogger,
};
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tokio::signal::unix::SignalKind;

use crate::blacklist::Blacklist;
use crate::cache::CacheStore;
use crate::config::{Config, DEFAULT_LOGSTORE_CAPACITY, SharedConfig};
use crate::database::Database;
use crate::error::ProxyCacheError;
use crate::logstore::LogStore;
use crate::mirrors::MirrorRegistry;
use crate::stats::{FileStats, Stats};
use crate::task_cache_scan::task_cache_scan;
use crate::task_cleanup::task_cleanup;
use crate::task_setup::task_setup;

pub(crate) type HttpClient = hyper_util::client::legacy::Client<
    hyper_timeout::TimeoutConnector<HttpsConnector<HttpConnector>>,
    BoxBody<Bytes, ProxyCacheError>,
>;

pub(crate) type ProxyBody = BoxBody<Bytes, ProxyCacheError>;

pub(crate) const APP_NAME: &str = env!("CARGO_PKG_NAME");

/// Per-operation socket timeouts of the upstream client. The end-to-end
/// budgets live in the fetch engine.
const HTTP_IO_TIMEOUT: Duration = Duration::from_secs(10);

const STATS_SAVE_PERIOD: Duration = Duration::from_secs(60);
const FILE_STATS_PERIOD: Duration = Duration::from_secs(5 * 60);
const CLEANUP_PERIOD: Duration = Duration::from_secs(60 * 60);
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Shared handles of all long-lived components. Cloned per connection;
/// every field is an `Arc`-backed handle.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) config: SharedConfig,
    pub(crate) database: Database,
    pub(crate) client: HttpClient,
    pub(crate) cache: CacheStore,
    pub(crate) mirrors: MirrorRegistry,
    pub(crate) blacklist: Blacklist,
    pub(crate) stats: Stats,
    pub(crate) file_stats: FileStats,
    pub(crate) logstore: LogStore,
    pub(crate) start_time: Instant,
}

#[must_use]
pub(crate) fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

#[must_use]
pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

#[must_use]
pub(crate) fn quick_response<T: Into<Bytes>>(
    status: StatusCode,
    message: T,
) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(SERVER, HeaderValue::from_static(APP_NAME))
        .body(full(message))
        .expect("Response is valid")
}

#[must_use]
fn build_http_client() -> HttpClient {
    let https_connector = HttpsConnector::new();

    let mut timeout_connector = hyper_timeout::TimeoutConnector::new(https_connector);
    timeout_connector.set_connect_timeout(Some(HTTP_IO_TIMEOUT));
    timeout_connector.set_read_timeout(Some(HTTP_IO_TIMEOUT));
    timeout_connector.set_write_timeout(Some(HTTP_IO_TIMEOUT));

    hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(timeout_connector)
}

#[must_use]
fn is_iokind(err: &hyper::Error, kind: std::io::ErrorKind) -> bool {
    if let Some(source) = std::error::Error::source(&err) {
        if let Some(ioerr) = source.downcast_ref::<std::io::Error>() {
            if ioerr.kind() == kind {
                return true;
            }
        }
    }

    false
}

fn log_connection_error(client: std::net::SocketAddr, err: &hyper::Error) {
    let client = client.ip().to_canonical();

    if err.is_incomplete_message() || is_iokind(err, std::io::ErrorKind::ConnectionReset) {
        info!("Connection to client {client} cancelled");
    } else if is_iokind(err, std::io::ErrorKind::NotConnected) {
        info!("Improper connection shutdown for client {client}:  {err}");
    } else if is_iokind(err, std::io::ErrorKind::BrokenPipe) {
        info!("Broken pipe for client {client}:  {err}");
    } else {
        error!("Error serving connection for client {client}:  {err}");
    }
}

async fn flush_stats(state: &AppState) {
    if let Err(err) = state.database.save_stats(&state.stats.snapshot()).await {
        error!("Failed to save stats:  {err}");
    }
}

async fn run(config: Config, logstore: LogStore) -> anyhow::Result<()> {
    let database = Database::connect(&config.database_file)
        .await
        .context("Failed to open database")?;
    database
        .init_tables()
        .await
        .context("Failed to initialize database")?;

    let stats = Stats::new();
    match database.load_stats().await {
        Ok(snapshot) => stats.restore(&snapshot),
        Err(err) => warn!("Failed to load stats from database:  {err}"),
    }

    let shared_config = SharedConfig::new(config);

    let state = AppState {
        cache: CacheStore::new(shared_config.clone()),
        config: shared_config,
        database,
        client: build_http_client(),
        mirrors: MirrorRegistry::new(),
        blacklist: Blacklist::new(),
        stats,
        file_stats: FileStats::new(),
        logstore,
        start_time: Instant::now(),
    };

    if let Err(err) = state.mirrors.load_from_db(&state.database).await {
        warn!("Failed to load mirrors from database:  {err}");
    }
    if let Err(err) = state.blacklist.load_from_db(&state.database).await {
        warn!("Failed to load blacklist from database:  {err}");
    }

    {
        let scan_state = state.clone();
        tokio::task::spawn(async move {
            info!("Starting initial file stats scan...");
            task_cache_scan(&scan_state).await;
        });
    }

    main_loop(state).await
}

async fn main_loop(state: AppState) -> anyhow::Result<()> {
    let (host, port) = {
        let config = state.config.current();
        (config.host.clone(), config.port)
    };

    let listener = TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("Failed to bind on {host}:{port}"))?;
    info!("Listening on http://{host}:{port}");

    let graceful = GracefulShutdown::new();
    let mut term_signal = tokio::signal::unix::signal(SignalKind::terminate())?;

    let now = tokio::time::Instant::now();
    let mut stats_interval = tokio::time::interval_at(now + STATS_SAVE_PERIOD, STATS_SAVE_PERIOD);
    let mut scan_interval = tokio::time::interval_at(now + FILE_STATS_PERIOD, FILE_STATS_PERIOD);
    let mut cleanup_interval = tokio::time::interval_at(now + CLEANUP_PERIOD, CLEANUP_PERIOD);

    loop {
        let accepted = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, stopping...");
                break;
            }
            _ = term_signal.recv() => {
                info!("SIGTERM received, stopping...");
                break;
            }
            _ = stats_interval.tick() => {
                let stats_state = state.clone();
                tokio::task::spawn(async move { flush_stats(&stats_state).await });
                continue;
            }
            _ = scan_interval.tick() => {
                let scan_state = state.clone();
                tokio::task::spawn(async move { task_cache_scan(&scan_state).await });
                continue;
            }
            _ = cleanup_interval.tick() => {
                info!("Running cache cleanup...");
                let cleanup_state = state.clone();
                tokio::task::spawn(async move { task_cleanup(&cleanup_state).await });
                continue;
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, client) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                error!("Error accepting connection:  {err}");
                continue;
            }
        };

        debug!("New client connection from {}", client.ip().to_canonical());

        let conn_state = state.clone();
        let service = service_fn(move |req| {
            let state = conn_state.clone();
            async move { Ok::<_, ProxyCacheError>(proxy::handle_request(client, req, state).await) }
        });

        let builder =
            hyper_util::server::conn::auto::Builder::new(TokioExecutor::new()).http1_only();
        let conn = builder
            .serve_connection_with_upgrades(TokioIo::new(stream), service)
            .into_owned();
        let watched = graceful.watch(conn);

        tokio::task::spawn(async move {
            if let Err(err) = watched.await {
                match err.downcast::<hyper::Error>() {
                    Ok(err) => log_connection_error(client, &err),
                    Err(err) => {
                        error!(
                            "Error serving connection for client {}:  {err}",
                            client.ip().to_canonical()
                        );
                    }
                }
            }
        });
    }

    info!("Shutting down server...");

    tokio::select! {
        () = graceful.shutdown() => debug!("All connections closed"),
        () = tokio::time::sleep(SHUTDOWN_DEADLINE) => {
            warn!("Shutdown deadline reached, dropping open connections");
        }
    }

    flush_stats(&state).await;

    Ok(())
}

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Logging level
    #[arg(short, long, value_name = "SEVERITY")]
    log_level: Option<LevelFilter>,
    /// Configuration file path
    #[arg(
        short = 'c',
        long,
        default_value = config::DEFAULT_CONFIGURATION_PATH,
        value_name = "PATH"
    )]
    config_path: PathBuf,
    /// Skip timestamp in log messages
    #[arg(long, default_value = "false")]
    skip_log_timestamp: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let (config, config_fallback) = Config::load(&args.config_path)?;

    let logstore = LogStore::new(DEFAULT_LOGSTORE_CAPACITY);

    let terminal_log_config = if args.skip_log_timestamp {
        ConfigBuilder::new()
            .set_time_level(LevelFilter::Off)
            .build()
    } else {
        simplelog::Config::default()
    };

    let store_log_config = ConfigBuilder::new()
        .set_target_level(LevelFilter::Off)
        .set_time_format_rfc2822()
        .build();

    CombinedLogger::init(vec![
        TermLogger::new(
            args.log_level.unwrap_or(config.log_level),
            terminal_log_config,
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Info, store_log_config, logstore.clone()),
    ])?;

    if config_fallback {
        info!(
            "Configuration file {} not found, using defaults",
            args.config_path.display()
        );
    }

    debug!("Configuration: {config:?}");

    info!("Using cache directory `{}`", config.storage_root.display());

    task_setup(&config).map_err(|err| {
        error!("Error during setup:  {err}");
        err
    })?;

    scopeguard::defer! {
        info!("Stopped.");
    }

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name("pkg-cacher-w")
        .build()
        .expect("runtime construction should succeed");

    runtime.block_on(run(config, logstore))
}
