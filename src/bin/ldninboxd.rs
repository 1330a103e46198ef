// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of ldninbox.
//
// ldninbox is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// ldninbox is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with ldninbox.  If not,
// see <http://www.gnu.org/licenses/>.

//! # ldninboxd
//!
//! The ldninbox daemon: parse configuration, pick a storage backend, and serve the inbox until
//! told to stop.
//!
//! Most configuration is read from file; the few command-line options the process accepts govern
//! where to find that file & process startup that takes place before it's been parsed. They all
//! have corresponding environment variables for the sake of convenience when running in a
//! container.
//!
//! Two listening sockets: the public address carries the inbox itself, the private address
//! carries `/healthcheck` & `/metrics` (these are for the load balancer & the scraper; no
//! reason to show them to the world).
//!
//! `SIGHUP` re-reads the configuration file & rebuilds the storage connections; `SIGTERM` shuts
//! down gracefully.

use std::{
    env, io,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use axum::{
    extract::State,
    http::{HeaderName, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
};
use clap::{Arg, ArgAction, Command, crate_authors, crate_version, value_parser};
use ldninbox::{
    entities::InboxConfig, inbox::make_router as make_inbox_router, ldninbox::LdnInbox, memory,
    metrics, storage::Backend as StorageBackend,
};
use secrecy::SecretString;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use tap::Pipe;
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
    sync::Notify,
};
use tower_http::{
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, error, info};
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Error                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The binary's error type
///
/// `main` returns a `Result<(), Error>`; since the process' exit message is this type's `Debug`
/// rendition, that implementation is written by hand to delegate to `Display`.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind a listening socket: {source}"))]
    Bind { source: std::io::Error },
    #[snafu(display("Unable to read configuration file {pth:?}: {source}"))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file {pth:?}: {source}"))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Bad inbox configuration: {source}"))]
    ConfigInvalid { source: ldninbox::entities::Error },
    #[snafu(display("Couldn't resolve the present working directory: {source}"))]
    CurrentDir { source: std::io::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to setup metrics: {source}"))]
    Instruments { source: ldninbox::metrics::Error },
    #[snafu(display("Failed to connect to ScyllaDB: {source}"))]
    Scylla {
        #[snafu(source(from(ldninbox::scylla::Error, Box::new)))]
        source: Box<ldninbox::scylla::Error>,
    },
    #[snafu(display("Failed to install a signal handler: {source}"))]
    Signal { source: std::io::Error },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     command-line options                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub plain: bool,
    pub level: Level,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
            plain: matches.get_flag("plain"),
            level: match (
                matches.get_flag("debug"),
                matches.get_flag("verbose"),
                matches.get_flag("quiet"),
            ) {
                (true, _, _) => Level::TRACE,
                (false, true, _) => Level::DEBUG,
                (false, false, true) => Level::ERROR,
                (_, _, _) => Level::INFO,
            },
        }
    }
}

/// Configuration options read from the CLI (or the environment)
struct CliOpts {
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> Result<CliOpts> {
        let here = env::current_dir().context(CurrentDirSnafu)?;
        Ok(CliOpts {
            log_opts: LogOpts::new(&matches),
            cfg: matches
                .get_one::<PathBuf>("config")
                .cloned()
                .map(|p| here.join(p)),
        })
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          configuration                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Datastore credentials, as they appear in the configuration file
// Nb that we can only deserialize (i.e. not serialize) due to the presence of secrets in the
// struct.
#[derive(Clone, Debug, Deserialize)]
pub struct Credentials {
    username: SecretString,
    password: SecretString,
}

impl Credentials {
    fn to_pair(&self) -> (SecretString, SecretString) {
        (self.username.clone(), self.password.clone())
    }
}

/// ldninbox datastore configuration
///
/// The inbox writes to a generic API; at startup, a particular *implementation* of that API is
/// chosen, according to configuration. This configuration.
#[derive(Clone, Debug, Deserialize)]
pub enum StorageConfig {
    /// Keep notifications in process memory-- tests & throwaway deployments only
    Memory,
    /// Use ScyllaDB/CQL interface
    Scylla {
        /// ScyllaDB credentials, if authentication is to be used
        credentials: Option<Credentials>,
        /// ScyllaDB hosts; specify as "host:port" (or anything that can be parsed as a
        /// [SocketAddr])
        hosts: Vec<SocketAddr>,
    },
    /// Use DynamoDB, or ScyllaDB over the Alternator interface
    Dynamo {
        /// AWS credentials: key ID & secret key; you'll pretty-much always need to specify
        /// these when running against DDB proper
        credentials: Option<Credentials>,
        /// An AWS region if you're truly talking to DynamoDB, or an endpoint URL
        /// (dynamodb-local, say)
        location: ldninbox::dynamodb::Location,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        // The one backend that needs no provisioning; anything durable must be asked for by
        // name.
        StorageConfig::Memory
    }
}

/// ldninbox configuration, version one
#[derive(Clone, Debug, Deserialize)]
struct ConfigV1 {
    /// Local address at which to listen for public requests; specify as "address:port". This is
    /// the address to which ldninboxd will bind a listening socket for the inbox itself.
    #[serde(rename = "public-address")]
    public_address: SocketAddr,
    /// Address at which to listen for private requests (healthcheck & metrics); specify as
    /// "address:port"
    #[serde(rename = "private-address")]
    private_address: SocketAddr,
    /// The inbox proper: base URL, inbox path, size limit, accepted media types
    inbox: InboxConfig,
    #[serde(rename = "storage-config", default)]
    storage_config: StorageConfig,
    /// Per-query time limit on storage backends, in milliseconds
    #[serde(
        rename = "storage-timeout-ms",
        default = "ConfigV1::default_storage_timeout_ms"
    )]
    storage_timeout_ms: u64,
}

impl ConfigV1 {
    fn default_storage_timeout_ms() -> u64 {
        5000
    }
    fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            public_address: "0.0.0.0:20687".parse::<SocketAddr>().unwrap(/* known good */),
            private_address: "127.0.0.1:20688".parse::<SocketAddr>().unwrap(/* known good */),
            inbox: InboxConfig::default(),
            storage_config: StorageConfig::default(),
            storage_timeout_ms: ConfigV1::default_storage_timeout_ms(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the ldninbox configuration file
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    use snafu::IntoError;
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from_str("/etc/ldninbox.toml").unwrap(), true),
        |p| (p.clone(), false),
    );
    let cfg = match std::fs::read_to_string(&pth) {
        Ok(text) => match toml::from_str::<Configuration>(&text) {
            Ok(Configuration::V1(cfg)) => cfg,
            Err(err) => return Err(ConfigParseSnafu { pth }.into_error(err)),
        },
        Err(err) => {
            if defaulted {
                ConfigV1::default()
            } else {
                return Err(ConfigNotFoundSnafu { pth }.into_error(err));
            }
        }
    };
    // An inbox path the router can't accept would otherwise panic at bind time:
    cfg.inbox.validate().context(ConfigInvalidSnafu)?;
    Ok(cfg)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            logging                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Produce the "formatter" & "filter" layers for logging
///
/// Structured (JSON) logging by default, human-readable with `--plain`; either way, to stdout
/// (the process stays in the foreground & leaves log routing to its supervisor).
#[allow(clippy::type_complexity)]
fn configure_logging(
    logopts: &LogOpts,
) -> Result<(Box<dyn Layer<Registry> + Send + Sync>, EnvFilter)> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `compact()` & `json()` produce layers *of different types*; it is for this reason that
    // `Box<dyn Layer<S> + Send + Sync>` implements `Layer`:
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if logopts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(io::stdout),
        )
    };

    Ok((formatter, filter))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       private endpoints                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn healthcheck() -> &'static str {
    "GOOD"
}

async fn metrics(State(state): State<Arc<LdnInbox>>) -> axum::response::Response {
    match metrics::render(&state.registry) {
        Ok(text) => text.into_response(),
        Err(err) => {
            error!("{:?}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            routers                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Generate request IDs as a monotonically increasing sequence; trivially unique per-process,
/// human-readable, and a useful gauge of how long the server's been up.
#[derive(Clone, Debug, Default)]
struct RequestIdGenerator {
    counter: Arc<AtomicU64>,
}

impl MakeRequestId for RequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &axum::extract::Request<B>) -> Option<RequestId> {
        self.counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
            .pipe(|s| RequestId::new(HeaderValue::from_str(&s).unwrap(/* known good */)))
            .pipe(Some)
    }
}

/// Make the [Router](axum::Router) that will be accessible to the world
///
/// We want incoming requests to hit the `SetRequestIdLayer` *first*, so it has to be the
/// last/outer layer applied.
fn make_world_router(state: Arc<LdnInbox>) -> axum::Router {
    make_inbox_router(state)
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            RequestIdGenerator::default(),
        ))
}

/// Make the [Router](axum::Router) that will only be locally accessible
fn make_local_router(state: Arc<LdnInbox>) -> axum::Router {
    axum::Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            serving                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub async fn select_storage(
    config: &StorageConfig,
    timeout: Duration,
) -> Result<Box<dyn StorageBackend + Send + Sync>> {
    match config {
        StorageConfig::Memory => Ok(Box::new(memory::Memory::new())),
        StorageConfig::Scylla { credentials, hosts } => {
            let credentials = credentials.as_ref().map(Credentials::to_pair);
            Ok(Box::new(
                ldninbox::scylla::Session::new(
                    hosts.iter().map(|host| host.to_string()),
                    &credentials,
                    timeout,
                )
                .await
                .context(ScyllaSnafu)?,
            ))
        }
        StorageConfig::Dynamo {
            credentials,
            location,
        } => {
            let credentials = credentials.as_ref().map(Credentials::to_pair);
            Ok(Box::new(
                ldninbox::dynamodb::Client::new(location, &credentials, timeout).await,
            ))
        }
    }
}

/// Serve ldninbox requests
#[tracing::instrument(skip(opts, cfg))]
async fn serve(opts: CliOpts, mut cfg: ConfigV1) -> Result<()> {
    // Produce a future which can be used to signal graceful shutdown, below.
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    fn log_on_err<T, E>(x: StdResult<T, E>)
    where
        E: std::error::Error + std::fmt::Debug,
    {
        if let Err(err) = x {
            error!("{:?}", err);
        }
    }

    let mut sighup = signal(SignalKind::hangup()).context(SignalSnafu)?;
    let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;

    // Loop forever, handling SIGHUPs, until asked to terminate:
    loop {
        // Re-build our database connections each pass, in case configuration values have
        // changed:
        let storage = select_storage(&cfg.storage_config, cfg.storage_timeout()).await?;
        let state =
            Arc::new(LdnInbox::new(cfg.inbox.clone(), storage).context(InstrumentsSnafu)?);

        let world_nfy = Arc::new(Notify::new());
        let local_nfy = Arc::new(Notify::new());

        let world_server = axum::serve(
            TcpListener::bind(&cfg.public_address)
                .await
                .context(BindSnafu)?,
            make_world_router(state.clone()),
        )
        .with_graceful_shutdown(shutdown_signal(world_nfy.clone()));

        let local_server = axum::serve(
            TcpListener::bind(&cfg.private_address)
                .await
                .context(BindSnafu)?,
            make_local_router(state.clone()),
        )
        .with_graceful_shutdown(shutdown_signal(local_nfy.clone()));

        info!(
            "Serving the inbox at {} (private endpoints at {}).",
            cfg.public_address, cfg.private_address
        );

        use std::future::IntoFuture;
        let mut world_server = world_server.into_future();
        let mut local_server = local_server.into_future();

        tokio::select! {
            // Intentionally not handling these-- the servers *should* never shutdown on their
            // own. That said, if I don't move `world_server` into a Future, it never gets
            // polled.
            _ = &mut world_server => unimplemented!(),
            _ = &mut local_server => unimplemented!(),
            _ = sighup.recv() => {
                info!("Received SIGHUP; closing DB connections to re-read configuration.");
                world_nfy.notify_one();
                local_nfy.notify_one();
                log_on_err(world_server.await);
                log_on_err(local_server.await);
                // Fall back to the last known-good configuration on failure & keep going:
                cfg = match parse_config(&opts.cfg) {
                    Ok(cfg) => cfg,
                    Err(err) => {
                        error!("Re-reading configuration failed ({err}); keeping the old one.");
                        cfg
                    }
                };
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                world_nfy.notify_one();
                local_nfy.notify_one();
                log_on_err(world_server.await);
                log_on_err(local_server.await);
                return Ok(());
            }
        }
    }
}

async fn go_async(opts: CliOpts, bootstrap_logging_guard: tracing::dispatcher::DefaultGuard) -> Result<()> {
    // Read & parse config, create our logging formatter & filter. Failure to parse at this
    // point is fatal; below, in `serve()`, we fall back to the last "known-good" configuration
    // & keep going.
    fn go_async1(
        opts: &CliOpts,
    ) -> Result<(ConfigV1, Box<dyn Layer<Registry> + Send + Sync>, EnvFilter)> {
        let cfg = parse_config(&opts.cfg)?;
        let (formatter, filter) = configure_logging(&opts.log_opts)?;
        Ok((cfg, formatter, filter))
    }

    match go_async1(&opts) {
        Ok((cfg, formatter, filter)) => {
            // Setup the global logger. Nb. this can only be invoked once (will panic on a
            // second invocation)!
            tracing::subscriber::set_global_default(
                Registry::default().with(formatter).with(filter),
            )
            .context(SubscriberSnafu)?;
            // Drop the guard, cleaning-up the bootstrap logger
            drop(bootstrap_logging_guard);

            info!("ldninbox version {} starting.", crate_version!());

            serve(opts, cfg).await
        }
        Err(err) => {
            error!("While configuring logging: {err:?}");
            Err(err)
        }
    }
}

fn main() -> Result<()> {
    let opts = CliOpts::new(
        Command::new("ldninboxd")
            .version(crate_version!())
            .author(crate_authors!())
            .about("A Linked Data Notifications inbox")
            .long_about(
                "`ldninbox` receives Activity Streams/JSON-LD notifications over HTTP, persists \
                 them, and re-exposes them as an LDP container.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("LDNINBOX_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                         configuration file",
                    ),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("LDNINBOX_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("LDNINBOX_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("LDNINBOX_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("LDNINBOX_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    )?;

    // There are a number of things that can go wrong before we've parsed our configuration file
    // and configured logging for the process; setup a *temporary* logger via `set_default()` so
    // they land somewhere.
    let bootstrap_subscriber = tracing_subscriber::registry::Registry::default()
        .with(tracing_subscriber::fmt::Layer::default().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(opts.log_opts.level.into())
                .from_env()
                .context(EnvFilterSnafu)?,
        );
    let bootstrap_logging_guard = tracing::subscriber::set_default(bootstrap_subscriber);
    debug!("Temporarily logging to stderr while initializing.");

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(opts, bootstrap_logging_guard)) // and start our server!
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn config_parses() {
        let text = r#"
version = "1"
public-address = "0.0.0.0:20687"
private-address = "127.0.0.1:20688"
storage-timeout-ms = 2500

[inbox]
base-url = "https://example.com"
inbox-path = "/inbox/"

[storage-config.Scylla]
credentials = { username = "scylla", password = "scylla" }
hosts = ["127.0.0.1:9042"]
"#;
        let cfg = match toml::from_str::<Configuration>(text).unwrap() {
            Configuration::V1(cfg) => cfg,
        };
        assert_eq!("0.0.0.0:20687".parse::<SocketAddr>().unwrap(), cfg.public_address);
        assert_eq!(Duration::from_millis(2500), cfg.storage_timeout());
        assert_eq!("https://example.com/inbox/", cfg.inbox.container_url());
        assert!(matches!(cfg.storage_config, StorageConfig::Scylla { .. }));
    }

    #[test]
    fn config_defaults() {
        let cfg = match toml::from_str::<Configuration>(
            r#"
version = "1"
public-address = "0.0.0.0:80"
private-address = "127.0.0.1:81"

[inbox]
base-url = "http://localhost"
"#,
        )
        .unwrap()
        {
            Configuration::V1(cfg) => cfg,
        };
        assert!(matches!(cfg.storage_config, StorageConfig::Memory));
        assert_eq!(Duration::from_millis(5000), cfg.storage_timeout());
        assert_eq!(100 * 1024, cfg.inbox.max_notification_size);
    }

    #[test]
    fn config_with_unroutable_inbox_path_is_refused() {
        // Such a path would panic deep in the router; it has to come back as a configuration
        // error instead.
        let pth = std::env::temp_dir().join("ldninboxd-bad-inbox-path.toml");
        std::fs::write(
            &pth,
            r#"
version = "1"
public-address = "0.0.0.0:80"
private-address = "127.0.0.1:81"

[inbox]
base-url = "http://localhost"
inbox-path = "inbox/"
"#,
        )
        .unwrap();
        let result = parse_config(&Some(pth.clone()));
        std::fs::remove_file(&pth).unwrap();
        assert!(matches!(result, Err(Error::ConfigInvalid { .. })));
    }
}
