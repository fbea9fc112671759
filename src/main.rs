//! webmux - a terminal in the browser
//!
//! Serves one PTY-backed command per WebSocket connection, optionally
//! steering a tmux or psmux session so the browser can render and drive
//! its windows and panes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser as ClapParser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webmux::{
    api::{self, ratelimit::RateLimiter},
    config::{self, Config, ConfigError, MuxConfig},
    mux::MuxKind,
};

/// webmux - share a terminal or a tmux session over the web
#[derive(ClapParser, Debug)]
#[command(name = "webmux", version, about, long_about = None)]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/webmux/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind the HTTP/WebSocket server
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Basic-auth credential as user:pass
    #[arg(long, env = "WEBMUX_CREDENTIAL")]
    credential: Option<String>,

    /// Allow clients to type into the terminal
    #[arg(short = 'w', long)]
    permit_write: bool,

    /// Append `arg=` values sent by the client to the command line
    #[arg(long)]
    permit_arguments: bool,

    /// Export request headers to the command as HTTP_* variables
    #[arg(long)]
    pass_headers: bool,

    /// Reconnect hint sent to clients, in seconds
    #[arg(long)]
    reconnect: Option<u64>,

    /// Maximum concurrent sessions (0 = unlimited)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Attach a multiplexer controller to every session
    #[arg(long, value_enum)]
    mux: Option<MuxKind>,

    /// Multiplexer session to drive
    #[arg(long, requires = "mux")]
    mux_session: Option<String>,

    /// Command to run, followed by its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Cli {
    /// Flags given on the command line win over the config file.
    fn apply(self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if self.credential.is_some() {
            config.credential = self.credential;
        }
        config.permit_write |= self.permit_write;
        config.permit_arguments |= self.permit_arguments;
        config.pass_headers |= self.pass_headers;
        if self.reconnect.is_some() {
            config.reconnect = self.reconnect;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(kind) = self.mux {
            let mux = config.mux.get_or_insert_with(MuxConfig::default);
            mux.kind = kind;
            if let Some(session) = self.mux_session {
                mux.session = session;
            }
        }
        let mut command = self.command.into_iter();
        if let Some(program) = command.next() {
            config.command = program;
            config.args = command.collect();
        }
    }
}

#[derive(Error, Debug)]
pub enum WebmuxError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("config file {} does not exist", .0.display())]
    MissingConfig(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

fn load_config(cli: Cli) -> Result<Config, WebmuxError> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?.ok_or_else(|| WebmuxError::MissingConfig(path.clone()))?,
        None => match config::default_path() {
            Some(path) => Config::load(&path)?.unwrap_or_default(),
            None => Config::default(),
        },
    };
    cli.apply(&mut config);
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), WebmuxError> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(cli)?;
    run_server(config).await
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "webmux=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_server(config: Config) -> Result<(), WebmuxError> {
    tracing::info!("webmux starting");

    let bind = config.bind;
    match &config.credential {
        Some(_) => tracing::info!("basic authentication enabled"),
        None if !bind.ip().is_loopback() => {
            tracing::warn!(addr = %bind, "listening on a non-loopback address without a credential")
        }
        None => {}
    }
    if config.permit_write {
        tracing::info!("clients may write to the terminal");
    }
    if let Some(mux) = &config.mux {
        tracing::info!(kind = %mux.kind, session = %mux.session, "multiplexer control enabled");
    }

    let shutdown = CancellationToken::new();
    let limiter = Arc::new(RateLimiter::new());
    let cleanup = limiter.clone().spawn_cleanup(shutdown.clone());

    let app = api::router(api::AppState::new(config, limiter, shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "HTTP/WS server listening");

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("received Ctrl+C"),
            Err(e) => tracing::error!(?e, "failed to listen for Ctrl+C"),
        }
        // Sessions hold child tokens and close their terminals.
        signal.cancel();
    });

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned())
    .await?;

    cleanup.await?;
    tracing::info!("webmux exiting");
    Ok(())
}
