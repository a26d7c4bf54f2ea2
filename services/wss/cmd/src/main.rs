//! wss binary.
//!
//! `wss serve` runs an authenticating WebSocket server that periodically
//! broadcasts to its clients; `wss connect` runs a reconnecting client that
//! prints what it receives.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wss_session::{AuthContext, Listener, ReconnectingSession, Server, WsListener, WsTransport};
use wss_wire::Frame;

mod config;
mod logging;

use config::WssConfig;
use logging::WssLogFormatter;

/// Authenticated, auto-reconnecting WebSocket server and client
#[derive(Parser, Debug)]
#[command(name = "wss", version, about = "Authenticated WebSocket server and client")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "wss.yaml")]
    config: PathBuf,

    /// Use `wss://` when connecting
    #[arg(long)]
    ssl: bool,

    /// Authenticate peers with the key and registry files
    #[arg(long)]
    auth: bool,

    /// Private exponent file
    #[arg(long)]
    private_key_file: Option<PathBuf>,

    /// Trust registry file
    #[arg(long)]
    registry_file: Option<PathBuf>,

    /// Withhold payloads from peers that have not authenticated
    #[arg(long)]
    gate_dispatch: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections and broadcast to authenticated clients
    Serve {
        /// Listen port (defaults to the configured port)
        #[arg(long)]
        port: Option<u16>,

        /// Coalesce broadcasts, delivering only the latest each interval
        #[arg(long)]
        throttle: bool,

        /// Throttled delivery period, e.g. 100ms
        #[arg(long)]
        broadcast_interval: Option<humantime::Duration>,

        /// Period of the `{"hello": "world"}` broadcast
        #[arg(long, default_value = "30s")]
        announce_every: humantime::Duration,
    },
    /// Connect to a server and print what it sends
    Connect {
        /// Server host
        #[arg(default_value = "localhost")]
        address: String,

        /// Server port (defaults to the configured port)
        port: Option<u16>,

        /// Give up instead of reconnecting after a failure or close
        #[arg(long)]
        no_retry: bool,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("wss={}", args.log_level).parse()?)
        .add_directive(format!("wss_session={}", args.log_level).parse()?)
        .add_directive(format!("wss_auth={}", args.log_level).parse()?)
        .add_directive(format!("wss_wire={}", args.log_level).parse()?);

    let formatter = WssLogFormatter::new("wss");

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .event_format(formatter)
        .init();

    info!("Starting wss v{}", env!("CARGO_PKG_VERSION"));

    let mut config = WssConfig::load_from_file(&args.config)?;
    if args.ssl {
        config.use_ssl = true;
    }
    if args.auth {
        config.auth = true;
    }
    if let Some(path) = args.private_key_file {
        config.private_key_file = path;
    }
    if let Some(path) = args.registry_file {
        config.registry_file = path;
    }
    if args.gate_dispatch {
        config.gate_dispatch = true;
    }

    match args.command {
        Command::Serve {
            port,
            throttle,
            broadcast_interval,
            announce_every,
        } => {
            if let Some(port) = port {
                config.port = port;
            }
            if throttle {
                config.broadcast_throttled = true;
            }
            if let Some(interval) = broadcast_interval {
                config.broadcast_interval = interval.into();
            }
            serve(config, announce_every.into()).await
        }
        Command::Connect {
            address,
            port,
            no_retry,
        } => {
            if no_retry {
                config.retry = false;
            }
            let port = port.unwrap_or(config.port);
            connect(config, &address, port).await
        }
    }
}

fn load_auth(config: &WssConfig) -> anyhow::Result<Option<AuthContext>> {
    if !config.auth {
        return Ok(None);
    }
    let auth_config = config.auth_config();
    let context = AuthContext::load(&auth_config).with_context(|| {
        format!(
            "Failed to load authentication material ({:?}, {:?})",
            auth_config.private_key_file, auth_config.registry_file
        )
    })?;
    Ok(Some(context))
}

async fn serve(config: WssConfig, announce_every: Duration) -> anyhow::Result<()> {
    if config.use_ssl {
        anyhow::bail!("The server does not terminate TLS; put it behind a TLS proxy and run without --ssl");
    }

    let auth = load_auth(&config)?;
    let server_config = config.server_config();
    info!(
        "Server config: throttled={}, interval={:?}, gate_broadcast={}, gate_dispatch={}",
        server_config.broadcast_throttled,
        server_config.broadcast_interval,
        server_config.gate_broadcast,
        server_config.gate_dispatch
    );
    let server = Arc::new(Server::new(server_config, auth));

    server.set_open_handler(|id| info!("Client {} connected", id));
    server.set_authenticated_handler(|id| info!("Client {} authenticated", id));
    server.set_text_handler(|id, text| info!("Client {} says: {}", id, text));
    server.set_binary_handler(|id, data| info!("Client {} sent {} bytes", id, data.len()));
    server.set_close_handler(|id| info!("Client {} disconnected", id));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = WsListener::bind(addr)
        .await
        .with_context(|| format!("Failed to listen on {}", addr))?;
    info!("Listening on {}", listener.local_addr());

    let announcer = {
        let server = server.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(announce_every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !server.has_clients().await {
                    continue;
                }
                let report = server.broadcast(Frame::text(r#"{"hello": "world"}"#)).await;
                if !report.failed.is_empty() {
                    warn!("Broadcast failed for {} sessions", report.failed.len());
                }
            }
        })
    };

    let result = tokio::select! {
        result = server.clone().serve(listener) => result.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };
    announcer.abort();
    result
}

async fn connect(config: WssConfig, host: &str, port: u16) -> anyhow::Result<()> {
    let auth = load_auth(&config)?;
    let client_config = config.client_config(host, port);
    info!("Connecting to {} (retry={})", client_config.address, client_config.retry);

    let session = Arc::new(ReconnectingSession::new(
        client_config,
        Arc::new(WsTransport::new()),
        auth,
    ));

    let weak = Arc::downgrade(&session);
    session.set_open_handler(move || {
        info!("connected");
        if let Some(session) = weak.upgrade() {
            if let Err(e) = session.send_text(r#"{"foo": "bar"}"#) {
                warn!("Failed to send greeting: {}", e);
            }
        }
    });
    session.set_text_handler(|text| println!("{}", text));
    session.set_binary_handler(|data| println!("<{} bytes>", data.len()));
    session.set_close_handler(|info| info!("Connection closed: {}", info));

    let mut task = session.spawn();
    tokio::select! {
        joined = &mut task => {
            return match joined {
                Ok(result) => result.map_err(anyhow::Error::from),
                Err(e) => Err(anyhow::anyhow!("Client task failed: {}", e)),
            };
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    session.shutdown();
    match task.await {
        Ok(Err(e)) => error!("Client stopped with error: {}", e),
        Err(e) => error!("Client task failed: {}", e),
        Ok(Ok(())) => {}
    }
    Ok(())
}
