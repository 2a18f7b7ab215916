mod auth;
mod config;
mod coordinator;
mod presence;
mod registry;
mod tls;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use talkwire_protocol::TalkwireConfig;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::coordinator::Coordinator;
use crate::presence::PresenceDirectory;
use crate::registry::CallRegistry;
use crate::ws::AppState;

struct Args {
    config_path: PathBuf,
    port_override: Option<u16>,
    /// Print a signed token for this user id and exit.
    issue_token: Option<String>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        config_path: PathBuf::from("./config/talkwire.toml"),
        port_override: None,
        issue_token: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    parsed.port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            "--issue-token" => {
                if i + 1 < args.len() {
                    parsed.issue_token = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    parsed
}

/// Resolve the JWT secret: explicit config value, else a secret persisted to
/// `/var/lib/talkwire/jwt_secret` so tokens survive restarts, else generate
/// and persist a new one.
fn resolve_jwt_secret(config: &TalkwireConfig) -> String {
    config.server.jwt_secret.clone().unwrap_or_else(|| {
        let secret_path = std::path::Path::new("/var/lib/talkwire/jwt_secret");
        // Try to read existing persisted secret
        if let Ok(existing) = std::fs::read_to_string(secret_path) {
            let trimmed = existing.trim().to_string();
            if !trimmed.is_empty() {
                tracing::info!("Loaded JWT secret from {}", secret_path.display());
                return trimmed;
            }
        }
        // Generate and persist a new secret
        let secret = auth::generate_secret();
        if let Err(e) = std::fs::create_dir_all("/var/lib/talkwire") {
            tracing::warn!("Failed to create /var/lib/talkwire: {e}");
        } else {
            use std::os::unix::fs::OpenOptionsExt;
            match std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(secret_path)
            {
                Ok(mut f) => {
                    use std::io::Write;
                    let _ = f.write_all(secret.as_bytes());
                    tracing::info!("Persisted JWT secret to {}", secret_path.display());
                }
                Err(e) => {
                    tracing::warn!("Failed to persist JWT secret: {e}");
                }
            }
        }
        secret
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args();

    // Load configuration
    let mut config = config::load_config(&args.config_path)?;
    if let Some(p) = args.port_override {
        config.server.port = p;
    }
    // Validate configuration semantics
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let jwt_secret = resolve_jwt_secret(&config);

    // Operator utility: mint a token for a user and exit
    if let Some(user_id) = &args.issue_token {
        if !auth::is_valid_user_id(user_id) {
            anyhow::bail!("Invalid user id: {user_id:?}");
        }
        let token = auth::generate_jwt(user_id, &jwt_secret)?;
        println!("{token}");
        return Ok(());
    }

    let port = config.server.port;
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, port)
        .parse()
        .context("Invalid bind address")?;

    let tls = tls::setup(
        config.server.tls_cert.as_deref(),
        config.server.tls_key.as_deref(),
    )?;
    let tls_acceptor = tls.acceptor;
    tracing::info!("Clients can pin against {}", tls.cert_pem_path.display());

    // Build app state and router
    let presence = PresenceDirectory::new();
    let registry = CallRegistry::new();
    let coordinator = Coordinator::new(presence.clone(), registry);
    let state = Arc::new(AppState {
        config,
        presence,
        coordinator,
        jwt_secret,
        started_at: std::time::Instant::now(),
    });
    let app = ws::build_router(Arc::clone(&state));

    // Print startup banner
    tracing::info!("===========================================");
    tracing::info!("  Talkwire Signaling Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Listening on wss://{bind_addr}/ws");
    tracing::info!("===========================================");

    // Bind and serve with TLS
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    tracing::info!("Server ready, accepting connections");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Accept TLS connections and serve with axum
    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("Failed to accept TCP connection: {e}");
                        continue;
                    }
                };

                let acceptor = tls_acceptor.clone();
                let app = app.clone();

                tokio::spawn(async move {
                    // TLS handshake timeout (10 seconds)
                    let tls_stream = match tokio::time::timeout(
                        std::time::Duration::from_secs(10),
                        acceptor.accept(stream),
                    ).await {
                        Ok(Ok(s)) => s,
                        Ok(Err(e)) => {
                            tracing::debug!(%peer_addr, "TLS handshake failed: {e}");
                            return;
                        }
                        Err(_) => {
                            tracing::debug!(%peer_addr, "TLS handshake timed out");
                            return;
                        }
                    };

                    let io = hyper_util::rt::TokioIo::new(tls_stream);
                    let hyper_service = hyper_util::service::TowerToHyperService::new(app);
                    let builder = hyper_util::server::conn::auto::Builder::new(
                        hyper_util::rt::TokioExecutor::new(),
                    );

                    if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                        tracing::debug!(%peer_addr, "Connection error: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    // Live connections are dropped on exit; clients reconnect and their
    // active calls cascade to ended on the way down.
    tracing::info!("Talkwire server shut down cleanly");

    Ok(())
}
