use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use talkwire_protocol::{ClientEvent, ServerEvent};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Matches the server's WebSocket message cap.
const MAX_MESSAGE_SIZE: usize = 256 * 1024;

pub struct SignalingConfig {
    pub server_url: String,
    pub token: String,
    /// PEM file to trust in addition to the system roots; used to pin a
    /// self-signed server certificate.
    pub tls_cert_path: Option<PathBuf>,
}

enum LoopExit {
    /// Server went away; reconnect after backoff.
    Disconnected,
    /// Local side closed the outbound channel; stop for good.
    Shutdown,
}

/// Maintain the signaling connection forever: server events flow into
/// `event_tx`, anything on `outbound_rx` goes up the wire. Reconnects with
/// exponential backoff; returns only on local shutdown or a TLS setup
/// failure that retrying cannot fix.
pub async fn run_signaling(
    config: SignalingConfig,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientEvent>,
) -> anyhow::Result<()> {
    let connector = build_tls_connector(config.tls_cert_path.as_deref())?;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match connect_and_handle(&config, connector.clone(), &event_tx, &mut outbound_rx).await {
            Ok(LoopExit::Shutdown) => {
                info!("Signaling loop shutting down");
                return Ok(());
            }
            Ok(LoopExit::Disconnected) => {
                warn!("Disconnected from server, reconnecting in {backoff:?}");
            }
            Err(e) => {
                warn!("Signaling connection failed: {e:#}, retrying in {backoff:?}");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn connect_and_handle(
    config: &SignalingConfig,
    connector: Connector,
    event_tx: &mpsc::UnboundedSender<ServerEvent>,
    outbound_rx: &mut mpsc::UnboundedReceiver<ClientEvent>,
) -> anyhow::Result<LoopExit> {
    let url = format!(
        "{}/ws?token={}",
        config.server_url.trim_end_matches('/'),
        urlencoding::encode(&config.token)
    );
    info!(server = config.server_url, "Connecting to signaling server");

    let ws_config = WebSocketConfig::default().max_message_size(Some(MAX_MESSAGE_SIZE));
    let (mut ws, _response) =
        connect_async_tls_with_config(&url, Some(ws_config), false, Some(connector))
            .await
            .context("WebSocket connection failed")?;

    info!("Connected to signaling server");

    loop {
        tokio::select! {
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerEvent>(text.as_str()) {
                        Ok(event) => {
                            if event_tx.send(event).is_err() {
                                return Ok(LoopExit::Shutdown);
                            }
                        }
                        Err(e) => warn!("Unparseable server event: {e}"),
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    ws.send(Message::Pong(payload))
                        .await
                        .context("Failed to answer ping")?;
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Server closed the connection");
                    return Ok(LoopExit::Disconnected);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(anyhow::anyhow!(e).context("WebSocket read error"));
                }
                None => return Ok(LoopExit::Disconnected),
            },
            outbound = outbound_rx.recv() => match outbound {
                Some(event) => {
                    let json = serde_json::to_string(&event)
                        .context("Failed to serialize client event")?;
                    ws.send(Message::text(json))
                        .await
                        .context("Failed to send client event")?;
                }
                None => {
                    let _ = ws.send(Message::Close(None)).await;
                    return Ok(LoopExit::Shutdown);
                }
            },
        }
    }
}

/// System roots plus an optional pinned certificate. Self-hosted servers
/// run with a self-signed cert; pinning its PEM keeps verification on.
fn build_tls_connector(pinned_cert: Option<&Path>) -> anyhow::Result<Connector> {
    let mut roots = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        warn!("Error loading a native root certificate: {error}");
    }
    for cert in native.certs {
        // Individual unparseable roots are skipped, not fatal.
        let _ = roots.add(cert);
    }

    if let Some(path) = pinned_cert {
        let pem = std::fs::read(path)
            .with_context(|| format!("Failed to read pinned certificate {}", path.display()))?;
        let mut reader = pem.as_slice();
        let mut pinned = 0usize;
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert
                .with_context(|| format!("Invalid certificate in {}", path.display()))?;
            roots
                .add(cert)
                .with_context(|| format!("Rejected certificate in {}", path.display()))?;
            pinned += 1;
        }
        if pinned == 0 {
            anyhow::bail!("No certificates found in {}", path.display());
        }
        info!(count = pinned, "Pinned server certificate from {}", path.display());
    }

    let tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Connector::Rustls(Arc::new(tls)))
}
