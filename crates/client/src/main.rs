mod cli;
mod controller;
mod media;
mod peer;
mod signaling;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use controller::CallController;
use peer::IceServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("Failed to install rustls crypto provider");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = cli::parse_args()?;
    let token = args
        .token
        .clone()
        .context("No auth token: set TALKWIRE_TOKEN or pass --token")?;

    info!("Talkwire Client v{}", env!("CARGO_PKG_VERSION"));

    // Server events in, client events out, plus the controller's own timers
    // and peer callbacks.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();

    let signaling_config = signaling::SignalingConfig {
        server_url: args.server_url.clone(),
        token,
        tls_cert_path: args.tls_cert_path.clone().map(PathBuf::from),
    };
    let mut signaling = tokio::spawn(signaling::run_signaling(
        signaling_config,
        event_tx,
        outbound_rx,
    ));

    let ice_servers: Vec<IceServerConfig> = args
        .ice_servers
        .iter()
        .map(|url| IceServerConfig {
            urls: vec![url.clone()],
            username: None,
            credential: None,
        })
        .collect();

    let mut controller = CallController::new(
        outbound_tx,
        control_tx,
        ice_servers,
        args.auto_accept,
        Duration::from_millis(args.restart_delay_ms),
        args.candidate_buffer,
    );

    if let Some(to) = &args.call {
        controller.dial(to).await?;
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    print_commands();

    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(event) => controller.on_server_event(event).await,
                None => {
                    warn!("Signaling channel closed");
                    break;
                }
            },
            msg = control_rx.recv() => {
                if let Some(msg) = msg {
                    controller.on_control(msg).await;
                }
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if handle_command(&mut controller, line.trim()).await {
                        break;
                    }
                }
                // stdin closed: keep serving calls (running under a supervisor)
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("stdin error: {e}");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            result = &mut signaling => {
                match result {
                    Ok(Ok(())) => info!("Signaling task finished"),
                    Ok(Err(e)) => warn!("Signaling task failed: {e:#}"),
                    Err(e) => warn!("Signaling task panicked: {e}"),
                }
                break;
            }
        }
    }

    controller.hangup().await;
    drop(controller);
    if !signaling.is_finished() {
        // Give the signaling task a moment to flush the call-end and close.
        let _ = tokio::time::timeout(Duration::from_secs(2), &mut signaling).await;
    }
    Ok(())
}

/// Returns true when the user asked to quit.
async fn handle_command(controller: &mut CallController, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("call") => match parts.next() {
            Some(user) => {
                if let Err(e) = controller.dial(user).await {
                    warn!("Cannot dial: {e:#}");
                }
            }
            None => println!("usage: call <user>"),
        },
        Some("hangup") => controller.hangup().await,
        Some("share") => {
            if let Err(e) = controller.set_screen_share(true).await {
                warn!("Cannot start screen share: {e:#}");
            }
        }
        Some("unshare") => {
            if let Err(e) = controller.set_screen_share(false).await {
                warn!("Cannot stop screen share: {e:#}");
            }
        }
        Some("help") => print_commands(),
        Some("quit") | Some("exit") => return true,
        Some(other) => println!("unknown command: {other} (try 'help')"),
        None => {}
    }
    false
}

fn print_commands() {
    println!("commands: call <user> | hangup | share | unshare | help | quit");
}
