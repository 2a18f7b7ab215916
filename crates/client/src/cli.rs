use anyhow::Context;

pub(crate) const DEFAULT_RESTART_DELAY_MS: u64 = 2_000;
pub(crate) const DEFAULT_CANDIDATE_BUFFER: usize = 20;

pub(crate) struct Args {
    pub server_url: String,
    pub token: Option<String>,
    /// User id to dial immediately after connecting.
    pub call: Option<String>,
    pub auto_accept: bool,
    pub tls_cert_path: Option<String>,
    /// Extra ICE server URLs, overriding what /api/ice-config would return.
    pub ice_servers: Vec<String>,
    pub restart_delay_ms: u64,
    pub candidate_buffer: usize,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut server_url = "wss://localhost:8443".to_string();
    let mut token = None;
    let mut call = None;
    let mut auto_accept = false;
    let mut tls_cert_path = None;
    let mut ice_servers = Vec::new();
    let mut restart_delay_ms = DEFAULT_RESTART_DELAY_MS;
    let mut candidate_buffer = DEFAULT_CANDIDATE_BUFFER;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("talkwire-client {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("talkwire-client - Talkwire call edge client");
                println!();
                println!("USAGE:");
                println!("    talkwire-client [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!(
                    "    --server-url <URL>           Signaling server WebSocket URL [default: wss://localhost:8443]"
                );
                println!(
                    "    --token <TOKEN>              Auth token (prefer TALKWIRE_TOKEN env)"
                );
                println!("    --call <USER>                Dial this user after connecting");
                println!("    --auto-accept                Accept incoming calls automatically");
                println!(
                    "    --tls-cert <PATH>            TLS certificate to pin for server connection"
                );
                println!(
                    "    --ice-server <URL>           ICE server URL (repeatable, overrides server config)"
                );
                println!(
                    "    --restart-delay-ms <MS>      Delay before checking a dropped connection [default: 2000]"
                );
                println!(
                    "    --candidate-buffer <N>       Early ICE candidates to hold [default: 20]"
                );
                println!("    -V, --version                Print version and exit");
                println!("    -h, --help                   Print this help and exit");
                std::process::exit(0);
            }
            "--server-url" => {
                i += 1;
                server_url = args.get(i).context("Missing --server-url value")?.clone();
            }
            "--token" => {
                // Legacy CLI support (prefer TALKWIRE_TOKEN env var)
                i += 1;
                token = Some(args.get(i).context("Missing --token value")?.clone());
            }
            "--call" => {
                i += 1;
                call = Some(args.get(i).context("Missing --call value")?.clone());
            }
            "--auto-accept" => {
                auto_accept = true;
            }
            "--tls-cert" => {
                i += 1;
                tls_cert_path = Some(args.get(i).context("Missing --tls-cert value")?.clone());
            }
            "--ice-server" => {
                i += 1;
                ice_servers.push(args.get(i).context("Missing --ice-server value")?.clone());
            }
            "--restart-delay-ms" => {
                i += 1;
                restart_delay_ms = args
                    .get(i)
                    .context("Missing --restart-delay-ms value")?
                    .parse()
                    .context("Invalid --restart-delay-ms value")?;
            }
            "--candidate-buffer" => {
                i += 1;
                candidate_buffer = args
                    .get(i)
                    .context("Missing --candidate-buffer value")?
                    .parse()
                    .context("Invalid --candidate-buffer value")?;
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    // Prefer env var for the token (CLI args are visible in /proc)
    if token.is_none() {
        token = std::env::var("TALKWIRE_TOKEN").ok();
    }

    Ok(Args {
        server_url,
        token,
        call,
        auto_accept,
        tls_cert_path,
        ice_servers,
        restart_delay_ms,
        candidate_buffer,
    })
}
