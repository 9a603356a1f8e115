//! photong generation daemon: Unix socket, line-delimited JSON.
//!
//! Keeps the diffusion model resident across requests. Each client connection
//! sends one JSON request line and receives one JSON response line, then closes.
//! Requests are served one at a time in arrival order.
//!
//! The daemon takes prompts only. Image requests go through `photong --image`
//! or [`photong::orchestrator::Orchestrator`].
//!
//! # Socket path
//!
//! Default: `/tmp/photong.sock`. Override with `--socket`.
//!
//! # Protocol
//!
//! **Request** (one JSON line):
//! ```json
//! {
//!   "prompt": "acoustic folk guitar",
//!   "seed": 42,             // negative seeds wrap to u64
//!   "alpha": 0.25,          // optional, no effect on a single prompt
//!   "seed_image": "og_beat" // optional, falls back to the default asset
//! }
//! ```
//!
//! **Response on success** (one JSON line):
//! ```json
//! {"ok": true, "audio": "data:audio/mpeg;base64,...", "duration": 5.11}
//! ```
//!
//! **Response on error** (one JSON line):
//! ```json
//! {"ok": false, "error": "sampling failed: ..."}
//! ```
//!
//! # Example (shell)
//!
//! ```sh
//! echo '{"prompt":"jazz music with trumpets","seed":7}' \
//!   | socat - UNIX-CONNECT:/tmp/photong.sock
//! ```

use std::path::PathBuf;

use clap::Parser;
use photong::{config::EngineConfig, engine::GenerateRequest, manager::SynthesisManager};
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "photong-daemon",
    about = "photong generation daemon: resident model, Unix socket JSON interface"
)]
struct Args {
    /// Unix socket path to listen on.
    #[arg(long, default_value = "/tmp/photong.sock")]
    socket: PathBuf,

    /// JSON engine config. Missing fields take their defaults.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// CUDA device ordinal. Overrides the config.
    #[arg(long)]
    device: Option<usize>,
}

// ── Wire types ───────────────────────────────────────────────────────────────

/// Response sent back to the client.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Response {
    Ok {
        ok: bool, // always true
        audio: String,
        duration: f64,
    },
    Err {
        ok: bool, // always false
        error: String,
    },
}

impl Response {
    fn ok(audio: String, duration: f64) -> Self {
        Self::Ok {
            ok: true,
            audio,
            duration,
        }
    }

    fn err(msg: impl Into<String>) -> Self {
        Self::Err {
            ok: false,
            error: msg.into(),
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(ordinal) = args.device {
        config.model.cuda_device = ordinal;
    }

    // Remove stale socket file if present.
    if args.socket.exists() {
        std::fs::remove_file(&args.socket)?;
    }

    // Bind first so callers can connect while the model loads.
    let listener = UnixListener::bind(&args.socket)?;
    tracing::info!("Listening on {:?} (loading model...)", args.socket);

    let manager = SynthesisManager::start(config).await?;
    tracing::info!("Model ready");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let manager = manager.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, manager).await {
                            tracing::warn!("connection error: {e}");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("accept error: {e}");
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    manager.release().await?;
    std::fs::remove_file(&args.socket).ok();
    Ok(())
}

// ── Connection handler ────────────────────────────────────────────────────────

async fn handle_connection(stream: UnixStream, manager: SynthesisManager) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    // Read exactly one line (the JSON request).
    let line = match lines.next_line().await? {
        Some(l) if !l.trim().is_empty() => l,
        _ => {
            send_response(&mut writer, Response::err("empty request")).await?;
            return Ok(());
        }
    };

    let response = process_request(&line, &manager).await;
    send_response(&mut writer, response).await?;
    Ok(())
}

async fn process_request(line: &str, manager: &SynthesisManager) -> Response {
    let request = match parse_request(line) {
        Ok(r) => r,
        Err(e) => return Response::err(e),
    };

    tracing::info!(prompt = %request.prompt, seed = request.seed, "generating");

    match manager.generate(request).await {
        Ok(clip) => {
            tracing::info!(duration_s = clip.duration_s, "done");
            Response::ok(clip.audio, clip.duration_s)
        }
        Err(e) => Response::err(e.to_string()),
    }
}

fn parse_request(line: &str) -> Result<GenerateRequest, String> {
    let request: GenerateRequest =
        serde_json::from_str(line).map_err(|e| format!("invalid JSON request: {e}"))?;
    if request.prompt.trim().is_empty() {
        return Err("'prompt' field is required and must not be empty".into());
    }
    Ok(request)
}

async fn send_response(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    response: Response,
) -> anyhow::Result<()> {
    let mut json = serde_json::to_string(&response)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    Ok(())
}
