//! Minimal service used as a shadow instance in tests and local trials.
//!
//! Serves `GET /health` and `POST /run` on `127.0.0.1:<port>`.  Behaviour is
//! read once at startup from `<root>/fixture.json`:
//!
//! ```json
//! {"mode": "ok", "result": "ok"}
//! ```
//!
//! | mode        | behaviour                                   |
//! |-------------|---------------------------------------------|
//! | `ok`        | 200 health, `{"result": <result>}` from run |
//! | `crash`     | exits with status 3 before binding          |
//! | `unhealthy` | 503 from health                             |
//! | `bad_task`  | run answers 200 without a `result` field    |
//! | `slow_task` | run never answers within any sane timeout   |
//!
//! A missing file means `ok`; an unreadable or malformed one exits 1.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const MAX_REQUEST_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 32;

#[derive(Parser, Debug)]
#[command(name = "shadow-fixture", about = "Reference service for shadow-instance smoke tests")]
struct Args {
    /// Loopback port to listen on
    #[arg(long)]
    port: u16,

    /// Directory holding fixture.json (the workspace when run as a shadow)
    #[arg(long, default_value = ".")]
    root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
enum Mode {
    #[default]
    Ok,
    Crash,
    Unhealthy,
    BadTask,
    SlowTask,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct Behaviour {
    mode: Mode,
    result: String,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self { mode: Mode::Ok, result: "ok".into() }
    }
}

fn load_behaviour(root: &Path) -> Result<Behaviour, String> {
    let path = root.join("fixture.json");
    match std::fs::read_to_string(&path) {
        Ok(text) => serde_json::from_str(&text).map_err(|e| format!("{}: {e}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Behaviour::default()),
        Err(e) => Err(format!("{}: {e}", path.display())),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse();
    let behaviour = match load_behaviour(&args.root) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "cannot load fixture config");
            std::process::exit(1);
        }
    };
    if behaviour.mode == Mode::Crash {
        error!(root = %args.root.display(), "fixture configured to crash at startup");
        std::process::exit(3);
    }

    let listener = match TcpListener::bind(("127.0.0.1", args.port)).await {
        Ok(l) => l,
        Err(e) => {
            error!(port = args.port, error = %e, "bind failed");
            std::process::exit(2);
        }
    };
    info!(port = args.port, mode = ?behaviour.mode, "shadow fixture listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let behaviour = behaviour.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &behaviour).await {
                debug!(peer = %peer, error = %e, "connection error");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

struct Request {
    method: String,
    path: String,
}

/// Read one request (headers plus `Content-Length` body).
async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<Request>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let parsed = req
            .parse(&buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if let httparse::Status::Complete(header_len) = parsed {
            let content_length = req
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                .and_then(|h| std::str::from_utf8(h.value).ok())
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            let request = Request {
                method: req.method.unwrap_or("").to_string(),
                path: req.path.unwrap_or("/").to_string(),
            };
            let needed = header_len + content_length;
            while buf.len() < needed {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            return Ok(Some(request));
        }
        if buf.len() > MAX_REQUEST_BYTES {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "request too large"));
        }
    }
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

async fn handle_connection(mut stream: TcpStream, behaviour: &Behaviour) -> std::io::Result<()> {
    let Some(req) = read_request(&mut stream).await? else {
        return Ok(());
    };
    debug!(method = %req.method, path = %req.path, "request");

    match (req.method.as_str(), req.path.as_str()) {
        ("GET", "/health") if behaviour.mode == Mode::Unhealthy => {
            respond(&mut stream, "503 Service Unavailable", r#"{"status":"degraded"}"#).await
        }
        ("GET", "/health") => respond(&mut stream, "200 OK", r#"{"status":"ok"}"#).await,
        ("POST", "/run") => match behaviour.mode {
            Mode::BadTask => respond(&mut stream, "200 OK", r#"{"answer":"missing result"}"#).await,
            Mode::SlowTask => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            _ => {
                let body = serde_json::json!({ "result": behaviour.result }).to_string();
                respond(&mut stream, "200 OK", &body).await
            }
        },
        _ => respond(&mut stream, "404 Not Found", r#"{"error":"not found"}"#).await,
    }
}
