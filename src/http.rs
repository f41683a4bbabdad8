//! HTTP service: aircraft JSON, receiver metadata, static files and a
//! WebSocket echo endpoint.
//!
//! The handler is deliberately small: GET/HEAD only, one request read
//! per round, keep-alive honoured, CORS on the JSON endpoints.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

use crate::network::{admit_client, NetContext, Service};
use crate::stats::Stats;

/// 1×1 transparent PNG served for the favicon routes.
const FAVICON_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x62, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

#[derive(Serialize)]
struct ReceiverJson {
    version: &'static str,
    refresh: u64,
    history: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lon: Option<f64>,
}

pub async fn run_http_server(
    ctx: Arc<NetContext>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(("0.0.0.0", ctx.config.net_http_port)).await?;
    info!("{} listening on port {}", Service::Http.descr(), ctx.config.net_http_port);

    loop {
        let (mut socket, addr) = listener.accept().await?;
        if !admit_client(&ctx, Service::Http, addr.ip()) {
            let _ = socket.shutdown().await;
            continue;
        }

        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(ctx.clone(), socket).await {
                debug!("HTTP client {}: {}", addr, e);
            }
            Stats::inc(&ctx.stats.services[Service::Http.index()].clients_removed);
        });
    }
}

struct Request {
    method: String,
    path: String,
    keep_alive: bool,
    websocket_key: Option<String>,
}

fn parse_request(raw: &str) -> Option<Request> {
    let mut lines = raw.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    let version = parts.next().unwrap_or("HTTP/1.0");

    let mut connection = String::new();
    let mut upgrade = String::new();
    let mut websocket_key = None;
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                "connection" => connection = value.to_ascii_lowercase(),
                "upgrade" => upgrade = value.to_ascii_lowercase(),
                "sec-websocket-key" => websocket_key = Some(value.to_string()),
                _ => {}
            }
        }
    }

    // HTTP/1.1 defaults to keep-alive; 1.0 has to ask for it.
    let keep_alive = if version.contains("1.1") {
        !connection.contains("close")
    } else {
        connection.contains("keep-alive")
    };

    Some(Request {
        method,
        path,
        keep_alive,
        websocket_key: if upgrade.contains("websocket") { websocket_key } else { None },
    })
}

async fn handle_connection(
    ctx: Arc<NetContext>,
    mut socket: TcpStream,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut buffer = vec![0u8; 8192];

    loop {
        let n = socket.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        Stats::add(&ctx.stats.services[Service::Http.index()].bytes_recv, n as u64);

        let raw = String::from_utf8_lossy(&buffer[..n]).into_owned();
        let Some(request) = parse_request(&raw) else {
            return Ok(());
        };

        if request.method != "GET" && request.method != "HEAD" {
            respond(&ctx, &mut socket, 400, "text/plain", b"bad request", false, false, false)
                .await?;
            return Ok(());
        }

        // WebSocket upgrade: the socket leaves the HTTP loop for good.
        if request.path == "/echo" {
            if let Some(key) = request.websocket_key {
                return websocket_echo(socket, &key).await;
            }
        }

        let head_only = request.method == "HEAD";
        let keep_alive = request.keep_alive;

        match route(&ctx, &request.path) {
            Route::Redirect(location) => {
                let header = format!(
                    "HTTP/1.1 301 Moved Permanently\r\n\
                     Server: rx1090\r\n\
                     Location: {}\r\n\
                     Content-Length: 0\r\n\
                     Connection: {}\r\n\r\n",
                    location,
                    if keep_alive { "keep-alive" } else { "close" },
                );
                socket.write_all(header.as_bytes()).await?;
            }
            Route::Json(body) => {
                respond(&ctx, &mut socket, 200, "application/json;charset=utf-8",
                        body.as_bytes(), keep_alive, head_only, true)
                    .await?;
            }
            Route::Bytes(content_type, body) => {
                respond(&ctx, &mut socket, 200, content_type, body, keep_alive, head_only, false)
                    .await?;
            }
            Route::File(path) => match tokio::fs::read(&path).await {
                Ok(body) => {
                    respond(&ctx, &mut socket, 200, content_type_for(&request.path),
                            &body, keep_alive, head_only, false)
                        .await?;
                }
                Err(_) => {
                    respond(&ctx, &mut socket, 404, "text/plain", b"not found",
                            keep_alive, head_only, false)
                        .await?;
                }
            },
            Route::NotFound => {
                respond(&ctx, &mut socket, 404, "text/plain", b"not found",
                        keep_alive, head_only, false)
                    .await?;
            }
        }

        if !keep_alive {
            return Ok(());
        }
    }
}

enum Route {
    Redirect(String),
    Json(String),
    Bytes(&'static str, &'static [u8]),
    File(PathBuf),
    NotFound,
}

fn route(ctx: &NetContext, path: &str) -> Route {
    let path = path.split('?').next().unwrap_or(path);
    match path {
        "/" => Route::Redirect(format!("/{}", ctx.config.web_page)),
        "/data/receiver.json" => {
            let receiver = ReceiverJson {
                version: env!("CARGO_PKG_VERSION"),
                refresh: ctx.config.json_interval_ms,
                history: 0,
                lat: ctx.config.home_lat,
                lon: ctx.config.home_lon,
            };
            Route::Json(serde_json::to_string(&receiver).unwrap_or_else(|_| "{}".into()))
        }
        "/data.json" => Route::Json(ctx.store.read().legacy_json()),
        "/data/aircraft.json" | "/chunks/chunks.json" => {
            let messages = ctx.stats.messages_total.load(Ordering::Relaxed);
            Route::Json(ctx.store.read().aircraft_json(Instant::now(), messages))
        }
        "/favicon.png" | "/favicon.ico" => Route::Bytes("image/png", FAVICON_PNG),
        _ => match sanitize_static_path(&ctx.config.web_root, path) {
            Some(file) => Route::File(file),
            None => Route::NotFound,
        },
    }
}

/// Map a request path to a file under the web root. Only paths with an
/// extension are served, and traversal is refused outright.
fn sanitize_static_path(web_root: &str, path: &str) -> Option<PathBuf> {
    let rel = path.strip_prefix('/')?;
    if rel.is_empty() || rel.contains("..") || rel.contains('\\') {
        return None;
    }
    let file_name = rel.rsplit('/').next()?;
    if !file_name.contains('.') {
        return None;
    }
    Some(PathBuf::from(web_root).join(rel))
}

fn content_type_for(path: &str) -> &'static str {
    match path.rsplit('.').next().unwrap_or("") {
        "html" | "htm" => "text/html;charset=utf-8",
        "js" => "application/javascript",
        "css" => "text/css",
        "json" => "application/json;charset=utf-8",
        "png" => "image/png",
        "ico" => "image/x-icon",
        "svg" => "image/svg+xml",
        "txt" => "text/plain;charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[allow(clippy::too_many_arguments)]
async fn respond(
    ctx: &NetContext,
    socket: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
    keep_alive: bool,
    head_only: bool,
    cors: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let reason = match status {
        200 => "OK",
        301 => "Moved Permanently",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let header = format!(
        "HTTP/1.1 {} {}\r\n\
         Server: rx1090\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: {}\r\n\
         {}\r\n",
        status,
        reason,
        content_type,
        body.len(),
        if keep_alive { "keep-alive" } else { "close" },
        if cors { "Access-Control-Allow-Origin: *\r\n" } else { "" },
    );

    socket.write_all(header.as_bytes()).await?;
    let mut sent = header.len();
    if !head_only {
        socket.write_all(body).await?;
        sent += body.len();
    }

    let stats = &ctx.stats.services[Service::Http.index()];
    Stats::add(&stats.bytes_sent, sent as u64);
    Stats::inc(&stats.messages_sent);
    Ok(())
}

/// Complete the upgrade handshake by hand and echo frames back.
async fn websocket_echo(
    mut socket: TcpStream,
    key: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let accept = derive_accept_key(key.as_bytes());
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept,
    );
    socket.write_all(response.as_bytes()).await?;

    let mut ws = WebSocketStream::from_raw_socket(socket, Role::Server, None).await;
    while let Some(message) = ws.next().await {
        match message? {
            Message::Text(text) => ws.send(Message::Text(text)).await?,
            Message::Binary(data) => ws.send(Message::Binary(data)).await?,
            Message::Close(_) => break,
            // Ping/pong bookkeeping happens inside the stream.
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parsing_and_keepalive() {
        let req = parse_request(
            "GET /data/aircraft.json HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/data/aircraft.json");
        assert!(req.keep_alive);

        // 1.1 without Connection header still keeps alive.
        let req = parse_request("GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert!(req.keep_alive);

        // 1.0 needs to opt in.
        let req = parse_request("GET / HTTP/1.0\r\nHost: x\r\n\r\n").unwrap();
        assert!(!req.keep_alive);

        let req = parse_request("GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!req.keep_alive);
    }

    #[test]
    fn websocket_key_requires_upgrade_header() {
        let req = parse_request(
            "GET /echo HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.websocket_key.as_deref(), Some("dGhlIHNhbXBsZSBub25jZQ=="));

        let req = parse_request(
            "GET /echo HTTP/1.1\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.websocket_key, None);
    }

    #[test]
    fn static_paths_are_sanitized() {
        assert_eq!(
            sanitize_static_path("web", "/gmap.html"),
            Some(PathBuf::from("web/gmap.html"))
        );
        assert_eq!(
            sanitize_static_path("web", "/sub/dir/script.js"),
            Some(PathBuf::from("web/sub/dir/script.js"))
        );
        // No extension, traversal, or backslash tricks.
        assert_eq!(sanitize_static_path("web", "/gmap"), None);
        assert_eq!(sanitize_static_path("web", "/../etc/passwd"), None);
        assert_eq!(sanitize_static_path("web", "/a\\b.html"), None);
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type_for("/x/gmap.html"), "text/html;charset=utf-8");
        assert_eq!(content_type_for("/script.js"), "application/javascript");
        assert_eq!(content_type_for("/x.bin"), "application/octet-stream");
    }

    #[test]
    fn favicon_is_a_png() {
        assert_eq!(&FAVICON_PNG[..8], &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]);
    }

    #[test]
    fn receiver_json_shape() {
        let receiver = ReceiverJson {
            version: "0.9.0",
            refresh: 1000,
            history: 0,
            lat: Some(51.47),
            lon: Some(-0.45),
        };
        let doc: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&receiver).unwrap()).unwrap();
        assert_eq!(doc["version"], "0.9.0");
        assert_eq!(doc["refresh"], 1000);
        assert!((doc["lat"].as_f64().unwrap() - 51.47).abs() < 1e-9);

        // Unset receiver position is omitted entirely.
        let receiver = ReceiverJson {
            version: "0.9.0",
            refresh: 1000,
            history: 0,
            lat: None,
            lon: None,
        };
        let json = serde_json::to_string(&receiver).unwrap();
        assert!(!json.contains("lat"));
    }
}
