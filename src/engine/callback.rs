// ── Chatvend Engine: Payment Callback Server ───────────────────────────────
// Tiny HTTP listener for the two public endpoints:
//   GET {path}?Authority=…&Status=OK|NOK — Zarinpal redirects the payer
//       here; we render a small HTML page and resolve the payment in the
//       background through confirm_auto (which is idempotent, so replayed
//       redirects are harmless).
//   GET /metrics — Prometheus text exposition.
//
// Raw tokio::net::TcpListener with hand-parsed request heads; a 1-second
// accept timeout keeps the loop responsive to the stop flag.

use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::atoms::error::EngineResult;
use crate::engine::state::EngineState;

pub fn spawn_server(state: Arc<EngineState>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = run_server(state, stop).await {
            error!("[callback] Server crashed: {}", e);
        }
    })
}

async fn run_server(state: Arc<EngineState>, stop: Arc<AtomicBool>) -> EngineResult<()> {
    let port = state.config.payment.zarinpal.callback_port;
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("bind {} failed: {}", addr, e))?;
    info!("[callback] Listening on http://{}", addr);

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match tokio::time::timeout(Duration::from_secs(1), listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_request(stream, state).await {
                        warn!("[callback] Request from {} failed: {}", peer, e);
                    }
                });
            }
            Ok(Err(e)) => warn!("[callback] Accept error: {}", e),
            Err(_) => { /* timeout; loop to check the stop flag */ }
        }
    }
    info!("[callback] Server stopped");
    Ok(())
}

async fn handle_request(mut stream: TcpStream, state: Arc<EngineState>) -> EngineResult<()> {
    let mut buf = vec![0u8; 8192];
    let n = stream.read(&mut buf).await.map_err(|e| format!("read error: {}", e))?;
    if n == 0 {
        return Ok(());
    }
    let raw = String::from_utf8_lossy(&buf[..n]);
    let first_line = raw.lines().next().unwrap_or("");
    let mut parts = first_line.split_whitespace();
    let (method, target) = match (parts.next(), parts.next()) {
        (Some(m), Some(t)) => (m, t),
        _ => return respond(&mut stream, 400, "text/plain", "malformed request").await,
    };
    if method != "GET" {
        return respond(&mut stream, 405, "text/plain", "method not allowed").await;
    }

    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    match path {
        "/metrics" => {
            let body = state.metrics.render();
            respond(&mut stream, 200, "text/plain; version=0.0.4", &body).await
        }
        _ if path == callback_path(&state) => {
            let params = parse_query(query);
            let authority = params.get("Authority").cloned().unwrap_or_default();
            let status = params.get("Status").cloned().unwrap_or_default();

            if authority.is_empty() {
                return respond(&mut stream, 400, "text/html", PAGE_FAILURE).await;
            }

            // Resolve out of band; the page renders immediately and the
            // user gets the real verdict in Telegram.
            let confirm_state = state.clone();
            let confirm_authority = authority.clone();
            tokio::spawn(async move {
                match confirm_state.payments.confirm_auto(&confirm_authority).await {
                    Ok(p) => info!("[callback] {} resolved to {}", confirm_authority, p.status),
                    Err(e) => warn!("[callback] confirm_auto({}) failed: {}", confirm_authority, e),
                }
            });

            let page = if status == "OK" { PAGE_SUCCESS } else { PAGE_FAILURE };
            respond(&mut stream, 200, "text/html", page).await
        }
        _ => respond(&mut stream, 404, "text/plain", "not found").await,
    }
}

/// Path component of the configured public callback URL.
fn callback_path(state: &EngineState) -> String {
    let url = &state.config.payment.zarinpal.callback_url;
    let after_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    match after_scheme.find('/') {
        Some(i) => after_scheme[i..].split('?').next().unwrap_or("/").to_string(),
        None => "/".into(),
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((
                urlencoding::decode(k).ok()?.into_owned(),
                urlencoding::decode(v).ok()?.into_owned(),
            ))
        })
        .collect()
}

async fn respond(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &str,
) -> EngineResult<()> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    };
    let resp = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        content_type,
        body.len(),
        body
    );
    stream.write_all(resp.as_bytes()).await.map_err(|e| format!("write error: {}", e))?;
    Ok(())
}

const PAGE_SUCCESS: &str = "<!doctype html><html><head><meta charset=\"utf-8\">\
<title>Payment received</title></head><body style=\"font-family:sans-serif;text-align:center;padding-top:4rem\">\
<h1>✅ Thank you!</h1><p>Your payment is being confirmed. Check the Telegram chat for your subscription.</p>\
</body></html>";

const PAGE_FAILURE: &str = "<!doctype html><html><head><meta charset=\"utf-8\">\
<title>Payment not completed</title></head><body style=\"font-family:sans-serif;text-align:center;padding-top:4rem\">\
<h1>❌ Payment not completed</h1><p>No money moved, or the gateway reported a problem. You can retry from the Telegram chat.</p>\
</body></html>";
