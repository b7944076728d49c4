//! Read-only JSON API over the result store, consumed by the dashboard.
//!
//! - `GET /health`
//! - `GET /stats?granularity=hour|day|month[&date=YYYY-MM-DD|&month=YYYY-MM|&year=YYYY]`
//! - `GET /runs/recent[?limit=N]`

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::stats::{query_stats, Granularity, StatBucket, StatsSummary, TimeFilter};
use crate::storage::{ResultStore, RunSummary};

const MAX_REQUEST_BYTES: usize = 8192;
const DEFAULT_RECENT_LIMIT: usize = 20;
const MAX_RECENT_LIMIT: usize = 500;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8798".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    store: Arc<dyn ResultStore>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, store: Arc<dyn ResultStore>) -> Self {
        Self { cfg, store }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let store = self.store;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, store, shutdown_thread) {
                log::error!("stats api stopped: {}", err);
            }
        });
        log::info!("stats api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    store: Arc<dyn ResultStore>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, store.as_ref()) {
                    log::warn!("stats api request failed: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, store: &dyn ResultStore) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    let (status, body) = route(&request, store);
    write_response(&mut stream, status, "application/json", &body)
}

#[derive(Serialize)]
struct StatsResponse<'a> {
    granularity: Granularity,
    buckets: &'a [StatBucket],
    summary: StatsSummary,
}

#[derive(Serialize)]
struct RecentResponse {
    runs: Vec<RunSummary>,
}

fn route(request: &HttpRequest, store: &dyn ResultStore) -> (u16, Vec<u8>) {
    if request.method != "GET" {
        return error_body(405, "method_not_allowed");
    }
    let result = match request.path.as_str() {
        "/health" => return (200, br#"{"status":"ok"}"#.to_vec()),
        "/stats" => stats(request, store),
        "/runs/recent" => recent(request, store),
        _ => return error_body(404, "not_found"),
    };
    match result {
        Ok(body) => (200, body),
        Err(ApiError::BadRequest(reason)) => error_body(400, &reason),
        Err(ApiError::Internal(err)) => {
            log::error!("stats api: {:#}", err);
            error_body(500, "internal_error")
        }
    }
}

enum ApiError {
    BadRequest(String),
    Internal(anyhow::Error),
}

fn stats(request: &HttpRequest, store: &dyn ResultStore) -> Result<Vec<u8>, ApiError> {
    let granularity = Granularity::parse(request.query("granularity").unwrap_or("day"))
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let filter = parse_filter(request).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let buckets = query_stats(store, granularity, filter).map_err(ApiError::Internal)?;
    let response = StatsResponse {
        granularity,
        summary: StatsSummary::from_buckets(&buckets),
        buckets: &buckets,
    };
    serde_json::to_vec(&response).map_err(|e| ApiError::Internal(e.into()))
}

fn parse_filter(request: &HttpRequest) -> Result<TimeFilter> {
    let given: Vec<_> = ["date", "month", "year"]
        .into_iter()
        .filter(|k| request.query(k).is_some())
        .collect();
    if given.len() > 1 {
        return Err(anyhow!("use only one of date, month, year"));
    }
    if let Some(day) = request.query("date") {
        TimeFilter::parse_day(day)
    } else if let Some(month) = request.query("month") {
        TimeFilter::parse_month(month)
    } else if let Some(year) = request.query("year") {
        TimeFilter::parse_year(year)
    } else {
        Ok(TimeFilter::All)
    }
}

fn recent(request: &HttpRequest, store: &dyn ResultStore) -> Result<Vec<u8>, ApiError> {
    let limit = match request.query("limit") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| ApiError::BadRequest(format!("invalid limit '{}'", raw)))?
            .min(MAX_RECENT_LIMIT),
        None => DEFAULT_RECENT_LIMIT,
    };
    let runs = store.recent_runs(limit).map_err(ApiError::Internal)?;
    serde_json::to_vec(&RecentResponse { runs }).map_err(|e| ApiError::Internal(e.into()))
}

fn error_body(status: u16, error: &str) -> (u16, Vec<u8>) {
    let body = serde_json::json!({ "error": error });
    (status, body.to_string().into_bytes())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    HttpRequest::parse(&String::from_utf8_lossy(&data))
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
}

impl HttpRequest {
    fn parse(text: &str) -> Result<Self> {
        let request_line = text
            .split("\r\n")
            .next()
            .filter(|line| !line.is_empty())
            .ok_or_else(|| anyhow!("empty request"))?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
        let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
        let (path, query) = match raw_path.split_once('?') {
            Some((path, query)) => (path, query),
            None => (raw_path, ""),
        };
        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            query: url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
        })
    }

    fn query(&self, key: &str) -> Option<&str> {
        self.query
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}
