//! Screening HTTP API.
//!
//! A single background thread accepts connections and serves them one at a
//! time, so each upload runs the pipeline to completion before the next
//! request is read. The thread owns the analyzer and the session store.

use crate::image_input::{UploadedImage, DEFAULT_MAX_UPLOAD_BYTES};
use crate::pipeline::{AnalysisResult, Analyzer};
use crate::render;
use crate::session::{SessionId, SessionStore, DEFAULT_SESSION_TTL_SECS};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const MAX_HEADER_BYTES: usize = 8192;
const SESSION_COOKIE: &str = "session";
const SESSION_HEADER: &str = "x-session-id";
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);
const ANNOTATED_PATH: &str = "/results/annotated.jpg";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub session_ttl: Duration,
    pub max_upload_bytes: usize,
    pub read_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8790".to_string(),
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            read_timeout: Duration::from_secs(10),
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
    analyzer: Analyzer,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, analyzer: Analyzer) -> Self {
        Self { cfg, analyzer }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg;
        let analyzer = self.analyzer;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, analyzer, shutdown_thread) {
                log::error!("screening api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    analyzer: Analyzer,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut sessions = SessionStore::new(cfg.session_ttl);
    let mut last_prune = Instant::now();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        if last_prune.elapsed() >= PRUNE_INTERVAL {
            let pruned = sessions.prune_expired();
            if pruned > 0 {
                log::debug!("pruned {} expired session(s)", pruned);
            }
            last_prune = Instant::now();
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &analyzer, &mut sessions, &cfg) {
                    log::warn!("screening api request failed: {}", err);
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

fn handle_connection(
    mut stream: TcpStream,
    analyzer: &Analyzer,
    sessions: &mut SessionStore,
    cfg: &ApiConfig,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = match read_request(&mut stream, cfg)? {
        ReadOutcome::Request(request) => request,
        ReadOutcome::TooLarge => {
            write_json_response(&mut stream, 413, r#"{"error":"upload_too_large"}"#)?;
            return Ok(());
        }
    };

    let (method, path) = (request.method.clone(), request.path.clone());
    match (method.as_str(), path.as_str()) {
        ("GET", "/health") => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        ("POST", "/sessions") => {
            let id = sessions.create();
            let body = serde_json::to_vec(&serde_json::json!({ "session": id.as_str() }))?;
            let cookie = session_cookie(&id, cfg.session_ttl);
            write_response(&mut stream, 201, "application/json", &body, &[("Set-Cookie", cookie)])
        }
        ("DELETE", "/sessions") => {
            if let Some(id) = request.session_id() {
                sessions.clear(&id);
            }
            let expired = format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
            write_response(&mut stream, 204, "application/json", b"", &[("Set-Cookie", expired)])
        }
        ("POST", "/analyze") => handle_analyze(&mut stream, request, analyzer, sessions, cfg),
        ("GET", "/results") => match current_analysis(&request, sessions) {
            Some(result) => {
                let body = serde_json::to_vec(&results_json(result))?;
                write_response(&mut stream, 200, "application/json", &body, &[])
            }
            None => write_json_response(&mut stream, 404, r#"{"error":"no_analysis"}"#),
        },
        ("GET", "/results/report.html") => match current_analysis(&request, sessions) {
            Some(result) => {
                let page = render::results_page(
                    &result.image.file_name,
                    &result.findings,
                    &result.severity,
                    &result.report,
                    result.annotated.as_ref().map(|_| ANNOTATED_PATH),
                );
                write_response(&mut stream, 200, "text/html; charset=utf-8", page.as_bytes(), &[])
            }
            None => write_json_response(&mut stream, 404, r#"{"error":"no_analysis"}"#),
        },
        ("GET", ANNOTATED_PATH) => {
            match current_analysis(&request, sessions).and_then(|r| r.annotated.as_ref()) {
                Some(annotated) => {
                    write_response(&mut stream, 200, "image/jpeg", &annotated.jpeg, &[])
                }
                None => write_json_response(&mut stream, 404, r#"{"error":"no_annotated_image"}"#),
            }
        }
        (_, "/health" | "/sessions" | "/analyze" | "/results" | "/results/report.html")
        | (_, ANNOTATED_PATH) => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn handle_analyze(
    stream: &mut TcpStream,
    request: HttpRequest,
    analyzer: &Analyzer,
    sessions: &mut SessionStore,
    cfg: &ApiConfig,
) -> Result<()> {
    let Some(file_name) = request.file_name() else {
        return write_json_response(stream, 400, r#"{"error":"missing_filename"}"#);
    };
    let session = request.session_id();
    let image = match UploadedImage::with_limit(&file_name, request.body, cfg.max_upload_bytes) {
        Ok(image) => image,
        Err(err) => {
            let body = serde_json::to_vec(&serde_json::json!({
                "error": "invalid_upload",
                "detail": err.to_string(),
            }))?;
            return write_response(stream, 400, "application/json", &body, &[]);
        }
    };

    let id = match session {
        Some(id) if sessions.touch(&id) => id,
        _ => sessions.create(),
    };

    let result = match analyzer.analyze(&image) {
        Ok(result) => result,
        Err(err) => {
            log::warn!("analysis of {} failed: {:#}", image.file_name(), err);
            return write_json_response(stream, 422, r#"{"error":"unsupported_image"}"#);
        }
    };

    let body = serde_json::to_vec(&serde_json::json!({
        "session": id.as_str(),
        "file_name": result.image.file_name,
        "findings": result.findings,
        "severity": result.severity,
        "report_source": result.report.source,
        "results": "/results",
    }))?;
    sessions.store_analysis(&id, result)?;
    let cookie = session_cookie(&id, cfg.session_ttl);
    write_response(stream, 200, "application/json", &body, &[("Set-Cookie", cookie)])
}

fn current_analysis<'a>(
    request: &HttpRequest,
    sessions: &'a mut SessionStore,
) -> Option<&'a AnalysisResult> {
    let id = request.session_id()?;
    sessions.last_analysis(&id)
}

fn results_json(result: &AnalysisResult) -> serde_json::Value {
    serde_json::json!({
        "image": result.image,
        "annotated_image": result.annotated.as_ref().map(|_| ANNOTATED_PATH),
        "findings": result.findings,
        "severity": result.severity,
        "narrative": result.severity.narrative(),
        "report": {
            "markdown": result.report.markdown,
            "source": result.report.source,
        },
    })
}

fn session_cookie(id: &SessionId, ttl: Duration) -> String {
    format!(
        "{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        id,
        ttl.as_secs()
    )
}

enum ReadOutcome {
    Request(HttpRequest),
    TooLarge,
}

fn read_request(stream: &mut TcpStream, cfg: &ApiConfig) -> Result<ReadOutcome> {
    stream.set_read_timeout(Some(cfg.read_timeout))?;
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before request headers completed"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };
    if content_length > cfg.max_upload_bytes {
        return Ok(ReadOutcome::TooLarge);
    }

    let mut body = data.split_off(header_end + 4);
    body.truncate(content_length);
    while body.len() < content_length {
        let want = (content_length - body.len()).min(buf.len());
        let n = stream.read(&mut buf[..want])?;
        if n == 0 {
            return Err(anyhow!("connection closed before request body completed"));
        }
        body.extend_from_slice(&buf[..n]);
    }

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path.to_string(), parse_query(query)),
        None => (raw_path.to_string(), HashMap::new()),
    };
    Ok(ReadOutcome::Request(HttpRequest {
        method: method.to_string(),
        path,
        query,
        headers,
        body,
    }))
}

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes(), &[])
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
    extra_headers: &[(&str, String)],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        201 => "HTTP/1.1 201 Created",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        422 => "HTTP/1.1 422 Unprocessable Entity",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let mut header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n",
        len = body.len()
    );
    for (name, value) in extra_headers {
        header.push_str(&format!("{name}: {value}\r\n"));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    /// Session from the `session` cookie, else the `X-Session-Id` header.
    fn session_id(&self) -> Option<SessionId> {
        let from_cookie = self.headers.get("cookie").and_then(|cookies| {
            cookies.split(';').find_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                (name == SESSION_COOKIE).then(|| SessionId::parse(value)).flatten()
            })
        });
        from_cookie.or_else(|| {
            self.headers
                .get(SESSION_HEADER)
                .and_then(|value| SessionId::parse(value))
        })
    }

    /// Upload name from `?filename=` or the `X-Filename` header.
    fn file_name(&self) -> Option<String> {
        self.query
            .get("filename")
            .or_else(|| self.headers.get("x-filename"))
            .filter(|name| !name.trim().is_empty())
            .cloned()
    }
}
