//! Per-target probe phases
//!
//! transport connect (with inline TLS handshake), optional HEAD request,
//! certificate details, and failure classification.

use crate::contracts::*;
use crate::engine::NeighborTable;
use chrono::{DateTime, Utc};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{self, ClientConfig, ClientConnection, OwnedTrustAnchor, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;

/// User-Agent sent with HEAD probes
pub const PROBE_USER_AGENT: &str = concat!("connectivity-watch/", env!("CARGO_PKG_VERSION"));

/// Upper bound on response head size
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// TLS connector trusting the bundled webpki roots
pub fn default_tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Why a probe did not complete
#[derive(Debug)]
enum ProbeFailure {
    Timeout,
    Refused,
    Tls(String),
    Other(String),
}

impl ProbeFailure {
    fn code(&self) -> ProbeCode {
        match self {
            ProbeFailure::Timeout => ProbeCode::TcpTimeout,
            ProbeFailure::Refused => ProbeCode::TcpRefused,
            ProbeFailure::Tls(_) => ProbeCode::TlsFail,
            ProbeFailure::Other(_) => ProbeCode::Unknown,
        }
    }

    /// Only unclassified failures carry their error text
    fn note(self) -> Option<String> {
        match self {
            ProbeFailure::Other(text) => Some(text),
            _ => None,
        }
    }

    /// Errors raised while the TLS handshake is in progress
    fn from_handshake(err: io::Error) -> Self {
        let is_tls = err
            .get_ref()
            .map(|inner| inner.is::<rustls::Error>())
            .unwrap_or(false);
        match err.kind() {
            io::ErrorKind::TimedOut => ProbeFailure::Timeout,
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
                ProbeFailure::Tls(err.to_string())
            }
            _ if is_tls => ProbeFailure::Tls(err.to_string()),
            _ => ProbeFailure::from(err),
        }
    }
}

impl From<io::Error> for ProbeFailure {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => ProbeFailure::Timeout,
            io::ErrorKind::ConnectionRefused => ProbeFailure::Refused,
            _ => ProbeFailure::Other(err.to_string()),
        }
    }
}

enum Connection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// Probe one target. Never fails; errors become status codes.
pub async fn probe_target(
    target: &TargetSpec,
    tls: &TlsConnector,
    neighbors: &dyn NeighborTable,
) -> TargetStatus {
    let mut status = TargetStatus::failed(&target.name, ProbeCode::Unknown);

    if let Err(failure) = run_phases(target, tls, &mut status).await {
        status.up = false;
        status.code = failure.code();
        if let Some(note) = failure.note() {
            status.note = Some(note);
        }
    }

    // Link layer present but transport blocked is a different signal from
    // "host absent"; only the code changes, never the verdict.
    if !status.up && status.code.is_transport_failure() && neighbors.has_entry(&target.host).await
    {
        status.code = ProbeCode::L2PresentL3Blocked;
    }

    status
}

async fn run_phases(
    target: &TargetSpec,
    tls: &TlsConnector,
    status: &mut TargetStatus,
) -> Result<(), ProbeFailure> {
    let start = Instant::now();
    let connection = timeout(target.timeout, open(target, tls))
        .await
        .map_err(|_| ProbeFailure::Timeout)??;
    let tcp_ms = elapsed_ms(start);
    status.tcp_ms = Some(tcp_ms);

    match connection {
        Connection::Plain(mut stream) => {
            let result = finish(&mut stream, target, status).await;
            close(&mut stream, target.timeout).await;
            result
        }
        Connection::Tls(mut stream) => {
            status.tls_ms = Some(tcp_ms);
            status.note = certificate_note(stream.get_ref().1);
            let result = finish(stream.as_mut(), target, status).await;
            close(stream.as_mut(), target.timeout).await;
            result
        }
    }
}

async fn open(target: &TargetSpec, tls: &TlsConnector) -> Result<Connection, ProbeFailure> {
    let tcp = TcpStream::connect((target.host.as_str(), target.port)).await?;
    if !target.use_tls {
        return Ok(Connection::Plain(tcp));
    }

    let server_name = ServerName::try_from(target.server_name())
        .map_err(|e| ProbeFailure::Tls(format!("invalid server name: {}", e)))?;
    let stream = tls
        .connect(server_name, tcp)
        .await
        .map_err(ProbeFailure::from_handshake)?;
    Ok(Connection::Tls(Box::new(stream)))
}

/// HTTP phase if configured, otherwise a bare connect counts as success
async fn finish<S>(
    stream: &mut S,
    target: &TargetSpec,
    status: &mut TargetStatus,
) -> Result<(), ProbeFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(path) = target.http_path.as_deref() else {
        status.up = true;
        status.code = ProbeCode::Success;
        return Ok(());
    };

    let start = Instant::now();
    let code = timeout(target.timeout, head_request(stream, target, path))
        .await
        .map_err(|_| ProbeFailure::Timeout)??;
    status.http_ms = Some(elapsed_ms(start));

    let (up, probe_code) = classify_http_status(code);
    status.up = up;
    status.code = probe_code;
    Ok(())
}

async fn head_request<S>(stream: &mut S, target: &TargetSpec, path: &str) -> Result<u16, ProbeFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = build_head_request(target.server_name(), path);
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = read_response_head(stream).await?;
    parse_status_line(&head)
}

/// Minimal HTTP/1.1 HEAD request
pub fn build_head_request(host: &str, path: &str) -> String {
    let path = if path.is_empty() { "/" } else { path };
    format!(
        "HEAD {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nConnection: close\r\n\r\n",
        path, host, PROBE_USER_AGENT
    )
}

async fn read_response_head<S>(stream: &mut S) -> Result<Vec<u8>, ProbeFailure>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(512);
    let mut chunk = [0u8; 1024];
    loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            // Peer closed early; a complete status line is still usable.
            if head.windows(2).any(|w| w == b"\r\n".as_slice()) {
                return Ok(head);
            }
            return Err(ProbeFailure::Other(
                "connection closed before response headers".to_string(),
            ));
        }
        head.extend_from_slice(&chunk[..read]);
        if head.windows(4).any(|w| w == b"\r\n\r\n".as_slice()) {
            return Ok(head);
        }
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(ProbeFailure::Other("response headers too large".to_string()));
        }
    }
}

fn parse_status_line(head: &[u8]) -> Result<u16, ProbeFailure> {
    let text = String::from_utf8_lossy(head);
    let line = text.split("\r\n").next().unwrap_or_default();
    line.split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| ProbeFailure::Other(format!("malformed status line: {:?}", line)))
}

/// Map an HTTP status to the reachability verdict and code
pub fn classify_http_status(code: u16) -> (bool, ProbeCode) {
    match code {
        400..=499 => (false, ProbeCode::Http4xx),
        500..=599 => (false, ProbeCode::Http5xx),
        _ => (true, ProbeCode::Success),
    }
}

/// `CN=<name>, exp=<YYYY-MM-DD>` from the leaf certificate, best effort
fn certificate_note(conn: &ClientConnection) -> Option<String> {
    let leaf = conn.peer_certificates()?.first()?;
    let (_, cert) = x509_parser::parse_x509_certificate(&leaf.0).ok()?;

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(|cn| format!("CN={}", cn));
    let expiry = DateTime::<Utc>::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .map(|ts| format!("exp={}", ts.date_naive()));

    let details: Vec<String> = cn.into_iter().chain(expiry).collect();
    if details.is_empty() {
        None
    } else {
        Some(details.join(", "))
    }
}

async fn close<S>(stream: &mut S, limit: Duration)
where
    S: AsyncWrite + Unpin,
{
    let _ = timeout(limit, stream.shutdown()).await;
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
