//! Shared utilities for integration and load testing.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use resilient_gateway::config::{EndpointConfig, GatewayConfig};
use resilient_gateway::Role;

/// What a mock backend answers to one request.
pub struct MockReply {
    pub status: u16,
    pub body: String,
    pub delay: Duration,
}

impl MockReply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A running mock backend.
pub struct MockBackend {
    pub addr: SocketAddr,
    requests: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl MockBackend {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Requests answered so far (including probes).
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

/// Start a programmable backend on an ephemeral port.
///
/// The handler sees the method and path of every request.
pub async fn start_programmable_backend<F, Fut>(f: F) -> MockBackend
where
    F: Fn(String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MockReply> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(AtomicUsize::new(0));
    let f = Arc::new(f);

    let counter = requests.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    let f = f.clone();
                    let counter = counter.clone();
                    tokio::spawn(async move {
                        let _ = serve(socket, f, counter).await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    MockBackend { addr, requests }
}

/// Start a backend that answers 200 with a fixed body.
#[allow(dead_code)]
pub async fn start_mock_backend(response: &'static str) -> MockBackend {
    start_programmable_backend(move |_, _| async move { MockReply::ok(response) }).await
}

async fn serve<F, Fut>(
    mut socket: TcpStream,
    f: Arc<F>,
    counter: Arc<AtomicUsize>,
) -> std::io::Result<()>
where
    F: Fn(String, String) -> Fut,
    Fut: Future<Output = MockReply>,
{
    let Some((method, path)) = read_request(&mut socket).await? else {
        return Ok(());
    };
    counter.fetch_add(1, Ordering::SeqCst);

    let reply = f(method, path).await;
    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }

    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        reply.status,
        reason(reply.status),
        reply.body.len(),
        reply.body
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await
}

/// Read the request head and body; returns the method and path.
async fn read_request(socket: &mut TcpStream) -> std::io::Result<Option<(String, String)>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();

    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut body_read = buf.len() - head_end;
    while body_read < content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body_read += n;
    }

    Ok(Some((method, path)))
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[allow(dead_code)]
pub fn endpoint(id: &str, role: Role, base_url: String, timeout_ms: u64) -> EndpointConfig {
    EndpointConfig {
        id: id.to_string(),
        role,
        base_url,
        timeout_ms,
        probe_path: "/health".to_string(),
        invoke_path: "/generate".to_string(),
    }
}

/// Two AI endpoints, memory storage, tight timings.
#[allow(dead_code)]
pub fn ai_config(primary: &MockBackend, secondary: &MockBackend) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config
        .endpoints
        .push(endpoint("ai.primary", Role::AiPrimary, primary.url(), 1_000));
    config
        .endpoints
        .push(endpoint("ai.secondary", Role::AiSecondary, secondary.url(), 1_000));
    config
}
