//! In-process HTTP server for exercising the HTTP transport in tests.
//!
//! Answers every GET with an empty 200 and every POST with the frame built by
//! a responder closure. One request per connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::types::{Request, Response};

type Responder = Arc<dyn Fn(&Request) -> Response + Send + Sync>;

#[derive(Clone, Copy, Default)]
pub(crate) struct Delays {
    pub get: Duration,
    pub post: Duration,
}

pub(crate) struct HttpStub {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl HttpStub {
    pub(crate) async fn serve<F>(respond: F) -> Self
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        Self::with_delays(Delays::default(), respond).await
    }

    pub(crate) async fn with_delays<F>(delays: Delays, respond: F) -> Self
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let respond: Responder = Arc::new(respond);

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let respond = respond.clone();
                tokio::spawn(async move {
                    let _ = handle(stream, delays, respond).await;
                });
            }
        });

        Self { addr, task }
    }

    pub(crate) fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for HttpStub {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle(mut stream: TcpStream, delays: Delays, respond: Responder) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body_end = buf.len().min(header_end + content_length);
    let body = &buf[header_end..body_end];

    let (delay, payload) = if head.starts_with("POST") {
        let request: Request = serde_json::from_slice(body)?;
        (delays.post, serde_json::to_string(&respond(&request))?)
    } else {
        (delays.get, String::new())
    };
    tokio::time::sleep(delay).await;

    let reply = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        payload.len(),
        payload
    );
    stream.write_all(reply.as_bytes()).await?;
    stream.shutdown().await
}
