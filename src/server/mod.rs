//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and hands each HTTP/1.1 request to an [`Engine`].
//! Supports HTTP/1.1 persistent connections (keep-alive) out of the box.
//!
//! Handler chains are synchronous, so each dispatch runs on Tokio's blocking
//! pool and the connection task only does socket I/O.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The HTTP listener in front of an [`Engine`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use trellis::config::EngineConfig;
/// use trellis::engine::Engine;
/// use trellis::router::RouteTable;
/// use trellis::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut routes = RouteTable::new();
///     routes.get("/", |ctx| {
///         ctx.write_str("Hello!")?;
///         Ok(())
///     });
///     let engine = Arc::new(Engine::new(EngineConfig::default(), routes));
///
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.serve(engine).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections and dispatching requests to `engine`.
    ///
    /// Runs until the process is terminated or the task is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn serve(self, engine: Arc<Engine>) -> Result<(), ServerError> {
        info!(address = %self.local_addr, "listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let engine = Arc::clone(&engine);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, engine).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default. Every complete request
/// already in the buffer is answered before the socket is read again, so
/// pipelined requests arriving in one segment are all served. The loop ends
/// when the peer closes the connection or signals `Connection: close`.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    engine: Arc<Engine>,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        match Request::parse(&buf) {
            Ok((request, body_offset)) => {
                let content_length = request.content_length().unwrap_or(0);
                if content_length > MAX_REQUEST_SIZE.saturating_sub(body_offset) {
                    warn!(peer = %peer_addr, content_length, "declared body too large, sending 413");
                    return reject(&mut stream, too_large()).await;
                }

                // Wait for the full body before dispatching.
                let total_needed = body_offset + content_length;
                if buf.len() >= total_needed {
                    let keep_alive = request.is_keep_alive();
                    let response = dispatch(&engine, request.with_peer_addr(peer_addr)).await;
                    stream
                        .write_all(&response.keep_alive(keep_alive).into_bytes())
                        .await?;
                    stream.flush().await?;

                    // Drop the consumed request bytes from the buffer.
                    let _ = buf.split_to(total_needed);

                    if !keep_alive {
                        debug!(peer = %peer_addr, "Connection: close, shutting down");
                        return Ok(());
                    }
                    continue;
                }
            }
            Err(RequestError::Incomplete) => {}
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = Response::new(StatusCode::BAD_REQUEST)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                return reject(&mut stream, response).await;
            }
        }

        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large, sending 413");
            return reject(&mut stream, too_large()).await;
        }

        if stream.read_buf(&mut buf).await? == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            return Ok(());
        }
    }
}

async fn dispatch(engine: &Arc<Engine>, request: Request) -> Response {
    debug!(
        peer = ?request.peer_addr(),
        method = %request.method(),
        path = %request.path(),
        "dispatching request"
    );
    let engine = Arc::clone(engine);
    match tokio::task::spawn_blocking(move || engine.serve(request)).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "dispatch task failed");
            Response::new(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn too_large() -> Response {
    Response::new(StatusCode::PAYLOAD_TOO_LARGE)
        .body("Request entity too large")
        .keep_alive(false)
}

async fn reject(stream: &mut TcpStream, response: Response) -> Result<(), std::io::Error> {
    stream.write_all(&response.into_bytes()).await?;
    stream.flush().await
}
