//! TCP server for answering policy requests.
//!
//! Accepts connections and hands each one to its own task. A connection
//! carries exactly one request: read once, classify, write once, close.

use crate::buffer::BufferPool;
use crate::config::Config;
use crate::protocol::{self, ClassifyError, Request};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

/// Server instance
pub struct Server {
    config: Config,
    pool: Arc<BufferPool>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let pool = Arc::new(BufferPool::new(config.pool_size));
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Server {
            config,
            pool,
            connection_limit,
        }
    }

    /// Bind, then serve until Ctrl-C
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = self.bind().await?;
        info!(
            address = %listener.local_addr()?,
            timeout_ms = self.config.timeout.as_millis() as u64,
            buffer_size = self.config.buffer_size,
            pool_capacity = self.pool.capacity(),
            "Server listening"
        );

        self.serve(listener, shutdown_signal()).await?;
        info!("Shutting down");
        Ok(())
    }

    /// Create the listening socket
    pub async fn bind(&self) -> io::Result<TcpListener> {
        let addr = resolve(&self.config.listen).await?;

        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.config.backlog)?;

        TcpListener::from_std(socket.into())
    }

    /// Accept connections until `shutdown` resolves or accept fails.
    ///
    /// An accept error ends the loop and is returned. On shutdown the
    /// listener is closed and in-flight connections are given time to finish.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.connection_limit.clone().acquire_owned() => {
                    permit.map_err(io::Error::other)?
                }
            };

            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        return Err(e);
                    }
                },
            };

            debug!(peer = %peer, "New connection");

            let pool = Arc::clone(&self.pool);
            let buffer_size = self.config.buffer_size;
            let timeout = self.config.timeout;

            tokio::spawn(async move {
                match handle_connection(stream, &pool, buffer_size, timeout).await {
                    Ok(request) => debug!(peer = %peer, %request, "Request served"),
                    Err(e) => debug!(peer = %peer, error = %e, "Connection aborted"),
                }
                drop(permit);
            });
        }

        drop(listener);
        self.drain().await;
        Ok(())
    }

    /// Wait for in-flight connections. Each one is bounded by a read and a
    /// write deadline, so two timeouts is enough.
    async fn drain(&self) {
        let all = self.config.max_connections as u32;
        match time::timeout(
            self.config.timeout * 2,
            self.connection_limit.acquire_many(all),
        )
        .await
        {
            Ok(_) => debug!(pooled = self.pool.len(), "All connections drained"),
            Err(_) => {
                let in_flight =
                    self.config.max_connections - self.connection_limit.available_permits();
                warn!(in_flight, "Connections still open at shutdown");
            }
        }
    }

    /// Get a reference to the buffer pool for testing
    #[cfg(test)]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

/// Resolve a `host:port` string to the first matching address
async fn resolve(listen: &str) -> io::Result<SocketAddr> {
    tokio::net::lookup_host(listen).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address found for '{}'", listen),
        )
    })
}

/// Resolves on Ctrl-C. Never resolves if the handler can't be installed.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
}

/// Why a connection was closed without a complete response
#[derive(Debug)]
pub enum ConnectionError {
    /// Nothing arrived before the read deadline
    ReadTimeout,
    /// Reading the request failed
    Read(io::Error),
    /// The request matched no known request
    Unknown(ClassifyError),
    /// The response could not be written before the write deadline
    WriteTimeout,
    /// Writing the response failed
    Write(io::Error),
    /// Only part of the response was written
    ShortWrite { written: usize, expected: usize },
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::ReadTimeout => write!(f, "read timed out"),
            ConnectionError::Read(e) => write!(f, "read failed: {}", e),
            ConnectionError::Unknown(e) => write!(f, "{}", e),
            ConnectionError::WriteTimeout => write!(f, "write timed out"),
            ConnectionError::Write(e) => write!(f, "write failed: {}", e),
            ConnectionError::ShortWrite { written, expected } => {
                write!(f, "short write: {} of {} bytes", written, expected)
            }
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Read(e) | ConnectionError::Write(e) => Some(e),
            ConnectionError::Unknown(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ClassifyError> for ConnectionError {
    fn from(e: ClassifyError) -> Self {
        ConnectionError::Unknown(e)
    }
}

/// Handle a single client connection.
///
/// Reads once under a deadline, classifies exactly the bytes read, and
/// writes the response once under a fresh deadline. Any failure ends the
/// connection without a retry. The buffer goes back to the pool and the
/// stream is closed when this returns, whatever the outcome.
async fn handle_connection<S>(
    mut stream: S,
    pool: &Arc<BufferPool>,
    buffer_size: usize,
    timeout: Duration,
) -> Result<Request, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = pool.checkout(buffer_size);

    let n = time::timeout(timeout, stream.read(&mut buf[..]))
        .await
        .map_err(|_| ConnectionError::ReadTimeout)?
        .map_err(ConnectionError::Read)?;

    trace!(request = %protocol::escape(&buf[..n]), "Got request");
    let request = protocol::classify(&buf[..n])?;
    trace!(%request, "Classified request");

    let response = request.response();
    let written = time::timeout(timeout, stream.write(response))
        .await
        .map_err(|_| ConnectionError::WriteTimeout)?
        .map_err(ConnectionError::Write)?;

    if written != response.len() {
        return Err(ConnectionError::ShortWrite {
            written,
            expected: response.len(),
        });
    }

    Ok(request)
}
