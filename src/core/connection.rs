use crate::core::protocols::{self, AsciiCommand, AsciiResponse, ProtocolError, ResponseKind};
use crate::core::server::{Server, ServerAddr};
use bytes::BytesMut;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

const INITIAL_BUFFER_SIZE: usize = 4096;

/// Byte stream a connection runs over (TCP or unix socket)
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Lifecycle of a connection. Transitions happen only through the pool's
/// checkout and check-in, or through a failure closing the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    InUse,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionTimeouts {
    pub connect: Duration,
    pub io: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(1),
            io: Duration::from_secs(1),
        }
    }
}

/// A single connection to one memcached server
pub struct Connection {
    server: Arc<Server>,
    stream: Box<dyn Transport>,
    buffer: BytesMut,
    state: ConnectionState,
    io_timeout: Duration,
    /// A request was written and its full reply has not been read yet
    in_flight: bool,
    bytes_sent: usize,
    created_at: Instant,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.server.address())
            .field("state", &self.state)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

/// Tune a TCP socket for small request/response round trips
fn optimize_socket_for_latency(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);

    let socket_ref = socket2::SockRef::from(stream);
    let _ = socket_ref.set_keepalive(true);
    let _ = socket_ref.set_send_buffer_size(32768);
    let _ = socket_ref.set_recv_buffer_size(32768);
}

impl Connection {
    /// Open a connection, failing with `ConnectionError::Connect` on refusal
    /// or when the connect timeout elapses.
    pub async fn connect(
        server: Arc<Server>,
        timeouts: ConnectionTimeouts,
    ) -> Result<Self, ConnectionError> {
        let stream: Box<dyn Transport> = match server.addr() {
            ServerAddr::Tcp { .. } => {
                let stream = timeout(timeouts.connect, TcpStream::connect(server.address()))
                    .await
                    .map_err(|_| {
                        ConnectionError::Connect(format!(
                            "Connection to {} timed out after {:?}",
                            server, timeouts.connect
                        ))
                    })?
                    .map_err(|e| ConnectionError::Connect(format!("{}: {}", server, e)))?;
                optimize_socket_for_latency(&stream);
                Box::new(stream)
            }
            #[cfg(unix)]
            ServerAddr::Unix(path) => {
                let stream = timeout(timeouts.connect, tokio::net::UnixStream::connect(path))
                    .await
                    .map_err(|_| {
                        ConnectionError::Connect(format!(
                            "Connection to {} timed out after {:?}",
                            server, timeouts.connect
                        ))
                    })?
                    .map_err(|e| ConnectionError::Connect(format!("{}: {}", server, e)))?;
                Box::new(stream)
            }
            #[cfg(not(unix))]
            ServerAddr::Unix(_) => {
                return Err(ConnectionError::Connect(format!(
                    "{}: unix sockets are not supported on this platform",
                    server
                )))
            }
        };

        debug!("Connected to {}", server);
        Ok(Self::from_transport(server, stream, timeouts.io))
    }

    /// Wrap an already established stream
    pub fn from_transport(
        server: Arc<Server>,
        stream: Box<dyn Transport>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            server,
            stream,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            state: ConnectionState::Idle,
            io_timeout,
            in_flight: false,
            bytes_sent: 0,
            created_at: Instant::now(),
        }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether any byte of the current request reached the socket
    pub fn has_sent(&self) -> bool {
        self.bytes_sent > 0
    }

    pub(crate) fn mark_in_use(&mut self) {
        if self.state == ConnectionState::Idle {
            self.state = ConnectionState::InUse;
        }
    }

    /// Return to the pool's idle set. Returns `false` when the connection
    /// must be discarded instead: it is closed, or a reply is still
    /// outstanding (the caller gave up mid-request) so the stream can no
    /// longer be trusted to be in sync.
    pub(crate) fn check_in(&mut self) -> bool {
        if self.in_flight {
            debug!("Discarding connection to {} with a reply in flight", self.server);
            self.state = ConnectionState::Closed;
        }
        if self.state == ConnectionState::Closed {
            return false;
        }
        self.state = ConnectionState::Idle;
        true
    }

    /// Write a complete frame
    pub async fn send(&mut self, frame: &[u8]) -> Result<(), ConnectionError> {
        self.bytes_sent = 0;
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.in_flight = true;

        let io_timeout = self.io_timeout;
        let result = timeout(io_timeout, async {
            while self.bytes_sent < frame.len() {
                let n = self.stream.write(&frame[self.bytes_sent..]).await?;
                if n == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "socket accepted zero bytes",
                    ));
                }
                self.bytes_sent += n;
            }
            self.stream.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => {
                trace!("Sent {} bytes to {}", frame.len(), self.server);
                Ok(())
            }
            Ok(Err(e)) => Err(self.fail(ConnectionError::Io(e.to_string()))),
            Err(_) => Err(self.fail(ConnectionError::Timeout(io_timeout))),
        }
    }

    /// Read until one complete reply of the given shape is buffered
    pub async fn receive(&mut self, kind: ResponseKind) -> Result<AsciiResponse, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let deadline = tokio::time::Instant::now() + self.io_timeout;
        loop {
            match protocols::decode(&mut self.buffer, kind) {
                Ok(Some(response)) => {
                    self.in_flight = false;
                    return Ok(response);
                }
                Ok(None) => {}
                Err(e) => return Err(self.fail(ConnectionError::Protocol(e))),
            }

            let read =
                tokio::time::timeout_at(deadline, self.stream.read_buf(&mut self.buffer)).await;
            match read {
                Ok(Ok(0)) => return Err(self.fail(ConnectionError::Eof)),
                Ok(Ok(n)) => trace!("Read {} bytes from {}", n, self.server),
                Ok(Err(e)) => return Err(self.fail(ConnectionError::Io(e.to_string()))),
                Err(_) => return Err(self.fail(ConnectionError::Timeout(self.io_timeout))),
            }
        }
    }

    /// Encode, send and wait for the reply
    pub async fn request(
        &mut self,
        command: &AsciiCommand<'_>,
    ) -> Result<AsciiResponse, ConnectionError> {
        let frame = command.to_bytes();
        self.send(&frame).await?;
        self.receive(command.response_kind()).await
    }

    /// Close the connection; every later operation fails with `Closed`
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.state = ConnectionState::Closed;
        if !self.in_flight {
            let _ = timeout(self.io_timeout, async {
                self.stream.write_all(&AsciiCommand::Quit.to_bytes()).await?;
                self.stream.shutdown().await
            })
            .await;
        }
        debug!("Closed connection to {}", self.server);
    }

    /// Mark closed without any further I/O
    pub fn invalidate(&mut self) {
        self.state = ConnectionState::Closed;
    }

    fn fail(&mut self, error: ConnectionError) -> ConnectionError {
        debug!("Connection to {} failed: {}", self.server, error);
        self.state = ConnectionState::Closed;
        error
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Server closed the connection")]
    Eof,
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Connection is closed")]
    Closed,
}

impl ConnectionError {
    /// Network-level failures that say something about the server's health
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            ConnectionError::Connect(_)
                | ConnectionError::Io(_)
                | ConnectionError::Eof
                | ConnectionError::Timeout(_)
        )
    }
}
