use std::fmt;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error as ThisError;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::codec::RespCodec;
use crate::config::ClientConfig;
use crate::message::Message;
use crate::Result;

#[derive(Debug, ThisError)]
pub enum ConnectionError {
    #[error("not yet connected")]
    NotConnected,
    #[error("could not resolve endpoint {0}")]
    Unresolvable(String),
    #[error("connect to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },
    #[error("read timed out after {0} seconds")]
    ReadTimeout(i64),
    #[error("connection closed by peer")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Endpoint {
        Endpoint {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// How many decoded messages may sit in the delivery queue before the reader
/// task applies backpressure to the socket.
const DELIVERY_QUEUE_CAPACITY: usize = 64;

/// One TCP connection to the server.
///
/// Owns the socket exclusively: the write half behind a buffered writer, and
/// the read half driven by a background task that decodes incoming bytes and
/// feeds completed messages into a bounded delivery queue. The writer, queue
/// and task handles exist exactly while the state is `Connected`; any read
/// timeout, decode failure or peer close tears all of them down together,
/// since resuming a stream with uncertain framing alignment is unsafe. A torn
/// down connection can always be reconnected.
///
/// `Connection` itself is not synchronized; callers serialize access through
/// the lock in [`Client`](crate::client::Client).
pub struct Connection {
    id: Uuid,
    endpoint: Endpoint,
    config: ClientConfig,
    state: ConnectionState,
    socket: Option<Socket>,
}

struct Socket {
    writer: BufWriter<OwnedWriteHalf>,
    messages: mpsc::Receiver<Result<Message>>,
    reader: JoinHandle<()>,
}

impl Connection {
    pub fn new(endpoint: Endpoint, config: ClientConfig) -> Connection {
        Connection {
            id: Uuid::new_v4(),
            endpoint,
            config,
            state: ConnectionState::Disconnected,
            socket: None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Opens the TCP connection. A no-op when already connected.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;
        match self.open_socket().await {
            Ok(socket) => {
                self.socket = Some(socket);
                self.state = ConnectionState::Connected;
                trace!(connection_id = %self.id, endpoint = %self.endpoint, "connected");
                Ok(())
            }
            Err(err) => {
                self.state = ConnectionState::Disconnected;
                Err(err)
            }
        }
    }

    async fn open_socket(&self) -> Result<Socket> {
        let address = lookup_host((self.endpoint.host.as_str(), self.endpoint.port))
            .await?
            .next()
            .ok_or_else(|| ConnectionError::Unresolvable(self.endpoint.to_string()))?;

        let socket = if address.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(self.config.keep_alive)?;

        let connecting = socket.connect(address);
        let stream = match self.config.connect_timeout {
            Some(limit) => {
                timeout(limit, connecting)
                    .await
                    .map_err(|_| ConnectionError::ConnectTimeout {
                        endpoint: self.endpoint.to_string(),
                        timeout: limit,
                    })??
            }
            None => connecting.await?,
        };

        let (read_half, write_half) = stream.into_split();
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_QUEUE_CAPACITY);
        let frames = FramedRead::new(read_half, RespCodec::new(&self.config));
        let reader = tokio::spawn(route_messages(frames, delivery_tx, self.id));

        Ok(Socket {
            writer: BufWriter::new(write_half),
            messages: delivery_rx,
            reader,
        })
    }

    /// Encodes `message` onto the outbound buffer without flushing.
    pub async fn write(&mut self, message: &Message) -> Result<()> {
        let socket = self.socket.as_mut().ok_or(ConnectionError::NotConnected)?;
        if let Err(err) = socket.writer.write_all(&message.serialize()).await {
            self.disconnect();
            return Err(err.into());
        }
        Ok(())
    }

    /// Forces buffered bytes onto the wire.
    pub async fn flush(&mut self) -> Result<()> {
        let socket = self.socket.as_mut().ok_or(ConnectionError::NotConnected)?;
        if let Err(err) = socket.writer.flush().await {
            self.disconnect();
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn write_and_flush(&mut self, message: &Message) -> Result<()> {
        self.write(message).await?;
        self.flush().await
    }

    /// Waits for the next fully decoded message.
    ///
    /// A timeout, a decode failure or the peer closing the socket all force a
    /// transition to `Disconnected` before the error is surfaced: the framing
    /// position of a stream that failed mid-read can no longer be trusted.
    pub async fn read(&mut self) -> Result<Message> {
        let socket = self.socket.as_mut().ok_or(ConnectionError::NotConnected)?;

        let next = if self.config.read_timeout_secs < 0 {
            socket.messages.recv().await
        } else {
            let limit = Duration::from_secs(self.config.read_timeout_secs as u64);
            match timeout(limit, socket.messages.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(connection_id = %self.id, "read timed out");
                    self.disconnect();
                    return Err(ConnectionError::ReadTimeout(self.config.read_timeout_secs).into());
                }
            }
        };

        match next {
            Some(Ok(message)) => Ok(message),
            Some(Err(err)) => {
                self.disconnect();
                Err(err)
            }
            None => {
                self.disconnect();
                Err(ConnectionError::Closed.into())
            }
        }
    }

    /// Closes the socket and discards all in-flight state. Idempotent.
    pub fn disconnect(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.reader.abort();
            debug!(connection_id = %self.id, endpoint = %self.endpoint, "disconnected");
        }
        self.state = ConnectionState::Disconnected;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Reader-task loop: drains decoded messages from the socket into the
/// delivery queue until the peer closes, a decode error occurs, or the
/// receiving side of the queue is dropped.
async fn route_messages(
    mut frames: FramedRead<OwnedReadHalf, RespCodec>,
    queue: mpsc::Sender<Result<Message>>,
    connection_id: Uuid,
) {
    while let Some(result) = frames.next().await {
        let failed = result.is_err();
        if queue.send(result).await.is_err() {
            // Receiver dropped: the connection was torn down.
            return;
        }
        if failed {
            // Byte alignment beyond a decode error cannot be trusted.
            return;
        }
    }
    trace!(connection_id = %connection_id, "peer closed the connection");
    let _ = queue.send(Err(ConnectionError::Closed.into())).await;
}
