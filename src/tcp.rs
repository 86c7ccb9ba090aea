//! Line-delimited text channel over a single TCP connection.
//!
//! The endpoint decides the role: a wildcard address (`0.0.0.0`, `::`) makes
//! this side a server that accepts exactly one peer, anything else is dialed.
//! Connecting, accepting and reading happen on a worker task per connection;
//! the worker only posts [`ChannelEvent`]s and never touches the consumer.

use crate::channel::{ChannelEvent, ChannelEventSender, SignalingChannel};
use crate::error::{Result, SignalingError};
use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    /// Binds and waits for one peer.
    Server,
    /// Dials the configured address.
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketEndpoint {
    pub address: SocketAddr,
    pub role: SocketRole,
}

impl SocketEndpoint {
    pub fn new(address: SocketAddr) -> Self {
        let role = if address.ip().is_unspecified() {
            SocketRole::Server
        } else {
            SocketRole::Client
        };
        Self { address, role }
    }

    /// Builds an endpoint from a textual IP (brackets around IPv6 allowed).
    pub fn parse(ip: &str, port: u16) -> Result<Self> {
        let bare = ip
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(ip);
        let bare: IpAddr = bare
            .parse()
            .map_err(|_| SignalingError::InvalidAddress(ip.to_string()))?;
        Ok(Self::new(SocketAddr::new(bare, port)))
    }

    pub fn is_server(&self) -> bool {
        self.role == SocketRole::Server
    }
}

fn post(events: &ChannelEventSender, event: ChannelEvent) {
    if events.send(event).is_err() {
        trace!("Channel event receiver dropped");
    }
}

fn report_error(events: &ChannelEventSender, message: String) {
    error!("TCP Error: {message}");
    post(events, ChannelEvent::Error(message));
}

type Writer = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

struct Connection {
    // `None` once the connection is closed locally or by the peer. Only the
    // slot is locked here; writes lock the writer itself.
    writer: std::sync::Mutex<Option<Writer>>,
    events: ChannelEventSender,
}

impl Connection {
    fn new(events: ChannelEventSender) -> Self {
        Self {
            writer: std::sync::Mutex::new(None),
            events,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Writer>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attach(&self, writer: OwnedWriteHalf) {
        *self.slot() = Some(Arc::new(Mutex::new(BufWriter::new(writer))));
    }

    fn post(&self, event: ChannelEvent) {
        post(&self.events, event);
    }

    fn report_error(&self, message: String) {
        report_error(&self.events, message);
    }

    fn is_closed(&self) -> bool {
        self.slot().is_none()
    }

    async fn send(&self, message: &str) {
        let writer = self.slot().clone();
        let Some(writer) = writer else {
            self.report_error("Sending data on closed socket.".to_string());
            return;
        };

        trace!("Send: {message}");
        let result = async {
            let mut writer = writer.lock().await;
            writer.write_all(message.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            self.report_error(format!("Failed to write to socket: {e}"));
        }
    }

    /// Closes the socket if it is still open and fires [`ChannelEvent::Closed`].
    async fn close(&self) {
        let writer = self.slot().take();
        let Some(writer) = writer else {
            return;
        };
        match writer.try_lock() {
            Ok(mut writer) => {
                if let Err(e) = writer.shutdown().await {
                    debug!("Failed to shut down socket: {e}");
                }
            }
            // The socket goes away with the last handle once the write ends.
            Err(_) => debug!("Write in progress, socket released when it completes"),
        }
        self.post(ChannelEvent::Closed);
    }

    /// Drops the socket without reporting the close.
    fn discard(&self) {
        self.slot().take();
    }
}

struct Active {
    connection: Arc<Connection>,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

/// Socket transport for direct two-party sessions.
pub struct TcpChannel {
    endpoint: SocketEndpoint,
    events: ChannelEventSender,
    active: Mutex<Option<Active>>,
    join_timeout: Duration,
}

impl TcpChannel {
    pub fn new(endpoint: SocketEndpoint, events: ChannelEventSender, join_timeout: Duration) -> Self {
        Self {
            endpoint,
            events,
            active: Mutex::new(None),
            join_timeout,
        }
    }

    /// Starts the single connection attempt. A server binds before this
    /// returns, so a peer may dial as soon as it completes.
    pub async fn connect(&self) {
        let stale = self.active.lock().await.take();
        if let Some(stale) = stale {
            error!("Socket already existed and will be replaced.");
            stale.connection.discard();
            self.stop(stale).await;
        }

        let connection = Arc::new(Connection::new(self.events.clone()));
        let listener = match self.endpoint.role {
            SocketRole::Server => {
                info!("Listening on {}", self.endpoint.address);
                match TcpListener::bind(self.endpoint.address).await {
                    Ok(listener) => Some(listener),
                    Err(e) => {
                        connection.report_error(format!("Failed to create server socket: {e}"));
                        return;
                    }
                }
            }
            SocketRole::Client => None,
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(run_worker(
            self.endpoint,
            listener,
            connection.clone(),
            shutdown_rx,
        ));
        *self.active.lock().await = Some(Active {
            connection,
            shutdown,
            worker,
        });
    }

    async fn stop(&self, active: Active) {
        let _ = active.shutdown.send(true);
        match tokio::time::timeout(self.join_timeout, active.worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Socket worker failed: {e}"),
            Err(_) => warn!(
                "Socket worker did not exit within {:?}, continuing shutdown",
                self.join_timeout
            ),
        }
    }
}

#[async_trait]
impl SignalingChannel for TcpChannel {
    async fn send(&self, message: &str) {
        let connection = self
            .active
            .lock()
            .await
            .as_ref()
            .map(|active| active.connection.clone());
        match connection {
            Some(connection) => connection.send(message).await,
            None => report_error(&self.events, "Sending data on closed socket.".to_string()),
        }
    }

    async fn disconnect(&self) {
        let Some(active) = self.active.lock().await.take() else {
            return;
        };
        active.connection.close().await;
        self.stop(active).await;
    }
}

async fn establish(
    endpoint: SocketEndpoint,
    listener: Option<TcpListener>,
) -> std::result::Result<TcpStream, String> {
    match listener {
        Some(listener) => {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| format!("Failed to receive connection: {e}"))?;
            info!("Accepted connection from {peer}");
            Ok(stream)
        }
        None => {
            info!("Connecting to {}", endpoint.address);
            TcpStream::connect(endpoint.address)
                .await
                .map_err(|e| format!("Failed to connect: {e}"))
        }
    }
}

async fn run_worker(
    endpoint: SocketEndpoint,
    listener: Option<TcpListener>,
    connection: Arc<Connection>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Socket worker started for {}", endpoint.address);
    let stream = tokio::select! {
        result = establish(endpoint, listener) => match result {
            Ok(stream) => stream,
            Err(message) => {
                connection.report_error(message);
                return;
            }
        },
        _ = shutdown.changed() => {
            debug!("Socket worker stopped before a connection was established");
            return;
        }
    };

    let (reader, writer) = stream.into_split();
    connection.attach(writer);
    info!("TCP connection established.");
    connection.post(ChannelEvent::Connected {
        is_server: endpoint.is_server(),
    });

    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            line = lines.next_line() => match line {
                Ok(Some(message)) => {
                    trace!("Receive: {message}");
                    connection.post(ChannelEvent::Message(message));
                }
                Ok(None) => break,
                Err(e) => {
                    // A read failing after a local close is expected.
                    if !connection.is_closed() {
                        connection.report_error(format!("Failed to read from socket: {e}"));
                    }
                    break;
                }
            }
        }
    }

    debug!("Receiving worker exiting...");
    connection.close().await;
}
