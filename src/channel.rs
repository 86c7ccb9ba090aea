//! The transport abstraction both signaling engines are built on.
//!
//! A channel is a dumb pipe for text messages. It never calls into the
//! engine directly: every state change is posted as a [`ChannelEvent`] on an
//! unbounded queue that the owning engine task drains.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An event produced by a signaling channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The connection is up. `is_server` is only meaningful for sockets.
    Connected { is_server: bool },
    /// One inbound application message.
    Message(String),
    Error(String),
    /// The connection went away. Fired at most once per connection.
    Closed,
}

pub type ChannelEventSender = mpsc::UnboundedSender<ChannelEvent>;
pub type ChannelEventReceiver = mpsc::UnboundedReceiver<ChannelEvent>;

/// Operations common to every signaling channel.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Sends one application message. Failures are reported as
    /// [`ChannelEvent::Error`].
    async fn send(&self, message: &str);

    /// Closes the channel. Calling it again is a no-op.
    async fn disconnect(&self);
}

/// Lifecycle of a relay channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    New,
    Connecting,
    Connected,
    Registered,
    Closed,
    Error,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Registered => "REGISTERED",
            Self::Closed => "CLOSED",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// A channel to a room relay server.
#[async_trait]
pub trait RelayChannel: SignalingChannel {
    /// Opens the persistent connection. Returns once the attempt is underway;
    /// the outcome arrives as an event.
    async fn connect(&self, ws_url: &str, post_url: &str);

    /// Registers this client with the room. Deferred until the channel is
    /// connected.
    async fn register(&self, room_id: &str, client_id: &str);

    /// Closes the channel, optionally waiting (bounded) for the server to
    /// confirm.
    async fn disconnect_with(&self, wait_for_complete: bool);

    fn state(&self) -> ChannelState;
}

/// A factory responsible for creating new relay channels.
pub trait RelayChannelFactory: Send + Sync {
    /// Creates a new channel and returns it, along with its stream of events.
    fn create_channel(&self) -> (Arc<dyn RelayChannel>, ChannelEventReceiver);
}
