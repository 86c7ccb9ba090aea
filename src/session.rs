//! Connection state and error reporting shared by both signaling engines.

use log::{error, warn};
use sigcore::SignalingEvents;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connected,
    Closed,
    Error,
}

impl ConnectionState {
    /// `Closed` and `Error` are never left.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Connected => "CONNECTED",
            Self::Closed => "CLOSED",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Owned by an engine task. The state is published on a `watch` channel so
/// the client handle can read it without a round trip through the queue.
pub(crate) struct Session {
    state: watch::Sender<ConnectionState>,
    events: Arc<dyn SignalingEvents>,
}

impl Session {
    pub(crate) fn new(events: Arc<dyn SignalingEvents>) -> (Self, watch::Receiver<ConnectionState>) {
        let (state, state_rx) = watch::channel(ConnectionState::New);
        (Self { state, events }, state_rx)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub(crate) fn events(&self) -> &dyn SignalingEvents {
        self.events.as_ref()
    }

    /// Fires `on_channel_error` for the first error of the session and moves
    /// to `Error`. Errors in a terminal state are only logged.
    pub(crate) fn report_error(&self, description: &str) {
        error!("{description}");
        let state = self.state();
        if state.is_terminal() {
            warn!("Error in {state} state not reported: {description}");
            return;
        }
        self.set_state(ConnectionState::Error);
        self.events.on_channel_error(description);
    }

    /// Reports an error unless the session is `Connected`.
    pub(crate) fn require_connected(&self, what: &str) -> bool {
        if self.state() == ConnectionState::Connected {
            return true;
        }
        self.report_error(&format!("Sending {what} in non connected state."));
        false
    }
}
