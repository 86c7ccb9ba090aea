//! Interface between the signaling engines and the call-control layer.

use crate::envelope::{IceCandidate, SessionDescription};
use crate::params::SignalingParameters;
use log::warn;
use tokio::sync::mpsc;

/// Callbacks fired by a signaling session.
///
/// All methods are invoked on the session's engine task, one at a time and in
/// the order the underlying events occurred. Implementations must not block.
pub trait SignalingEvents: Send + Sync {
    /// The room join (or direct connection) completed.
    fn on_connected_to_room(&self, params: &SignalingParameters);

    fn on_remote_description(&self, sdp: &SessionDescription);

    fn on_remote_ice_candidate(&self, candidate: &IceCandidate);

    fn on_remote_ice_candidates_removed(&self, candidates: &[IceCandidate]);

    /// The signaling channel closed, locally or because the peer said bye.
    fn on_channel_close(&self);

    /// Fired at most once per session.
    fn on_channel_error(&self, description: &str);
}

/// Owned form of the [`SignalingEvents`] callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    ConnectedToRoom(SignalingParameters),
    RemoteDescription(SessionDescription),
    RemoteIceCandidate(IceCandidate),
    RemoteIceCandidatesRemoved(Vec<IceCandidate>),
    ChannelClose,
    ChannelError(String),
}

/// Forwards every callback into a channel so consumers can `recv()` events.
impl SignalingEvents for mpsc::UnboundedSender<SignalingEvent> {
    fn on_connected_to_room(&self, params: &SignalingParameters) {
        forward(self, SignalingEvent::ConnectedToRoom(params.clone()));
    }

    fn on_remote_description(&self, sdp: &SessionDescription) {
        forward(self, SignalingEvent::RemoteDescription(sdp.clone()));
    }

    fn on_remote_ice_candidate(&self, candidate: &IceCandidate) {
        forward(self, SignalingEvent::RemoteIceCandidate(candidate.clone()));
    }

    fn on_remote_ice_candidates_removed(&self, candidates: &[IceCandidate]) {
        forward(self, SignalingEvent::RemoteIceCandidatesRemoved(candidates.to_vec()));
    }

    fn on_channel_close(&self) {
        forward(self, SignalingEvent::ChannelClose);
    }

    fn on_channel_error(&self, description: &str) {
        forward(self, SignalingEvent::ChannelError(description.to_string()));
    }
}

fn forward(tx: &mpsc::UnboundedSender<SignalingEvent>, event: SignalingEvent) {
    if tx.send(event).is_err() {
        warn!("Signaling event receiver dropped");
    }
}
