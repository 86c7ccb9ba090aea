// Wire vocabulary and the HTTP seam live in `sigcore`; re-exported for callers
pub use sigcore::{
    Envelope, EnvelopeError, IceCandidate, IceServer, ParamsError, RoomConnectionParameters, SdpType,
    SessionDescription, SignalingEvent, SignalingEvents, SignalingParameters, net,
};

// Transports
pub mod channel;
pub mod tcp;
pub mod websocket;

// Protocol engines
pub mod direct;
pub mod room;
pub mod session;

pub mod config;
pub mod error;

#[cfg(test)]
pub mod test_utils;

pub use config::SignalingConfig;
pub use direct::DirectClient;
pub use error::SignalingError;
pub use room::RoomClient;
pub use session::ConnectionState;
