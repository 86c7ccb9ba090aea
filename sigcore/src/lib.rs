//! Platform-agnostic pieces of the signaling layer: the JSON message
//! vocabulary, room and signaling parameters, the upper-layer event
//! interface and the HTTP seam. Nothing in this crate performs I/O.

pub mod envelope;
pub mod events;
pub mod net;
pub mod params;

pub use envelope::{Envelope, EnvelopeError, IceCandidate, SdpType, SessionDescription};
pub use events::{SignalingEvent, SignalingEvents};
pub use params::{IceServer, ParamsError, RoomConnectionParameters, SignalingParameters};
