//! JSON message vocabulary shared by the relay and direct transports.
//!
//! Session descriptions travel as `{"type":"offer","sdp":"..."}`, candidates
//! as `{"type":"candidate","label":0,"id":"audio","candidate":"..."}`. The
//! relay additionally wraps every inbound message in `{"msg":..,"error":..}`
//! and expects outbound traffic as `{"cmd":..}` commands.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const KNOWN_TYPES: [&str; 5] = ["offer", "answer", "candidate", "remove-candidates", "bye"];

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown message type: {0:?}")]
    UnknownType(String),

    #[error("relay message carries neither msg nor error")]
    EmptyRelayMessage,
}

/// Which side of the offer/answer exchange a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opaque session description plus its offer/answer tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub description: String,
}

impl SessionDescription {
    pub fn new(sdp_type: SdpType, description: impl Into<String>) -> Self {
        Self {
            sdp_type,
            description: description.into(),
        }
    }

    pub fn offer(description: impl Into<String>) -> Self {
        Self::new(SdpType::Offer, description)
    }

    pub fn answer(description: impl Into<String>) -> Self {
        Self::new(SdpType::Answer, description)
    }
}

/// A single ICE candidate as carried on the wire.
///
/// The wire names (`id`, `label`) differ from the field names; all three
/// fields are required when decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(rename = "id")]
    pub sdp_mid: String,
    #[serde(rename = "label")]
    pub sdp_m_line_index: u32,
    pub candidate: String,
}

impl IceCandidate {
    pub fn new(sdp_mid: impl Into<String>, sdp_m_line_index: u32, candidate: impl Into<String>) -> Self {
        Self {
            sdp_mid: sdp_mid.into(),
            sdp_m_line_index,
            candidate: candidate.into(),
        }
    }
}

/// One signaling message exchanged between the peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidate),
    RemoveCandidates { candidates: Vec<IceCandidate> },
    Bye,
}

impl Envelope {
    /// Decodes one message. An unrecognised `type` is reported separately
    /// from a malformed body so callers can word the error accordingly.
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        if !KNOWN_TYPES.contains(&kind) {
            return Err(EnvelopeError::UnknownType(kind.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate(_) => "candidate",
            Self::RemoveCandidates { .. } => "remove-candidates",
            Self::Bye => "bye",
        }
    }

    /// Returns the session description for `offer` and `answer` messages.
    pub fn description(&self) -> Option<SessionDescription> {
        match self {
            Self::Offer { sdp } => Some(SessionDescription::offer(sdp.clone())),
            Self::Answer { sdp } => Some(SessionDescription::answer(sdp.clone())),
            _ => None,
        }
    }
}

impl From<&SessionDescription> for Envelope {
    fn from(sdp: &SessionDescription) -> Self {
        match sdp.sdp_type {
            SdpType::Offer => Self::Offer {
                sdp: sdp.description.clone(),
            },
            SdpType::Answer => Self::Answer {
                sdp: sdp.description.clone(),
            },
        }
    }
}

#[derive(Deserialize)]
struct RelayWrapper {
    #[serde(default)]
    msg: String,
    #[serde(default)]
    error: String,
}

/// Content of one inbound relay frame after unwrapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayPayload {
    /// The inner JSON message, still encoded.
    Message(String),
    /// An error reported by the relay server.
    Error(String),
}

impl RelayPayload {
    pub fn unwrap_frame(text: &str) -> Result<Self, EnvelopeError> {
        let wrapper: RelayWrapper = serde_json::from_str(text)?;
        if !wrapper.msg.is_empty() {
            Ok(Self::Message(wrapper.msg))
        } else if !wrapper.error.is_empty() {
            Ok(Self::Error(wrapper.error))
        } else {
            Err(EnvelopeError::EmptyRelayMessage)
        }
    }
}

/// Outbound command understood by the relay's WebSocket endpoint.
#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum RelayCommand<'a> {
    Register { roomid: &'a str, clientid: &'a str },
    Send { msg: &'a str },
}

impl RelayCommand<'_> {
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_candidate_round_trip() {
        let candidate = IceCandidate::new("audio", 0, "c-line");
        let text = Envelope::Candidate(candidate.clone()).encode().unwrap();

        match Envelope::decode(&text).unwrap() {
            Envelope::Candidate(decoded) => {
                assert_eq!(decoded.sdp_mid, "audio");
                assert_eq!(decoded.sdp_m_line_index, 0);
                assert_eq!(decoded.candidate, "c-line");
                assert_eq!(decoded, candidate);
            }
            other => panic!("expected candidate, got {other:?}"),
        }
    }

    #[test]
    fn test_candidate_wire_names() {
        let text = Envelope::Candidate(IceCandidate::new("video", 1, "candidate:1 1 udp"))
            .encode()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"type": "candidate", "id": "video", "label": 1, "candidate": "candidate:1 1 udp"})
        );
    }

    #[test]
    fn test_offer_and_answer_shape() {
        let offer = Envelope::from(&SessionDescription::offer("v=0"));
        let value: serde_json::Value = serde_json::from_str(&offer.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "offer", "sdp": "v=0"}));

        let answer = Envelope::decode(r#"{"sdp":"v=0 answer","type":"answer"}"#).unwrap();
        assert_eq!(
            answer.description(),
            Some(SessionDescription::answer("v=0 answer"))
        );
    }

    #[test]
    fn test_remove_candidates_decode() {
        let text = r#"{"type":"remove-candidates","candidates":[
            {"label":0,"id":"audio","candidate":"a"},
            {"label":1,"id":"video","candidate":"b"}]}"#;
        match Envelope::decode(text).unwrap() {
            Envelope::RemoveCandidates { candidates } => {
                assert_eq!(candidates.len(), 2);
                assert_eq!(candidates[1], IceCandidate::new("video", 1, "b"));
            }
            other => panic!("expected remove-candidates, got {other:?}"),
        }
    }

    #[test]
    fn test_bye_has_no_payload() {
        assert_eq!(Envelope::decode(r#"{"type":"bye"}"#).unwrap(), Envelope::Bye);
        assert_eq!(Envelope::Bye.encode().unwrap(), r#"{"type":"bye"}"#);
    }

    #[test]
    fn test_unknown_type_is_distinguished() {
        assert!(matches!(
            Envelope::decode(r#"{"type":"hello"}"#),
            Err(EnvelopeError::UnknownType(kind)) if kind == "hello"
        ));
        assert!(matches!(
            Envelope::decode(r#"{"sdp":"x"}"#),
            Err(EnvelopeError::UnknownType(kind)) if kind.is_empty()
        ));
    }

    #[test]
    fn test_missing_candidate_field_is_an_error() {
        let text = r#"{"type":"candidate","label":0,"candidate":"a"}"#;
        assert!(matches!(Envelope::decode(text), Err(EnvelopeError::Json(_))));
    }

    #[test]
    fn test_relay_frame_unwrap() {
        assert_eq!(
            RelayPayload::unwrap_frame(r#"{"msg":"{\"type\":\"bye\"}","error":""}"#).unwrap(),
            RelayPayload::Message(r#"{"type":"bye"}"#.to_string())
        );
        assert_eq!(
            RelayPayload::unwrap_frame(r#"{"msg":"","error":"unknown client"}"#).unwrap(),
            RelayPayload::Error("unknown client".to_string())
        );
        assert!(matches!(
            RelayPayload::unwrap_frame(r#"{"msg":"","error":""}"#),
            Err(EnvelopeError::EmptyRelayMessage)
        ));
        assert!(RelayPayload::unwrap_frame("not json").is_err());
    }

    #[test]
    fn test_relay_commands() {
        let register = RelayCommand::Register {
            roomid: "room1",
            clientid: "42",
        };
        let value: serde_json::Value = serde_json::from_str(&register.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"cmd": "register", "roomid": "room1", "clientid": "42"}));

        let send = RelayCommand::Send { msg: r#"{"type":"bye"}"# };
        let value: serde_json::Value = serde_json::from_str(&send.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"cmd": "send", "msg": "{\"type\":\"bye\"}"}));
    }
}
