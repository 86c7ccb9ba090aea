//! Room connection parameters, the result of the room join handshake, and
//! the room server URLs derived from them.

use crate::envelope::{Envelope, IceCandidate, SessionDescription};
use log::{error, warn};
use serde::Deserialize;
use thiserror::Error;

const ROOM_JOIN: &str = "join";
const ROOM_MESSAGE: &str = "message";
const ROOM_LEAVE: &str = "leave";
const RESULT_SUCCESS: &str = "SUCCESS";

#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("Room JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Room response error: {0}")]
    RoomResponse(String),

    #[error("Room response is missing params")]
    MissingParams,

    #[error("invalid is_initiator value: {0}")]
    InvalidInitiator(String),
}

/// What the caller asked to connect to. Fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomConnectionParameters {
    pub room_url: String,
    pub room_id: String,
    pub loopback: bool,
    /// Raw query string appended to every room server URL, without the `?`.
    pub url_parameters: Option<String>,
}

impl RoomConnectionParameters {
    pub fn new(room_url: impl Into<String>, room_id: impl Into<String>) -> Self {
        let room_url: String = room_url.into();
        Self {
            room_url: room_url.trim_end_matches('/').to_string(),
            room_id: room_id.into(),
            loopback: false,
            url_parameters: None,
        }
    }

    pub fn with_loopback(mut self, loopback: bool) -> Self {
        self.loopback = loopback;
        self
    }

    pub fn with_url_parameters(mut self, parameters: impl Into<String>) -> Self {
        self.url_parameters = Some(parameters.into());
        self
    }

    fn query_string(&self) -> String {
        match &self.url_parameters {
            Some(parameters) if !parameters.is_empty() => format!("?{parameters}"),
            _ => String::new(),
        }
    }

    /// `{room_url}/join/{room_id}[?params]`
    pub fn join_url(&self) -> String {
        format!(
            "{}/{ROOM_JOIN}/{}{}",
            self.room_url,
            urlencoding::encode(&self.room_id),
            self.query_string()
        )
    }

    /// `{room_url}/message/{room_id}/{client_id}[?params]`
    pub fn message_url(&self, client_id: &str) -> String {
        self.client_url(ROOM_MESSAGE, client_id)
    }

    /// `{room_url}/leave/{room_id}/{client_id}[?params]`
    pub fn leave_url(&self, client_id: &str) -> String {
        self.client_url(ROOM_LEAVE, client_id)
    }

    fn client_url(&self, action: &str, client_id: &str) -> String {
        format!(
            "{}/{action}/{}/{}{}",
            self.room_url,
            urlencoding::encode(&self.room_id),
            urlencoding::encode(client_id),
            self.query_string()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Outcome of the join handshake. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignalingParameters {
    pub ice_servers: Vec<IceServer>,
    pub initiator: bool,
    pub client_id: Option<String>,
    pub wss_url: Option<String>,
    pub wss_post_url: Option<String>,
    /// The offer the initiator already posted; only set for receivers.
    pub offer_sdp: Option<SessionDescription>,
    /// Candidates the initiator already posted.
    pub ice_candidates: Vec<IceCandidate>,
}

impl SignalingParameters {
    /// Parameters for a direct socket session, which has no room server.
    pub fn direct(initiator: bool, offer_sdp: Option<SessionDescription>) -> Self {
        Self {
            initiator,
            offer_sdp,
            ..Default::default()
        }
    }

    /// Parses the body of `GET {room_url}/join/{room_id}`.
    pub fn from_join_response(body: &str) -> Result<Self, ParamsError> {
        let response: JoinResponse = serde_json::from_str(body)?;
        if response.result != RESULT_SUCCESS {
            return Err(ParamsError::RoomResponse(response.result));
        }
        let params = response.params.ok_or(ParamsError::MissingParams)?;
        let initiator = params.is_initiator.as_bool()?;

        let mut offer_sdp = None;
        let mut ice_candidates = Vec::new();
        if !initiator {
            for message in &params.messages {
                match Envelope::decode(message) {
                    Ok(Envelope::Offer { sdp }) => offer_sdp = Some(SessionDescription::offer(sdp)),
                    Ok(Envelope::Candidate(candidate)) => ice_candidates.push(candidate),
                    Ok(other) => warn!("Unexpected {} message in room response", other.type_name()),
                    Err(e) => error!("Unknown message in room response: {message}: {e}"),
                }
            }
        }

        let ice_servers = match params.pc_config.as_deref() {
            Some(config) if !config.is_empty() => parse_ice_servers(config)?,
            _ => Vec::new(),
        };

        Ok(Self {
            ice_servers,
            initiator,
            client_id: Some(params.client_id),
            wss_url: Some(params.wss_url),
            wss_post_url: Some(params.wss_post_url),
            offer_sdp,
            ice_candidates,
        })
    }
}

/// `{wss_post_url}/{room_id}/{client_id}`, used to drop a relay registration.
pub fn relay_registration_url(post_url: &str, room_id: &str, client_id: &str) -> String {
    format!(
        "{}/{}/{}",
        post_url.trim_end_matches('/'),
        urlencoding::encode(room_id),
        urlencoding::encode(client_id)
    )
}

/// Checks the `{"result": ...}` body the room server returns for a message POST.
pub fn check_message_result(body: &str) -> Result<(), ParamsError> {
    #[derive(Deserialize)]
    struct MessageResult {
        result: String,
    }

    let response: MessageResult = serde_json::from_str(body)?;
    if response.result == RESULT_SUCCESS {
        Ok(())
    } else {
        Err(ParamsError::RoomResponse(response.result))
    }
}

#[derive(Deserialize)]
struct JoinResponse {
    result: String,
    #[serde(default)]
    params: Option<JoinParams>,
}

#[derive(Deserialize)]
struct JoinParams {
    is_initiator: InitiatorFlag,
    client_id: String,
    wss_url: String,
    wss_post_url: String,
    #[serde(default)]
    messages: Vec<String>,
    #[serde(default)]
    pc_config: Option<String>,
}

// Room servers send this flag as either a JSON bool or the string "true"/"false".
#[derive(Deserialize)]
#[serde(untagged)]
enum InitiatorFlag {
    Bool(bool),
    Text(String),
}

impl InitiatorFlag {
    fn as_bool(&self) -> Result<bool, ParamsError> {
        match self {
            Self::Bool(value) => Ok(*value),
            Self::Text(text) => match text.as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                other => Err(ParamsError::InvalidInitiator(other.to_string())),
            },
        }
    }
}

#[derive(Deserialize)]
struct PeerConnectionConfig {
    #[serde(rename = "iceServers", default)]
    ice_servers: Vec<IceServerEntry>,
}

#[derive(Deserialize)]
struct IceServerEntry {
    urls: IceServerUrls,
    #[serde(default)]
    username: String,
    #[serde(default)]
    credential: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IceServerUrls {
    One(String),
    Many(Vec<String>),
}

fn parse_ice_servers(pc_config: &str) -> Result<Vec<IceServer>, ParamsError> {
    let config: PeerConnectionConfig = serde_json::from_str(pc_config)?;
    Ok(config
        .ice_servers
        .into_iter()
        .map(|entry| IceServer {
            urls: match entry.urls {
                IceServerUrls::One(url) => vec![url],
                IceServerUrls::Many(urls) => urls,
            },
            username: entry.username,
            credential: entry.credential,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn join_body(is_initiator: serde_json::Value, messages: Vec<String>) -> String {
        json!({
            "result": "SUCCESS",
            "params": {
                "is_initiator": is_initiator,
                "room_id": "room1",
                "client_id": "12345678",
                "wss_url": "wss://relay.example.org:443/ws",
                "wss_post_url": "https://relay.example.org:443",
                "messages": messages,
                "pc_config": "{\"iceServers\":[{\"urls\":\"stun:stun.example.org:19302\"},{\"urls\":[\"turn:a\",\"turn:b\"],\"username\":\"u\",\"credential\":\"p\"}]}"
            }
        })
        .to_string()
    }

    #[test]
    fn test_room_urls() {
        let params = RoomConnectionParameters::new("https://rooms.example.org/", "room 1")
            .with_url_parameters("debug=loopback");

        assert_eq!(
            params.join_url(),
            "https://rooms.example.org/join/room%201?debug=loopback"
        );
        assert_eq!(
            params.message_url("42"),
            "https://rooms.example.org/message/room%201/42?debug=loopback"
        );
        assert_eq!(
            params.leave_url("42"),
            "https://rooms.example.org/leave/room%201/42?debug=loopback"
        );

        let bare = RoomConnectionParameters::new("https://rooms.example.org", "r");
        assert_eq!(bare.join_url(), "https://rooms.example.org/join/r");

        assert_eq!(
            relay_registration_url("https://relay.example.org/", "room 1", "42"),
            "https://relay.example.org/room%201/42"
        );
    }

    #[test]
    fn test_initiator_join_response() {
        let params = SignalingParameters::from_join_response(&join_body(json!("true"), vec![])).unwrap();

        assert!(params.initiator);
        assert_eq!(params.client_id.as_deref(), Some("12345678"));
        assert_eq!(params.wss_url.as_deref(), Some("wss://relay.example.org:443/ws"));
        assert!(params.offer_sdp.is_none());
        assert_eq!(params.ice_servers.len(), 2);
        assert_eq!(params.ice_servers[0].urls, vec!["stun:stun.example.org:19302"]);
        assert_eq!(params.ice_servers[1].username, "u");
    }

    #[test]
    fn test_receiver_join_response_carries_offer() {
        let messages = vec![
            r#"{"type":"offer","sdp":"v=0 offer"}"#.to_string(),
            r#"{"type":"candidate","label":0,"id":"audio","candidate":"c1"}"#.to_string(),
            "garbage".to_string(),
        ];
        let params = SignalingParameters::from_join_response(&join_body(json!(false), messages)).unwrap();

        assert!(!params.initiator);
        assert_eq!(params.offer_sdp, Some(SessionDescription::offer("v=0 offer")));
        assert_eq!(params.ice_candidates, vec![IceCandidate::new("audio", 0, "c1")]);
    }

    #[test]
    fn test_join_response_errors() {
        let full = SignalingParameters::from_join_response(r#"{"result":"FULL"}"#);
        assert!(matches!(full, Err(ParamsError::RoomResponse(r)) if r == "FULL"));

        assert!(matches!(
            SignalingParameters::from_join_response("<html>"),
            Err(ParamsError::Json(_))
        ));
        assert!(matches!(
            SignalingParameters::from_join_response(r#"{"result":"SUCCESS"}"#),
            Err(ParamsError::MissingParams)
        ));
        assert!(matches!(
            SignalingParameters::from_join_response(&join_body(json!("maybe"), vec![])),
            Err(ParamsError::InvalidInitiator(_))
        ));
    }

    #[test]
    fn test_message_result() {
        assert!(check_message_result(r#"{"result":"SUCCESS"}"#).is_ok());
        assert!(matches!(
            check_message_result(r#"{"result":"INVALID_CLIENT"}"#),
            Err(ParamsError::RoomResponse(r)) if r == "INVALID_CLIENT"
        ));
        assert!(check_message_result("").is_err());
    }
}
