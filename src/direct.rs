//! Two-party signaling over a plain TCP connection, without a room server.
//!
//! The room id names the peer: a wildcard address listens, anything else dials.
//! The listening side is the initiator and reports the connection as soon as a
//! peer is accepted; the dialing side reports it when the offer arrives.

use crate::channel::{ChannelEvent, ChannelEventReceiver, SignalingChannel};
use crate::config::SignalingConfig;
use crate::error::{Result, SignalingError};
use crate::session::{ConnectionState, Session};
use crate::tcp::{SocketEndpoint, TcpChannel};
use log::{debug, error, info, warn};
use sigcore::{
    Envelope, EnvelopeError, IceCandidate, RoomConnectionParameters, SessionDescription, SignalingEvents,
    SignalingParameters,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Parses `ip`, `ip:port`, `[v6]`, `[v6]:port` and `localhost[:port]`.
pub fn parse_direct_address(room_id: &str, default_port: u16) -> Result<SocketEndpoint> {
    let invalid = || SignalingError::InvalidAddress(room_id.to_string());

    if let Ok(address) = room_id.parse::<SocketAddr>() {
        return Ok(SocketEndpoint::new(address));
    }
    if let Some(port) = room_id.strip_prefix("localhost") {
        let port = match port.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| invalid())?,
            None if port.is_empty() => default_port,
            None => return Err(invalid()),
        };
        return Ok(SocketEndpoint::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)));
    }
    SocketEndpoint::parse(room_id, default_port)
}

enum Command {
    Connect(RoomConnectionParameters),
    SendOffer(SessionDescription),
    SendAnswer(SessionDescription),
    SendCandidate(IceCandidate),
    SendCandidateRemovals(Vec<IceCandidate>),
    Disconnect,
}

/// Handle to a direct-connect signaling session. Same calling conventions as
/// [`crate::RoomClient`].
pub struct DirectClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl DirectClient {
    pub fn new(config: SignalingConfig, events: Arc<dyn SignalingEvents>) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (session, state) = Session::new(events);
        let engine = DirectEngine {
            config,
            session,
            initiator: false,
            socket: None,
            socket_events: None,
        };
        let task = tokio::spawn(engine.run(commands_rx));
        Self { commands, state, task }
    }

    fn submit(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Direct client engine has stopped, command dropped");
        }
    }

    /// `params.room_id` is the peer address; the room URL is unused.
    pub fn connect_to_room(&self, params: RoomConnectionParameters) {
        self.submit(Command::Connect(params));
    }

    pub fn send_offer_sdp(&self, sdp: SessionDescription) {
        self.submit(Command::SendOffer(sdp));
    }

    pub fn send_answer_sdp(&self, sdp: SessionDescription) {
        self.submit(Command::SendAnswer(sdp));
    }

    pub fn send_local_ice_candidate(&self, candidate: IceCandidate) {
        self.submit(Command::SendCandidate(candidate));
    }

    pub fn send_local_ice_candidate_removals(&self, candidates: Vec<IceCandidate>) {
        self.submit(Command::SendCandidateRemovals(candidates));
    }

    pub fn disconnect_from_room(&self) {
        self.submit(Command::Disconnect);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Runs the commands already queued, then closes the socket.
    pub async fn shutdown(self) {
        let Self { commands, task, .. } = self;
        drop(commands);
        if let Err(e) = task.await {
            error!("Direct client engine failed: {e}");
        }
    }
}

struct DirectEngine {
    config: SignalingConfig,
    session: Session,
    initiator: bool,
    socket: Option<TcpChannel>,
    socket_events: Option<ChannelEventReceiver>,
}

async fn next_socket_event(events: &mut Option<ChannelEventReceiver>) -> Option<ChannelEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

impl DirectEngine {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!("Direct engine started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = next_socket_event(&mut self.socket_events) => match event {
                    Some(event) => self.handle_socket_event(event),
                    None => self.socket_events = None,
                },
            }
        }

        debug!("Direct engine shutting down");
        if self.socket.is_some() {
            self.disconnect().await;
        }
        // Deliver what the socket reported before it was dropped.
        if let Some(mut events) = self.socket_events.take() {
            while let Some(event) = events.recv().await {
                self.handle_socket_event(event);
            }
        }
        debug!("Direct engine stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(params) => self.connect(params).await,
            Command::SendOffer(sdp) => self.send("offer SDP", Envelope::from(&sdp)).await,
            Command::SendAnswer(sdp) => self.send("answer SDP", Envelope::from(&sdp)).await,
            Command::SendCandidate(candidate) => {
                self.send("ICE candidate", Envelope::Candidate(candidate)).await
            }
            Command::SendCandidateRemovals(candidates) => {
                self.send(
                    "ICE candidate removals",
                    Envelope::RemoveCandidates { candidates },
                )
                .await
            }
            Command::Disconnect => self.disconnect().await,
        }
    }

    async fn connect(&mut self, params: RoomConnectionParameters) {
        if self.session.state() != ConnectionState::New || self.socket.is_some() {
            warn!("connect_to_room() ignored in state {}", self.session.state());
            return;
        }
        let endpoint = match parse_direct_address(&params.room_id, self.config.default_direct_port) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.session.report_error(&e.to_string());
                return;
            }
        };
        info!("Direct connect to {} as {:?}", endpoint.address, endpoint.role);

        let (tx, rx) = mpsc::unbounded_channel();
        let socket = TcpChannel::new(endpoint, tx, self.config.socket_join_timeout);
        socket.connect().await;
        self.socket = Some(socket);
        self.socket_events = Some(rx);
    }

    async fn send(&self, what: &str, envelope: Envelope) {
        if !self.session.require_connected(what) {
            return;
        }
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(e) => {
                self.session.report_error(&SignalingError::from(e).to_string());
                return;
            }
        };
        match &self.socket {
            Some(socket) => {
                debug!("C->TCP: {text}");
                socket.send(&text).await;
            }
            None => error!("No socket to send on: {text}"),
        }
    }

    async fn disconnect(&mut self) {
        info!("Disconnect. Room state: {}", self.session.state());
        self.session.set_state(ConnectionState::Closed);
        if let Some(socket) = self.socket.take() {
            socket.disconnect().await;
        }
    }

    fn handle_socket_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected { is_server } => {
                if self.session.state().is_terminal() {
                    debug!("Socket connected after the session ended");
                    return;
                }
                self.initiator = is_server;
                if is_server {
                    self.session.set_state(ConnectionState::Connected);
                    self.session
                        .events()
                        .on_connected_to_room(&SignalingParameters::direct(true, None));
                } else {
                    info!("Connected to the listening peer, waiting for its offer");
                }
            }
            ChannelEvent::Message(message) => self.handle_message(&message),
            ChannelEvent::Error(description) => {
                self.session
                    .report_error(&format!("TCP connection error: {description}"));
            }
            ChannelEvent::Closed => self.session.events().on_channel_close(),
        }
    }

    fn handle_message(&mut self, message: &str) {
        if self.session.state().is_terminal() {
            debug!("TCP message after the session ended: {message}");
            return;
        }
        debug!("TCP->C: {message}");

        let events = self.session.events();
        match Envelope::decode(message) {
            Ok(Envelope::Candidate(candidate)) => events.on_remote_ice_candidate(&candidate),
            Ok(Envelope::RemoveCandidates { candidates }) => {
                events.on_remote_ice_candidates_removed(&candidates)
            }
            Ok(Envelope::Answer { sdp }) => {
                if self.initiator {
                    events.on_remote_description(&SessionDescription::answer(sdp));
                } else {
                    self.session
                        .report_error(&format!("Received answer for call initiator: {message}"));
                }
            }
            Ok(Envelope::Offer { sdp }) => {
                let offer = SessionDescription::offer(sdp);
                if self.initiator {
                    self.session
                        .report_error(&format!("Received offer for call receiver: {message}"));
                } else if self.session.state() == ConnectionState::New {
                    self.session.set_state(ConnectionState::Connected);
                    events.on_connected_to_room(&SignalingParameters::direct(false, Some(offer)));
                } else {
                    events.on_remote_description(&offer);
                }
            }
            Ok(Envelope::Bye) => events.on_channel_close(),
            Err(EnvelopeError::Json(e)) => {
                self.session
                    .report_error(&format!("TCP message JSON parsing error: {e}"));
            }
            Err(_) => self.session.report_error(&format!("Unexpected TCP message: {message}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::SocketRole;
    use crate::test_utils::next_event;
    use sigcore::SignalingEvent;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    fn client(events: mpsc::UnboundedSender<SignalingEvent>) -> DirectClient {
        let _ = env_logger::builder().is_test(true).try_init();
        DirectClient::new(SignalingConfig::default(), Arc::new(events))
    }

    fn direct_params(address: &str) -> RoomConnectionParameters {
        RoomConnectionParameters::new("", address)
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|listener| listener.local_addr())
            .map(|addr| addr.port())
            .expect("free port")
    }

    async fn dial(port: u16) -> TcpStream {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
                    return stream;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("listener never came up")
    }

    fn addr(text: &str) -> SocketAddr {
        text.parse().unwrap()
    }

    #[test]
    fn test_parse_direct_address() {
        let endpoint = parse_direct_address("0.0.0.0", 8888).unwrap();
        assert_eq!(endpoint.address, addr("0.0.0.0:8888"));
        assert_eq!(endpoint.role, SocketRole::Server);

        let endpoint = parse_direct_address("192.168.1.7:9000", 8888).unwrap();
        assert_eq!(endpoint.address, addr("192.168.1.7:9000"));
        assert_eq!(endpoint.role, SocketRole::Client);

        assert_eq!(
            parse_direct_address("[::]", 8888).unwrap().address,
            addr("[::]:8888")
        );
        assert_eq!(
            parse_direct_address("[::1]:7000", 8888).unwrap().address,
            addr("[::1]:7000")
        );
        assert_eq!(
            parse_direct_address("fe80::1", 8888).unwrap().address,
            addr("[fe80::1]:8888")
        );
        assert_eq!(
            parse_direct_address("localhost", 8888).unwrap().address,
            addr("127.0.0.1:8888")
        );
        assert_eq!(
            parse_direct_address("localhost:1234", 8888).unwrap().address,
            addr("127.0.0.1:1234")
        );

        for bad in ["room1", "localhost:http", "localhostx", "1.2.3.4:99999", ""] {
            assert!(
                matches!(parse_direct_address(bad, 8888), Err(SignalingError::InvalidAddress(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_invalid_address_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = client(tx);
        client.connect_to_room(direct_params("my-room"));
        assert_eq!(
            next_event(&mut rx).await,
            SignalingEvent::ChannelError("Invalid IP address: my-room".to_string())
        );
        assert_eq!(client.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_send_before_connect_is_an_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = client(tx);
        client.send_local_ice_candidate(IceCandidate::new("audio", 0, "c"));
        assert_eq!(
            next_event(&mut rx).await,
            SignalingEvent::ChannelError("Sending ICE candidate in non connected state.".to_string())
        );
    }

    #[tokio::test]
    async fn test_listening_side_is_initiator_and_rejects_offer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = client(tx);
        let port = free_port();
        client.connect_to_room(direct_params(&format!("0.0.0.0:{port}")));

        let mut peer = dial(port).await;
        match next_event(&mut rx).await {
            SignalingEvent::ConnectedToRoom(params) => {
                assert!(params.initiator);
                assert!(params.offer_sdp.is_none());
            }
            other => panic!("expected ConnectedToRoom, got {other:?}"),
        }
        assert_eq!(client.state(), ConnectionState::Connected);

        let offer = r#"{"type":"offer","sdp":"v=0"}"#;
        peer.write_all(format!("{offer}\n").as_bytes()).await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            SignalingEvent::ChannelError(format!("Received offer for call receiver: {offer}"))
        );

        client.shutdown().await;
        assert_eq!(next_event(&mut rx).await, SignalingEvent::ChannelClose);
    }

    #[tokio::test]
    async fn test_dialing_side_connects_on_offer_and_answers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = client(tx);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        client.connect_to_room(direct_params(&format!("127.0.0.1:{port}")));

        let (peer, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = peer.into_split();
        let mut lines = BufReader::new(reader).lines();
        writer
            .write_all(b"{\"type\":\"offer\",\"sdp\":\"v=0 remote\"}\n")
            .await
            .unwrap();

        match next_event(&mut rx).await {
            SignalingEvent::ConnectedToRoom(params) => {
                assert!(!params.initiator);
                assert_eq!(params.offer_sdp, Some(SessionDescription::offer("v=0 remote")));
            }
            other => panic!("expected ConnectedToRoom, got {other:?}"),
        }

        client.send_answer_sdp(SessionDescription::answer("v=0 local"));
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let answer: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(answer, serde_json::json!({"type": "answer", "sdp": "v=0 local"}));

        writer.write_all(b"{\"type\":\"bye\"}\n").await.unwrap();
        assert_eq!(next_event(&mut rx).await, SignalingEvent::ChannelClose);

        writer.write_all(b"{\"type\":\"answer\",\"sdp\":\"x\"}\n").await.unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            SignalingEvent::ChannelError(message) if message.starts_with("Received answer for call initiator")
        ));

        drop(writer);
        assert_eq!(next_event(&mut rx).await, SignalingEvent::ChannelClose);
        client.disconnect_from_room();
        client.disconnect_from_room();
        client.shutdown().await;
        assert!(rx.try_recv().is_err());
    }
}
