//! Signaling through a room server and its WebSocket relay.
//!
//! Joining is a `GET` to the room server. The initiator then posts its offer
//! and candidates back to the room server, while the receiver answers over the
//! relay channel. All of it runs on one engine task per [`RoomClient`].

use crate::channel::{ChannelEvent, ChannelEventReceiver, ChannelState, RelayChannel, RelayChannelFactory};
use crate::config::SignalingConfig;
use crate::error::{Result, SignalingError};
use crate::session::{ConnectionState, Session};
use crate::websocket::WebSocketChannelFactory;
use log::{debug, error, info, warn};
use sigcore::net::{HttpClient, HttpRequest};
use sigcore::params::check_message_result;
use sigcore::{
    Envelope, EnvelopeError, IceCandidate, ParamsError, RoomConnectionParameters, SessionDescription,
    SignalingEvents, SignalingParameters,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

const POST_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

enum Command {
    Connect(RoomConnectionParameters),
    SendOffer(SessionDescription),
    SendAnswer(SessionDescription),
    SendCandidate(IceCandidate),
    SendCandidateRemovals(Vec<IceCandidate>),
    Disconnect,
}

enum HttpOutcome {
    Join(Result<SignalingParameters>),
    Message(Result<String>),
    Leave(Result<String>),
}

/// Handle to a room signaling session.
///
/// Every method only enqueues work for the engine task, so they can be called
/// from inside [`SignalingEvents`] callbacks. Must be created inside a tokio
/// runtime.
pub struct RoomClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl RoomClient {
    pub fn new(
        events: Arc<dyn SignalingEvents>,
        http: Arc<dyn HttpClient>,
        relays: Arc<dyn RelayChannelFactory>,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (session, state) = Session::new(events);
        let engine = RoomEngine {
            session,
            http,
            relays,
            room: None,
            initiator: false,
            message_url: None,
            leave_url: None,
            relay: None,
            relay_events: None,
            requests: JoinSet::new(),
        };
        let task = tokio::spawn(engine.run(commands_rx));
        Self { commands, state, task }
    }

    /// A client whose relay is a [`crate::websocket::WebSocketChannel`].
    pub fn with_websocket(
        config: &SignalingConfig,
        events: Arc<dyn SignalingEvents>,
        http: Arc<dyn HttpClient>,
    ) -> Self {
        let relays = Arc::new(WebSocketChannelFactory::new(http.clone(), config.relay_close_timeout));
        Self::new(events, http, relays)
    }

    fn submit(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Room client engine has stopped, command dropped");
        }
    }

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

    /// Runs the commands already queued, leaves the room if still connected
    /// and waits for outstanding room server requests.
    pub async fn shutdown(self) {
        let Self { commands, task, .. } = self;
        drop(commands);
        if let Err(e) = task.await {
            error!("Room client engine failed: {e}");
        }
    }
}

struct RoomEngine {
    session: Session,
    http: Arc<dyn HttpClient>,
    relays: Arc<dyn RelayChannelFactory>,
    room: Option<RoomConnectionParameters>,
    initiator: bool,
    message_url: Option<String>,
    leave_url: Option<String>,
    relay: Option<Arc<dyn RelayChannel>>,
    relay_events: Option<ChannelEventReceiver>,
    requests: JoinSet<HttpOutcome>,
}

async fn next_relay_event(events: &mut Option<ChannelEventReceiver>) -> Option<ChannelEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

impl RoomEngine {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!("Room engine started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = next_relay_event(&mut self.relay_events) => match event {
                    Some(event) => self.handle_relay_event(event).await,
                    None => self.relay_events = None,
                },
                Some(done) = self.requests.join_next(), if !self.requests.is_empty() => {
                    self.handle_completion(done).await;
                }
            }
        }

        debug!("Room engine shutting down");
        self.drain_requests().await;
        if self.session.state() == ConnectionState::Connected {
            self.disconnect().await;
            self.drain_requests().await;
        } else if let Some(relay) = self.relay.take() {
            // Error stays the final state; only the channel is released.
            relay.disconnect_with(false).await;
        }
        debug!("Room engine stopped");
    }

    async fn drain_requests(&mut self) {
        while let Some(done) = self.requests.join_next().await {
            self.handle_completion(done).await;
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(params) => self.connect(params),
            Command::SendOffer(sdp) => self.send_offer(sdp),
            Command::SendAnswer(sdp) => self.send_answer(sdp).await,
            Command::SendCandidate(candidate) => self.send_candidate(candidate).await,
            Command::SendCandidateRemovals(candidates) => self.send_candidate_removals(candidates).await,
            Command::Disconnect => self.disconnect().await,
        }
    }

    fn is_loopback(&self) -> bool {
        self.room.as_ref().is_some_and(|room| room.loopback)
    }

    fn report(&self, error: SignalingError) {
        self.session.report_error(&error.to_string());
    }

    fn encode(&self, envelope: &Envelope) -> Option<String> {
        match envelope.encode() {
            Ok(text) => Some(text),
            Err(e) => {
                self.report(e.into());
                None
            }
        }
    }

    fn connect(&mut self, params: RoomConnectionParameters) {
        if self.session.state() != ConnectionState::New || self.room.is_some() {
            warn!("connect_to_room() ignored in state {}", self.session.state());
            return;
        }
        let url = params.join_url();
        info!("Connect to room: {url}");

        let (relay, relay_events) = self.relays.create_channel();
        self.relay = Some(relay);
        self.relay_events = Some(relay_events);
        self.room = Some(params);

        let http = self.http.clone();
        self.requests.spawn(async move { HttpOutcome::Join(fetch_room(http, url).await) });
    }

    async fn handle_completion(&mut self, done: std::result::Result<HttpOutcome, tokio::task::JoinError>) {
        match done {
            Ok(HttpOutcome::Join(result)) => self.handle_join(result).await,
            Ok(HttpOutcome::Message(result)) => self.handle_message_result(result),
            Ok(HttpOutcome::Leave(result)) => match result {
                Ok(body) => debug!("RS->C leave: {body}"),
                Err(e) => warn!("Leave request failed: {e}"),
            },
            Err(e) => error!("Room server request task failed: {e}"),
        }
    }

    async fn handle_join(&mut self, result: Result<SignalingParameters>) {
        if self.session.state() != ConnectionState::New {
            debug!("Room join completed in state {}, ignored", self.session.state());
            return;
        }
        let signaling = match result {
            Ok(signaling) => signaling,
            Err(e) => {
                self.report(e);
                return;
            }
        };

        let loopback = self.is_loopback();
        if loopback && (!signaling.initiator || signaling.offer_sdp.is_some()) {
            self.session.report_error("Loopback room is busy.");
            return;
        }
        if !loopback && !signaling.initiator && signaling.offer_sdp.is_none() {
            warn!("No offer SDP in room response.");
        }
        let Some(room) = self.room.clone() else {
            return;
        };
        let client_id = signaling.client_id.clone().unwrap_or_default();

        self.initiator = signaling.initiator;
        self.message_url = Some(room.message_url(&client_id));
        self.leave_url = Some(room.leave_url(&client_id));
        info!(
            "Room connection completed. Initiator: {}. Client id: {client_id}",
            signaling.initiator
        );
        self.session.set_state(ConnectionState::Connected);
        self.session.events().on_connected_to_room(&signaling);

        if let Some(relay) = &self.relay {
            relay
                .connect(
                    signaling.wss_url.as_deref().unwrap_or_default(),
                    signaling.wss_post_url.as_deref().unwrap_or_default(),
                )
                .await;
            relay.register(&room.room_id, &client_id).await;
        }
    }

    fn handle_message_result(&self, result: Result<String>) {
        let body = match result {
            Ok(body) => body,
            Err(e) => {
                self.session.report_error(&format!("Room server POST error: {e}"));
                return;
            }
        };
        debug!("RS->C: {body}");
        match check_message_result(&body) {
            Ok(()) => {}
            Err(ParamsError::Json(e)) => {
                self.session.report_error(&format!("Room server POST JSON error: {e}"));
            }
            Err(ParamsError::RoomResponse(result)) => {
                self.session.report_error(&format!("Room server POST error: {result}"));
            }
            Err(other) => self.session.report_error(&format!("Room server POST error: {other}")),
        }
    }

    /// Posts an envelope to the room server's message URL.
    fn post_message(&mut self, envelope: &Envelope) {
        let Some(url) = self.message_url.clone() else {
            return;
        };
        let Some(body) = self.encode(envelope) else {
            return;
        };
        debug!("C->RS: {body}");
        let http = self.http.clone();
        self.requests
            .spawn(async move { HttpOutcome::Message(post(http, url, Some(body)).await) });
    }

    async fn send_over_relay(&self, envelope: &Envelope) {
        let Some(text) = self.encode(envelope) else {
            return;
        };
        match &self.relay {
            Some(relay) => relay.send(&text).await,
            None => error!("No relay channel to send on: {text}"),
        }
    }

    fn send_offer(&mut self, sdp: SessionDescription) {
        if !self.session.require_connected("offer SDP") {
            return;
        }
        self.post_message(&Envelope::from(&sdp));
        if self.is_loopback() {
            // The room server never answers in loopback; mirror the offer.
            let answer = SessionDescription::answer(sdp.description);
            self.session.events().on_remote_description(&answer);
        }
    }

    async fn send_answer(&mut self, sdp: SessionDescription) {
        if self.is_loopback() {
            error!("Sending answer in loopback mode.");
            return;
        }
        if !self.session.require_connected("answer SDP") {
            return;
        }
        self.send_over_relay(&Envelope::from(&sdp)).await;
    }

    async fn send_candidate(&mut self, candidate: IceCandidate) {
        if !self.session.require_connected("ICE candidate") {
            return;
        }
        if self.initiator {
            self.post_message(&Envelope::Candidate(candidate.clone()));
            if self.is_loopback() {
                self.session.events().on_remote_ice_candidate(&candidate);
            }
        } else {
            self.send_over_relay(&Envelope::Candidate(candidate)).await;
        }
    }

    async fn send_candidate_removals(&mut self, candidates: Vec<IceCandidate>) {
        if !self.session.require_connected("ICE candidate removals") {
            return;
        }
        if self.initiator {
            self.post_message(&Envelope::RemoveCandidates {
                candidates: candidates.clone(),
            });
            if self.is_loopback() {
                self.session.events().on_remote_ice_candidates_removed(&candidates);
            }
        } else {
            self.send_over_relay(&Envelope::RemoveCandidates { candidates }).await;
        }
    }

    async fn disconnect(&mut self) {
        info!("Disconnect. Room state: {}", self.session.state());
        if self.session.state() == ConnectionState::Connected {
            info!("Closing room.");
            if let Some(url) = self.leave_url.clone() {
                let http = self.http.clone();
                self.requests
                    .spawn(async move { HttpOutcome::Leave(post(http, url, None).await) });
            }
        }
        self.session.set_state(ConnectionState::Closed);
        if let Some(relay) = self.relay.take() {
            relay.disconnect_with(true).await;
        }
        self.relay_events = None;
    }

    async fn handle_relay_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected { .. } => debug!("Relay channel connected"),
            ChannelEvent::Message(message) => self.handle_relay_message(&message),
            ChannelEvent::Error(description) => {
                self.session.report_error(&format!("WebSocket error: {description}"));
            }
            ChannelEvent::Closed => self.session.events().on_channel_close(),
        }
    }

    fn handle_relay_message(&self, message: &str) {
        let registered = self
            .relay
            .as_ref()
            .is_some_and(|relay| relay.state() == ChannelState::Registered);
        if !registered {
            error!("Got WebSocket message in non registered state.");
            return;
        }
        debug!("WSS->C: {message}");

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
                if self.initiator {
                    self.session
                        .report_error(&format!("Received offer for call receiver: {message}"));
                } else {
                    events.on_remote_description(&SessionDescription::offer(sdp));
                }
            }
            Ok(Envelope::Bye) => events.on_channel_close(),
            Err(EnvelopeError::Json(e)) => {
                self.session
                    .report_error(&format!("WebSocket message JSON parsing error: {e}"));
            }
            Err(_) => self
                .session
                .report_error(&format!("Unexpected WebSocket message: {message}")),
        }
    }
}

async fn fetch_room(http: Arc<dyn HttpClient>, url: String) -> Result<SignalingParameters> {
    let response = http
        .execute(HttpRequest::get(url.as_str()))
        .await
        .map_err(|e| SignalingError::Http(e.to_string()))?;
    if !response.is_success() {
        return Err(SignalingError::Status {
            method: "GET".to_string(),
            url,
            status: response.status_code,
        });
    }
    let body = response.body_string();
    debug!("Room response: {body}");
    Ok(SignalingParameters::from_join_response(&body)?)
}

async fn post(http: Arc<dyn HttpClient>, url: String, body: Option<String>) -> Result<String> {
    let mut request = HttpRequest::post(url.as_str()).with_header("Content-Type", POST_CONTENT_TYPE);
    if let Some(body) = body {
        request = request.with_body(body.into_bytes());
    }
    let response = http.execute(request).await.map_err(|e| SignalingError::Request {
        method: "POST".to_string(),
        url: url.clone(),
        reason: e.to_string(),
    })?;
    if !response.is_success() {
        return Err(SignalingError::Status {
            method: "POST".to_string(),
            url,
            status: response.status_code,
        });
    }
    Ok(response.body_string())
}
