//! WebSocket channel to a room relay server.
//!
//! The relay only forwards traffic for registered clients, so the channel
//! walks `New -> Connecting -> Connected -> Registered`. Messages handed to
//! [`SignalingChannel::send`] before registration are queued and flushed, in
//! order, once the `register` command is written.

use crate::channel::{
    ChannelEvent, ChannelEventReceiver, ChannelEventSender, ChannelState, RelayChannel,
    RelayChannelFactory, SignalingChannel,
};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use sigcore::envelope::{Envelope, RelayCommand, RelayPayload};
use sigcore::net::{HttpClient, HttpRequest};
use sigcore::params::relay_registration_url;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

#[derive(Debug, Clone)]
struct Registration {
    room_id: String,
    client_id: String,
}

struct ChannelInner {
    state: ChannelState,
    post_url: String,
    registration: Option<Registration>,
    queued: Vec<String>,
}

struct Shared {
    inner: std::sync::Mutex<ChannelInner>,
    sink: Mutex<Option<WsSink>>,
    events: ChannelEventSender,
    closed: Notify,
    http: Arc<dyn HttpClient>,
}

impl Shared {
    fn inner(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ChannelState {
        self.inner().state
    }

    fn post(&self, event: ChannelEvent) {
        if self.events.send(event).is_err() {
            trace!("Channel event receiver dropped");
        }
    }

    /// Moves the channel to `Error` and reports it, once.
    fn report_error(&self, message: String) {
        error!("WebSocket error: {message}");
        let first = {
            let mut inner = self.inner();
            if inner.state == ChannelState::Error {
                false
            } else {
                inner.state = ChannelState::Error;
                true
            }
        };
        if first {
            self.post(ChannelEvent::Error(message));
        }
    }

    async fn open(self: Arc<Self>, ws_url: String) {
        let stream = match connect_async(ws_url.as_str()).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                self.report_error(format!("connecting to {ws_url} failed: {e}"));
                return;
            }
        };
        let (sink, stream) = stream.split();

        // The sink is in place before the state says so; `register` relies on it.
        let mut sink_guard = self.sink.lock().await;
        let registration = {
            let mut inner = self.inner();
            if inner.state != ChannelState::Connecting {
                debug!("WebSocket opened in state {}, dropping it", inner.state);
                return;
            }
            inner.state = ChannelState::Connected;
            inner.registration.clone()
        };
        *sink_guard = Some(sink);
        drop(sink_guard);

        info!("WebSocket connection opened to: {ws_url}");
        self.post(ChannelEvent::Connected { is_server: false });
        tokio::spawn(self.clone().read_pump(stream));

        if let Some(registration) = registration {
            self.register(registration).await;
        }
    }

    async fn register(&self, registration: Registration) {
        let state = {
            let mut inner = self.inner();
            inner.registration = Some(registration.clone());
            inner.state
        };
        if state != ChannelState::Connected {
            debug!("WebSocket register() deferred in state {state}");
            return;
        }

        info!(
            "Registering WebSocket for room {}. ClientID: {}",
            registration.room_id, registration.client_id
        );
        let command = RelayCommand::Register {
            roomid: &registration.room_id,
            clientid: &registration.client_id,
        };
        let command = match command.encode() {
            Ok(command) => command,
            Err(e) => {
                self.report_error(format!("register encoding failed: {e}"));
                return;
            }
        };

        // The sink stays locked until the backlog is written so that no
        // direct send can overtake a queued one.
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            drop(guard);
            self.report_error("register() on a closed socket".to_string());
            return;
        };

        // Registered before the command leaves: the relay forwards buffered
        // messages as soon as it reads it, and those must not be dropped.
        let queued = {
            let mut inner = self.inner();
            if inner.state != ChannelState::Connected {
                debug!("WebSocket register() abandoned in state {}", inner.state);
                return;
            }
            inner.state = ChannelState::Registered;
            std::mem::take(&mut inner.queued)
        };
        if let Err(e) = write(sink, command).await {
            drop(guard);
            self.report_error(e.to_string());
            return;
        }
        for message in queued {
            if let Err(e) = write_message(sink, &message).await {
                drop(guard);
                self.report_error(e.to_string());
                return;
            }
        }
    }

    async fn send(&self, message: &str) {
        {
            let mut inner = self.inner();
            match inner.state {
                ChannelState::New | ChannelState::Connecting | ChannelState::Connected => {
                    debug!("WS ACC: {message}");
                    inner.queued.push(message.to_string());
                    return;
                }
                ChannelState::Closed | ChannelState::Error => {
                    error!("WebSocket send() in error or closed state : {message}");
                    return;
                }
                ChannelState::Registered => {}
            }
        }

        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            drop(guard);
            self.report_error("send() on a closed socket".to_string());
            return;
        };
        if let Err(e) = write_message(sink, message).await {
            drop(guard);
            self.report_error(e.to_string());
        }
    }

    fn handle_text(&self, text: &str) {
        debug!("WSS->C: {text}");
        let state = self.state();
        if !matches!(state, ChannelState::Connected | ChannelState::Registered) {
            warn!("WebSocket message in state {state} ignored: {text}");
            return;
        }
        match RelayPayload::unwrap_frame(text) {
            Ok(RelayPayload::Message(message)) => self.post(ChannelEvent::Message(message)),
            Ok(RelayPayload::Error(description)) => {
                self.report_error(format!("WebSocket error message: {description}"))
            }
            Err(_) => self.report_error(format!("Unexpected WebSocket message: {text}")),
        }
    }

    async fn read_pump(self: Arc<Self>, mut stream: WsStream) {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                Some(Ok(Message::Close(frame))) => {
                    debug!("WebSocket close frame: {frame:?}");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    if self.state() != ChannelState::Closed {
                        self.report_error(e.to_string());
                    }
                    break;
                }
                None => {
                    trace!("WebSocket stream ended");
                    break;
                }
            }
        }

        self.closed.notify_one();
        let remote_close = {
            let mut inner = self.inner();
            if inner.state == ChannelState::Closed {
                false
            } else {
                inner.state = ChannelState::Closed;
                true
            }
        };
        if remote_close {
            info!("WebSocket connection closed by the relay");
            self.post(ChannelEvent::Closed);
        }
    }
}

async fn write(sink: &mut WsSink, text: String) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    debug!("C->WSS: {text}");
    sink.send(Message::text(text)).await
}

async fn write_message(
    sink: &mut WsSink,
    message: &str,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    match (RelayCommand::Send { msg: message }).encode() {
        Ok(command) => write(sink, command).await,
        Err(e) => {
            error!("Dropping message that cannot be wrapped: {e}");
            Ok(())
        }
    }
}

/// Relay transport backed by `tokio-tungstenite`.
pub struct WebSocketChannel {
    shared: Arc<Shared>,
    close_timeout: Duration,
}

impl WebSocketChannel {
    pub fn new(http: Arc<dyn HttpClient>, events: ChannelEventSender, close_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: std::sync::Mutex::new(ChannelInner {
                    state: ChannelState::New,
                    post_url: String::new(),
                    registration: None,
                    queued: Vec::new(),
                }),
                sink: Mutex::new(None),
                events,
                closed: Notify::new(),
                http,
            }),
            close_timeout,
        }
    }

    fn delete_registration(&self, post_url: &str, registration: &Registration) -> JoinHandle<()> {
        let url = relay_registration_url(post_url, &registration.room_id, &registration.client_id);
        let http = self.shared.http.clone();
        tokio::spawn(async move {
            debug!("WS DELETE : {url}");
            match http.execute(HttpRequest::delete(url.as_str())).await {
                Ok(response) if response.is_success() => trace!("WS DELETE done"),
                Ok(response) => warn!("WS DELETE error: status {}", response.status_code),
                Err(e) => warn!("WS DELETE error: {e}"),
            }
        })
    }
}

#[async_trait]
impl SignalingChannel for WebSocketChannel {
    async fn send(&self, message: &str) {
        self.shared.send(message).await;
    }

    async fn disconnect(&self) {
        self.disconnect_with(false).await;
    }
}

#[async_trait]
impl RelayChannel for WebSocketChannel {
    async fn connect(&self, ws_url: &str, post_url: &str) {
        {
            let mut inner = self.shared.inner();
            if inner.state != ChannelState::New {
                error!("WebSocket is already connected.");
                return;
            }
            inner.state = ChannelState::Connecting;
            inner.post_url = post_url.to_string();
        }
        info!("Connecting WebSocket to: {ws_url}. Post URL: {post_url}");
        tokio::spawn(self.shared.clone().open(ws_url.to_string()));
    }

    async fn register(&self, room_id: &str, client_id: &str) {
        self.shared
            .register(Registration {
                room_id: room_id.to_string(),
                client_id: client_id.to_string(),
            })
            .await;
    }

    async fn disconnect_with(&self, wait_for_complete: bool) {
        let state = self.shared.state();
        info!("Disconnect WebSocket. State: {state}");

        let mut deregistration = None;
        if state == ChannelState::Registered {
            if let Ok(bye) = Envelope::Bye.encode() {
                self.shared.send(&bye).await;
            }
            let (post_url, registration) = {
                let mut inner = self.shared.inner();
                if inner.state == ChannelState::Registered {
                    inner.state = ChannelState::Connected;
                }
                (inner.post_url.clone(), inner.registration.clone())
            };
            deregistration = registration
                .map(|registration| self.delete_registration(&post_url, &registration));
        }

        let state = {
            let mut inner = self.shared.inner();
            let state = inner.state;
            if state != ChannelState::Closed {
                inner.state = ChannelState::Closed;
            }
            state
        };
        match state {
            ChannelState::Connected | ChannelState::Error => {
                let sink = self.shared.sink.lock().await.take();
                if let Some(mut sink) = sink {
                    if let Err(e) = sink.close().await {
                        debug!("WebSocket close failed: {e}");
                    }
                    if wait_for_complete {
                        match tokio::time::timeout(self.close_timeout, self.shared.closed.notified())
                            .await
                        {
                            Ok(()) => debug!("WebSocket close confirmed"),
                            Err(_) => warn!(
                                "Wait for WebSocket close timed out after {:?}",
                                self.close_timeout
                            ),
                        }
                    }
                }
            }
            ChannelState::Closed => return,
            _ => {}
        }

        if let Some(deregistration) = deregistration.filter(|_| wait_for_complete) {
            match tokio::time::timeout(self.close_timeout, deregistration).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("WS DELETE task failed: {e}"),
                Err(_) => warn!("WS DELETE still pending after {:?}", self.close_timeout),
            }
        }
        info!("Disconnecting WebSocket done.");
    }

    fn state(&self) -> ChannelState {
        self.shared.state()
    }
}

/// Creates [`WebSocketChannel`]s that share one HTTP client.
pub struct WebSocketChannelFactory {
    http: Arc<dyn HttpClient>,
    close_timeout: Duration,
}

impl WebSocketChannelFactory {
    pub fn new(http: Arc<dyn HttpClient>, close_timeout: Duration) -> Self {
        Self { http, close_timeout }
    }
}

impl RelayChannelFactory for WebSocketChannelFactory {
    fn create_channel(&self) -> (Arc<dyn RelayChannel>, ChannelEventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = WebSocketChannel::new(self.http.clone(), tx, self.close_timeout);
        (Arc::new(channel), rx)
    }
}
