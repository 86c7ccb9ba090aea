use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sigcore::net::{HttpClient, HttpRequest, HttpResponse};
use tokio::sync::mpsc;

use crate::channel::{
    ChannelEvent, ChannelEventReceiver, ChannelEventSender, ChannelState, RelayChannel,
    RelayChannelFactory, SignalingChannel,
};

pub const SUCCESS_BODY: &str = r#"{"result":"SUCCESS"}"#;

#[derive(Clone)]
enum Scripted {
    Respond(u16, String),
    Fail(String),
}

/// Records every request. Answers by the longest matching URL prefix, or
/// with `200 {"result":"SUCCESS"}` when nothing matches.
#[derive(Default)]
pub struct MockHttpClient {
    requests: Mutex<Vec<HttpRequest>>,
    scripts: Mutex<Vec<(String, Scripted)>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url_prefix: &str, status_code: u16, body: &str) {
        self.scripts
            .lock()
            .unwrap()
            .push((url_prefix.to_string(), Scripted::Respond(status_code, body.to_string())));
    }

    pub fn fail(&self, url_prefix: &str, message: &str) {
        self.scripts
            .lock()
            .unwrap()
            .push((url_prefix.to_string(), Scripted::Fail(message.to_string())));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, url_prefix: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.url.starts_with(url_prefix))
            .collect()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .iter()
            .filter(|(prefix, _)| request.url.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, script)| script.clone());
        self.requests.lock().unwrap().push(request);

        match script {
            Some(Scripted::Respond(status_code, body)) => Ok(HttpResponse {
                status_code,
                body: body.into_bytes(),
            }),
            Some(Scripted::Fail(message)) => Err(anyhow::anyhow!(message)),
            None => Ok(HttpResponse {
                status_code: 200,
                body: SUCCESS_BODY.as_bytes().to_vec(),
            }),
        }
    }
}

/// A relay channel that records calls. `connect` and `register` take effect
/// immediately without posting events; tests inject events themselves.
pub struct MockRelayChannel {
    state: Mutex<ChannelState>,
    sent: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
    events: ChannelEventSender,
}

impl MockRelayChannel {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn inject(&self, event: ChannelEvent) {
        self.events.send(event).unwrap();
    }
}

#[async_trait]
impl SignalingChannel for MockRelayChannel {
    async fn send(&self, message: &str) {
        self.sent.lock().unwrap().push(message.to_string());
    }

    async fn disconnect(&self) {
        self.disconnect_with(false).await;
    }
}

#[async_trait]
impl RelayChannel for MockRelayChannel {
    async fn connect(&self, ws_url: &str, post_url: &str) {
        self.calls.lock().unwrap().push(format!("connect {ws_url} {post_url}"));
        self.set_state(ChannelState::Connected);
    }

    async fn register(&self, room_id: &str, client_id: &str) {
        self.calls.lock().unwrap().push(format!("register {room_id} {client_id}"));
        self.set_state(ChannelState::Registered);
    }

    async fn disconnect_with(&self, wait_for_complete: bool) {
        self.calls.lock().unwrap().push(format!("disconnect {wait_for_complete}"));
        self.set_state(ChannelState::Closed);
    }

    fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }
}

#[derive(Default)]
pub struct MockRelayFactory {
    channels: Mutex<Vec<Arc<MockRelayChannel>>>,
}

impl MockRelayFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channels(&self) -> Vec<Arc<MockRelayChannel>> {
        self.channels.lock().unwrap().clone()
    }

    /// Waits until the engine has created its relay channel.
    pub async fn wait_for_channel(&self) -> Arc<MockRelayChannel> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(channel) = self.channels().last() {
                    return channel.clone();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for a relay channel")
    }
}

impl RelayChannelFactory for MockRelayFactory {
    fn create_channel(&self) -> (Arc<dyn RelayChannel>, ChannelEventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(MockRelayChannel {
            state: Mutex::new(ChannelState::New),
            sent: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            events: tx,
        });
        self.channels.lock().unwrap().push(channel.clone());
        (channel, rx)
    }
}

/// Receives the next signaling event, panicking after 5 s.
pub async fn next_event<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event sender dropped")
}
