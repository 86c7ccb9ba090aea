use std::time::Duration;

/// Tunables shared by the room and direct-connect sessions.
#[derive(Clone, Debug)]
pub struct SignalingConfig {
    /// How long socket teardown waits for the connection worker to exit.
    pub socket_join_timeout: Duration,
    /// How long `disconnect(true)` on the relay channel waits for the close.
    pub relay_close_timeout: Duration,
    /// Port used when a direct-connect address carries none.
    pub default_direct_port: u16,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            socket_join_timeout: Duration::from_secs(1),
            relay_close_timeout: Duration::from_secs(1),
            default_direct_port: 8888,
        }
    }
}
