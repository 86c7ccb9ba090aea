use apprtc_signaling::{
    DirectClient, RoomClient, RoomConnectionParameters, SessionDescription, SignalingConfig, SignalingEvent,
};
use apprtc_signaling_ureq_http_client::UreqHttpClient;
use chrono::Local;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

// Drives one signaling session from the command line and logs every event.
//
// Usage:
//   cargo run -- room --server https://appr.tc --room 12345678
//   cargo run -- room --server https://appr.tc --room 12345678 --loopback
//   cargo run -- direct 0.0.0.0           # listen on the default port
//   cargo run -- direct 192.168.1.7:8888  # dial a listening peer

#[derive(Parser)]
#[command(version, about = "Peer session signaling client")]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Join a room on a room server.
    Room {
        #[arg(long)]
        server: String,
        #[arg(long)]
        room: String,
        /// Talk to ourselves: the offer is echoed back as the answer.
        #[arg(long)]
        loopback: bool,
        /// Extra query string for every room server URL.
        #[arg(long)]
        params: Option<String>,
    },
    /// Connect to a peer directly over TCP.
    Direct {
        /// `ip`, `ip:port`, `[v6]:port` or `localhost[:port]`; a wildcard
        /// address listens for the peer.
        address: String,
    },
}

enum Client {
    Room(RoomClient),
    Direct(DirectClient),
}

impl Client {
    fn send_offer_sdp(&self, sdp: SessionDescription) {
        match self {
            Self::Room(client) => client.send_offer_sdp(sdp),
            Self::Direct(client) => client.send_offer_sdp(sdp),
        }
    }

    fn disconnect_from_room(&self) {
        match self {
            Self::Room(client) => client.disconnect_from_room(),
            Self::Direct(client) => client.disconnect_from_room(),
        }
    }

    async fn shutdown(self) {
        match self {
            Self::Room(client) => client.shutdown().await,
            Self::Direct(client) => client.shutdown().await,
        }
    }
}

const PROBE_OFFER: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(run(cli));
    Ok(())
}

async fn run(cli: Cli) {
    let config = SignalingConfig::default();
    let (events_tx, mut events) = mpsc::unbounded_channel::<SignalingEvent>();
    let events_tx = Arc::new(events_tx);

    let (client, loopback) = match cli.mode {
        Mode::Room {
            server,
            room,
            loopback,
            params,
        } => {
            let mut parameters = RoomConnectionParameters::new(server, room).with_loopback(loopback);
            if let Some(params) = params {
                parameters = parameters.with_url_parameters(params);
            }
            let client = RoomClient::with_websocket(&config, events_tx, Arc::new(UreqHttpClient::new()));
            client.connect_to_room(parameters);
            (Client::Room(client), loopback)
        }
        Mode::Direct { address } => {
            let client = DirectClient::new(config, events_tx);
            client.connect_to_room(RoomConnectionParameters::new("", address));
            (Client::Direct(client), false)
        }
    };

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SignalingEvent::ConnectedToRoom(params) => {
                        info!(
                            "Connected. Initiator: {}, client id: {:?}, {} ICE servers, offer present: {}",
                            params.initiator,
                            params.client_id,
                            params.ice_servers.len(),
                            params.offer_sdp.is_some()
                        );
                        if loopback && params.initiator {
                            info!("Sending probe offer");
                            client.send_offer_sdp(SessionDescription::offer(PROBE_OFFER));
                        }
                    }
                    SignalingEvent::RemoteDescription(sdp) => {
                        info!("Remote {}: {:?}", sdp.sdp_type, sdp.description);
                    }
                    SignalingEvent::RemoteIceCandidate(candidate) => {
                        info!("Remote candidate {}:{} {}", candidate.sdp_mid, candidate.sdp_m_line_index, candidate.candidate);
                    }
                    SignalingEvent::RemoteIceCandidatesRemoved(candidates) => {
                        info!("Remote candidates removed: {}", candidates.len());
                    }
                    SignalingEvent::ChannelClose => {
                        warn!("Signaling channel closed");
                        break;
                    }
                    SignalingEvent::ChannelError(description) => {
                        error!("Signaling error: {description}");
                        break;
                    }
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {e}");
                }
                info!("Ctrl-C received, disconnecting");
                break;
            }
        }
    }

    client.disconnect_from_room();
    client.shutdown().await;
    info!("Done");
}
