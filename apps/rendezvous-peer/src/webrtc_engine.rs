use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rendezvous_proto::SessionDescription;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::engine::{ConnectionState, EngineError, EngineEvent, EngineEvents, TransportEngine};

pub const DATA_CHANNEL_LABEL: &str = "data";

type SharedChannel = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

/// [`TransportEngine`] backed by a single WebRTC peer connection carrying
/// one data channel. The initiator creates the channel; the responder
/// adopts whichever channel the remote opens.
pub struct WebRtcEngine {
    peer_connection: Arc<RTCPeerConnection>,
    data_channel: SharedChannel,
}

impl WebRtcEngine {
    pub async fn new(
        ice_servers: &[String],
        initiator: bool,
    ) -> Result<(Self, EngineEvents), EngineError> {
        let api = APIBuilder::new().build();
        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|err| EngineError::Setup(err.to_string()))?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let data_channel: SharedChannel = Arc::new(Mutex::new(None));

        let candidate_tx = events_tx.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    trace!("local candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(EngineEvent::LocalCandidate(init.candidate));
                    }
                    Err(err) => warn!(error = %err, "failed to serialize local candidate"),
                }
            })
        }));

        let state_tx = events_tx.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = state_tx.clone();
                Box::pin(async move {
                    debug!(?state, "peer connection state changed");
                    let _ = events.send(EngineEvent::ConnectionState(map_state(state)));
                })
            },
        ));

        if initiator {
            let dc = peer_connection
                .create_data_channel(DATA_CHANNEL_LABEL, None)
                .await
                .map_err(|err| EngineError::Setup(err.to_string()))?;
            attach_channel(dc.clone(), events_tx.clone());
            *data_channel.lock() = Some(dc);
        } else {
            let slot = data_channel.clone();
            let channel_tx = events_tx.clone();
            peer_connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let slot = slot.clone();
                let events = channel_tx.clone();
                Box::pin(async move {
                    debug!(label = dc.label(), "remote data channel announced");
                    attach_channel(dc.clone(), events);
                    *slot.lock() = Some(dc);
                })
            }));
        }

        Ok((
            Self {
                peer_connection,
                data_channel,
            },
            events_rx,
        ))
    }

    fn channel(&self) -> Result<Arc<RTCDataChannel>, EngineError> {
        self.data_channel
            .lock()
            .clone()
            .ok_or(EngineError::ChannelNotOpen)
    }
}

fn attach_channel(dc: Arc<RTCDataChannel>, events: mpsc::UnboundedSender<EngineEvent>) {
    let open_tx = events.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            let _ = open_tx.send(EngineEvent::ChannelOpen);
        })
    }));

    let message_tx = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_tx.clone();
        Box::pin(async move {
            let _ = events.send(EngineEvent::ChannelMessage(msg.data));
        })
    }));

    dc.on_close(Box::new(move || {
        let events = events.clone();
        Box::pin(async move {
            let _ = events.send(EngineEvent::ChannelClosed);
        })
    }));
}

fn map_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn to_rtc(description: &SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    Ok(description.to_typed()?)
}

#[async_trait]
impl TransportEngine for WebRtcEngine {
    async fn create_local_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|err| EngineError::CreateDescription {
                kind: "offer",
                reason: err.to_string(),
            })?;
        Ok(SessionDescription::from_typed(&offer)?)
    }

    async fn create_local_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|err| EngineError::CreateDescription {
                kind: "answer",
                reason: err.to_string(),
            })?;
        Ok(SessionDescription::from_typed(&answer)?)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.peer_connection
            .set_local_description(to_rtc(&description)?)
            .await
            .map_err(|err| EngineError::CommitDescription {
                side: "local",
                reason: err.to_string(),
            })
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.peer_connection
            .set_remote_description(to_rtc(&description)?)
            .await
            .map_err(|err| EngineError::CommitDescription {
                side: "remote",
                reason: err.to_string(),
            })
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            ..Default::default()
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|err| EngineError::Candidate(err.to_string()))
    }

    async fn send_text(&self, text: String) -> Result<(), EngineError> {
        self.channel()?
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|err| EngineError::Send(err.to_string()))
    }

    async fn send_bytes(&self, bytes: Bytes) -> Result<(), EngineError> {
        self.channel()?
            .send(&bytes)
            .await
            .map(|_| ())
            .map_err(|err| EngineError::Send(err.to_string()))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.peer_connection
            .close()
            .await
            .map_err(|err| EngineError::Close(err.to_string()))
    }
}
