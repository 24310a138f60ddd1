//! Media engine backed by the `webrtc` crate. A thin 1:1 adapter: trait
//! calls map straight onto the peer connection, and the peer connection's
//! callbacks are bridged into the session's event channel. No tracks are
//! attached here; the host application owns what flows over the link.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use super::{
    Candidate, ConnectionState, Description, DescriptionKind, IceConnectionState, MediaEngine,
    MediaEngineFactory, MediaError, MediaEvent, MediaEvents, SignalingState,
};

pub struct WebRtcEngine {
    peer_connection: Arc<RTCPeerConnection>,
    // The webrtc getters for descriptions are async; caching them at
    // set-time keeps the trait getters synchronous for the negotiator's
    // compound guard checks.
    local: Mutex<Option<Description>>,
    remote: Mutex<Option<Description>>,
}

impl WebRtcEngine {
    pub async fn create(
        config: RTCConfiguration,
    ) -> Result<(Arc<Self>, MediaEvents), MediaError> {
        let api = APIBuilder::new().build();
        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|err| MediaError::Capability(err.to_string()))?,
        );
        let (tx, rx) = mpsc::unbounded_channel();

        let events = tx.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            Box::pin(async move {
                // A null candidate means gathering has finished.
                let Some(candidate) = candidate else {
                    debug!(target: "beacon::media", "candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(MediaEvent::CandidateDiscovered(Candidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index.map(u32::from),
                        }));
                    }
                    Err(err) => {
                        warn!(target: "beacon::media", error = %err, "dropping unserializable candidate");
                    }
                }
            })
        }));

        let events = tx.clone();
        peer_connection.on_negotiation_needed(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(MediaEvent::NegotiationNeeded);
            })
        }));

        let events = tx.clone();
        peer_connection.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(MediaEvent::SignalingChange(map_signaling(state)));
            })
        }));

        let events = tx.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    let _ = events.send(MediaEvent::ConnectionChange(map_connection(state)));
                })
            },
        ));

        let events = tx;
        peer_connection.on_ice_connection_state_change(Box::new(
            move |state: RTCIceConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    let _ = events.send(MediaEvent::IceConnectionChange(map_ice(state)));
                })
            },
        ));

        Ok((
            Arc::new(Self {
                peer_connection,
                local: Mutex::new(None),
                remote: Mutex::new(None),
            }),
            rx,
        ))
    }

    /// The underlying peer connection, for hosts that attach tracks or data
    /// channels to the negotiated session.
    pub fn peer_connection(&self) -> Arc<RTCPeerConnection> {
        self.peer_connection.clone()
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<Description, MediaError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(engine_err)?;
        from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<Description, MediaError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(engine_err)?;
        from_rtc(&answer)
    }

    async fn set_local_description(&self, description: Description) -> Result<(), MediaError> {
        self.peer_connection
            .set_local_description(to_rtc(&description)?)
            .await
            .map_err(engine_err)?;
        *self.local.lock().expect("local lock") = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: Description) -> Result<(), MediaError> {
        self.peer_connection
            .set_remote_description(to_rtc(&description)?)
            .await
            .map_err(engine_err)?;
        *self.remote.lock().expect("remote lock") = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<(), MediaError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index.map(|index| index as u16),
            username_fragment: None,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(engine_err)
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling(self.peer_connection.signaling_state())
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection(self.peer_connection.connection_state())
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        map_ice(self.peer_connection.ice_connection_state())
    }

    fn local_description(&self) -> Option<Description> {
        self.local.lock().expect("local lock").clone()
    }

    fn remote_description(&self) -> Option<Description> {
        self.remote.lock().expect("remote lock").clone()
    }

    async fn close(&self) {
        if let Err(err) = self.peer_connection.close().await {
            debug!(target: "beacon::media", error = %err, "peer connection close");
        }
    }
}

fn engine_err(err: webrtc::Error) -> MediaError {
    MediaError::Engine(err.to_string())
}

fn to_rtc(description: &Description) -> Result<RTCSessionDescription, MediaError> {
    match description.kind {
        DescriptionKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        DescriptionKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
    }
    .map_err(engine_err)
}

fn from_rtc(description: &RTCSessionDescription) -> Result<Description, MediaError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => DescriptionKind::Offer,
        RTCSdpType::Answer => DescriptionKind::Answer,
        other => {
            return Err(MediaError::Engine(format!(
                "unsupported sdp type: {other}"
            )));
        }
    };
    Ok(Description {
        kind,
        sdp: description.sdp.clone(),
    })
}

fn map_signaling(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn map_connection(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn map_ice(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

/// Builds one fresh peer connection per session attempt.
#[derive(Default)]
pub struct WebRtcEngineFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcEngineFactory {
    pub fn new(ice_servers: Vec<RTCIceServer>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl MediaEngineFactory for WebRtcEngineFactory {
    async fn create(&self) -> Result<(Arc<dyn MediaEngine>, MediaEvents), MediaError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let (engine, events) = WebRtcEngine::create(config).await?;
        Ok((engine, events))
    }
}
