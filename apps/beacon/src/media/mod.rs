//! Media-engine capability boundary. The engine owns offer/answer creation,
//! description application, and candidate gathering; this crate only drives
//! it. Duplicate description/candidate application must be a safe no-op on
//! the engine's side (the at-least-once resend policy relies on it).

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use signal_transport::{Candidate, Description, DescriptionKind};

pub mod mock;
pub mod webrtc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl SignalingState {
    /// States in which the engine expects a local answer next.
    pub fn expects_local_answer(self) -> bool {
        matches!(
            self,
            SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPranswer
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    CandidateDiscovered(Candidate),
    NegotiationNeeded,
    SignalingChange(SignalingState),
    ConnectionChange(ConnectionState),
    IceConnectionChange(IceConnectionState),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("local media capability unavailable: {0}")]
    Capability(String),
    #[error("media engine error: {0}")]
    Engine(String),
}

pub type MediaEvents = mpsc::UnboundedReceiver<MediaEvent>;

/// One negotiation's media engine. Owned exclusively by one session attempt;
/// never reused across attempts.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_offer(&self) -> Result<Description, MediaError>;
    async fn create_answer(&self) -> Result<Description, MediaError>;
    async fn set_local_description(&self, description: Description) -> Result<(), MediaError>;
    async fn set_remote_description(&self, description: Description) -> Result<(), MediaError>;
    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<(), MediaError>;

    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> ConnectionState;
    fn ice_connection_state(&self) -> IceConnectionState;
    fn local_description(&self) -> Option<Description>;
    fn remote_description(&self) -> Option<Description>;

    /// Idempotent; the engine's queued callbacks observe the closed state
    /// and exit early.
    async fn close(&self);
}

/// Builds a fresh engine (and its event stream) per session attempt.
#[async_trait]
pub trait MediaEngineFactory: Send + Sync {
    async fn create(&self) -> Result<(Arc<dyn MediaEngine>, MediaEvents), MediaError>;
}
