//! Deterministic in-process media engine for tests. Follows the real
//! signaling-state dance (stable -> have-*-offer -> stable) and reports the
//! link as connected once both descriptions are applied, which is enough to
//! exercise every negotiation path without a network.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    Candidate, ConnectionState, Description, DescriptionKind, IceConnectionState, MediaEngine,
    MediaEngineFactory, MediaError, MediaEvent, MediaEvents, SignalingState,
};

struct State {
    signaling: SignalingState,
    connection: ConnectionState,
    ice: IceConnectionState,
    local: Option<Description>,
    remote: Option<Description>,
    applied_candidates: Vec<Candidate>,
    offers_created: usize,
    answers_created: usize,
    local_applies: usize,
    remote_applies: usize,
    closed: bool,
}

pub struct MockEngine {
    sdp: String,
    state: Mutex<State>,
    events: mpsc::UnboundedSender<MediaEvent>,
}

impl MockEngine {
    /// `sdp` seeds the bodies handed out by create_offer/create_answer.
    pub fn create(sdp: impl Into<String>) -> (Arc<Self>, MediaEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            sdp: sdp.into(),
            state: Mutex::new(State {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                ice: IceConnectionState::New,
                local: None,
                remote: None,
                applied_candidates: Vec::new(),
                offers_created: 0,
                answers_created: 0,
                local_applies: 0,
                remote_applies: 0,
                closed: false,
            }),
            events: tx,
        });
        (engine, rx)
    }

    fn emit(&self, event: MediaEvent) {
        let _ = self.events.send(event);
    }

    // -- test drivers ------------------------------------------------------

    pub fn trigger_negotiation_needed(&self) {
        self.emit(MediaEvent::NegotiationNeeded);
    }

    pub fn discover_candidate(&self, candidate: Candidate) {
        self.emit(MediaEvent::CandidateDiscovered(candidate));
    }

    pub fn fail_connection(&self) {
        let mut state = self.state.lock().expect("state lock");
        state.connection = ConnectionState::Failed;
        drop(state);
        self.emit(MediaEvent::ConnectionChange(ConnectionState::Failed));
    }

    pub fn drop_ice(&self) {
        let mut state = self.state.lock().expect("state lock");
        state.ice = IceConnectionState::Disconnected;
        drop(state);
        self.emit(MediaEvent::IceConnectionChange(IceConnectionState::Disconnected));
    }

    // -- test probes -------------------------------------------------------

    pub fn applied_candidates(&self) -> Vec<Candidate> {
        self.state.lock().expect("state lock").applied_candidates.clone()
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().expect("state lock").offers_created
    }

    pub fn answers_created(&self) -> usize {
        self.state.lock().expect("state lock").answers_created
    }

    pub fn local_applies(&self) -> usize {
        self.state.lock().expect("state lock").local_applies
    }

    pub fn remote_applies(&self) -> usize {
        self.state.lock().expect("state lock").remote_applies
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("state lock").closed
    }

    fn set_signaling(&self, state: &mut State, next: SignalingState) {
        if state.signaling != next {
            state.signaling = next;
            self.emit(MediaEvent::SignalingChange(next));
        }
    }

    /// Both descriptions in place: report the link as up, once.
    fn maybe_connect(&self, state: &mut State) {
        if state.local.is_some()
            && state.remote.is_some()
            && state.ice != IceConnectionState::Connected
        {
            state.connection = ConnectionState::Connected;
            state.ice = IceConnectionState::Connected;
            self.emit(MediaEvent::ConnectionChange(ConnectionState::Connected));
            self.emit(MediaEvent::IceConnectionChange(IceConnectionState::Connected));
        }
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn create_offer(&self) -> Result<Description, MediaError> {
        let mut state = self.state.lock().expect("state lock");
        if state.closed {
            return Err(MediaError::Engine("engine closed".into()));
        }
        state.offers_created += 1;
        Ok(Description::offer(self.sdp.clone()))
    }

    async fn create_answer(&self) -> Result<Description, MediaError> {
        let mut state = self.state.lock().expect("state lock");
        if state.closed {
            return Err(MediaError::Engine("engine closed".into()));
        }
        if state.remote.is_none() {
            return Err(MediaError::Engine("no remote offer to answer".into()));
        }
        state.answers_created += 1;
        Ok(Description::answer(self.sdp.clone()))
    }

    async fn set_local_description(&self, description: Description) -> Result<(), MediaError> {
        let mut state = self.state.lock().expect("state lock");
        if state.closed {
            return Err(MediaError::Engine("engine closed".into()));
        }
        // Duplicate application is a no-op per the capability contract.
        if state.local.as_ref() == Some(&description) {
            return Ok(());
        }
        state.local_applies += 1;
        let next = match description.kind {
            DescriptionKind::Offer => SignalingState::HaveLocalOffer,
            DescriptionKind::Answer => SignalingState::Stable,
        };
        state.local = Some(description);
        self.set_signaling(&mut state, next);
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn set_remote_description(&self, description: Description) -> Result<(), MediaError> {
        let mut state = self.state.lock().expect("state lock");
        if state.closed {
            return Err(MediaError::Engine("engine closed".into()));
        }
        if state.remote.as_ref() == Some(&description) {
            return Ok(());
        }
        state.remote_applies += 1;
        let next = match description.kind {
            DescriptionKind::Offer => SignalingState::HaveRemoteOffer,
            DescriptionKind::Answer => SignalingState::Stable,
        };
        state.remote = Some(description);
        self.set_signaling(&mut state, next);
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<(), MediaError> {
        let mut state = self.state.lock().expect("state lock");
        if state.closed {
            return Err(MediaError::Engine("engine closed".into()));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().expect("state lock").signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().expect("state lock").connection
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().expect("state lock").ice
    }

    fn local_description(&self) -> Option<Description> {
        self.state.lock().expect("state lock").local.clone()
    }

    fn remote_description(&self) -> Option<Description> {
        self.state.lock().expect("state lock").remote.clone()
    }

    async fn close(&self) {
        let mut state = self.state.lock().expect("state lock");
        if state.closed {
            return;
        }
        state.closed = true;
        state.signaling = SignalingState::Closed;
        state.connection = ConnectionState::Closed;
        state.ice = IceConnectionState::Closed;
    }
}

/// Factory that records every engine it hands out so tests can inspect them
/// after the session tore the attempt down.
#[derive(Default)]
pub struct MockEngineFactory {
    sdp: String,
    negotiation_needed_on_create: bool,
    created: Mutex<Vec<Arc<MockEngine>>>,
}

impl MockEngineFactory {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            negotiation_needed_on_create: false,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Fire `NegotiationNeeded` as soon as an engine is created, the way a
    /// real engine does once local media is attached.
    pub fn with_negotiation_needed(mut self) -> Self {
        self.negotiation_needed_on_create = true;
        self
    }

    pub fn created(&self) -> Vec<Arc<MockEngine>> {
        self.created.lock().expect("created lock").clone()
    }
}

#[async_trait]
impl MediaEngineFactory for MockEngineFactory {
    async fn create(&self) -> Result<(Arc<dyn MediaEngine>, MediaEvents), MediaError> {
        let (engine, events) = MockEngine::create(self.sdp.clone());
        if self.negotiation_needed_on_create {
            engine.trigger_negotiation_needed();
        }
        self.created.lock().expect("created lock").push(engine.clone());
        Ok((engine, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_description_apply_is_a_no_op() {
        let (engine, _events) = MockEngine::create("sdp");
        let offer = Description::offer("sdp");
        engine.set_remote_description(offer.clone()).await.expect("apply");
        engine.set_remote_description(offer).await.expect("reapply");
        assert_eq!(engine.remote_applies(), 1);
        assert_eq!(engine.signaling_state(), SignalingState::HaveRemoteOffer);
    }

    #[tokio::test]
    async fn link_comes_up_once_both_descriptions_are_set() {
        let (engine, mut events) = MockEngine::create("sdp");
        engine
            .set_remote_description(Description::offer("o"))
            .await
            .expect("remote");
        assert_eq!(engine.ice_connection_state(), IceConnectionState::New);
        engine
            .set_local_description(Description::answer("a"))
            .await
            .expect("local");
        assert_eq!(engine.ice_connection_state(), IceConnectionState::Connected);

        let mut saw_ice_connected = false;
        while let Ok(event) = events.try_recv() {
            if event == MediaEvent::IceConnectionChange(IceConnectionState::Connected) {
                saw_ice_connected = true;
            }
        }
        assert!(saw_ice_connected);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_further_work() {
        let (engine, _events) = MockEngine::create("sdp");
        engine.close().await;
        engine.close().await;
        assert!(engine.is_closed());
        assert!(engine.create_offer().await.is_err());
    }
}
