//! Offer/answer negotiation state machine. One [`Negotiator`] drives one
//! attempt: it reacts to transport deliveries and media-engine events, owns
//! the candidate queue and the decode buffer, and tells the session loop
//! whether to keep going, tear down and retry, or stop.

use std::sync::Arc;

use tracing::{debug, info, warn};

use signal_transport::{
    Candidate, Decoder, Description, DescriptionKind, SignalMessage, SignalTransport,
    TransportError, TransportEvent,
};

use crate::media::{
    ConnectionState, IceConnectionState, MediaEngine, MediaError, MediaEvent, SignalingState,
};

pub mod queue;

pub use queue::CandidateQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the offer and resends it until answered.
    Offerer,
    /// Waits for a remote offer and answers it exactly once.
    Answerer,
}

/// Where one session attempt currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    AwaitingTransport,
    Negotiating,
    Connected,
    Closed,
}

/// Verdict handed back to the session loop after each event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// Tear the attempt down and build a fresh one.
    Restart,
    /// Unrecoverable; tear down and stop.
    Shutdown,
}

pub struct Negotiator {
    role: Role,
    engine: Arc<dyn MediaEngine>,
    transport: Arc<SignalTransport>,
    decoder: Decoder,
    queue: CandidateQueue,
    phase: SessionPhase,
    /// Offer created but not yet applied locally. Created at most once per
    /// attempt, however many times the engine asks for negotiation.
    pending_offer: Option<Description>,
    /// Inbound candidates that arrived ahead of the remote description; the
    /// engine cannot place them until it has one.
    early_candidates: Vec<Candidate>,
    resend_attempts: u32,
    max_resend_attempts: u32,
}

impl Negotiator {
    pub fn new(
        role: Role,
        engine: Arc<dyn MediaEngine>,
        transport: Arc<SignalTransport>,
        max_resend_attempts: u32,
    ) -> Self {
        let decoder = Decoder::new(transport.frame_config().clone());
        Self {
            role,
            engine,
            transport,
            decoder,
            queue: CandidateQueue::new(),
            phase: SessionPhase::AwaitingTransport,
            pending_offer: None,
            early_candidates: Vec::new(),
            resend_attempts: 0,
            max_resend_attempts,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn queued_candidates(&self) -> usize {
        self.queue.len()
    }

    /// Marks the attempt finished. Safe to call more than once; the engine
    /// and transport are closed by the session's teardown, not here.
    pub fn close(&mut self) {
        self.phase = SessionPhase::Closed;
        self.pending_offer = None;
        self.early_candidates.clear();
        self.queue.clear();
        self.decoder.reset();
    }

    pub async fn on_transport_event(&mut self, event: TransportEvent) -> Step {
        if self.phase == SessionPhase::Closed {
            return Step::Continue;
        }
        match event {
            TransportEvent::Listening(addr) => {
                debug!(target: "beacon::negotiation", %addr, "signaling channel listening");
                Step::Continue
            }
            TransportEvent::Connected(addr) => {
                info!(target: "beacon::negotiation", %addr, "signaling peer attached");
                self.phase = SessionPhase::Negotiating;
                // Queued candidates drain first; the offer commit/send
                // follows them, same order the periodic pass uses.
                self.flush_candidates().await;
                if self.role == Role::Offerer {
                    if let Err(step) = self.advance_offer().await {
                        return step;
                    }
                }
                Step::Continue
            }
            TransportEvent::Message(raw) => self.on_delivery(&raw).await,
            TransportEvent::Error(err) => {
                warn!(target: "beacon::negotiation", error = %err, "signaling channel failed");
                Step::Restart
            }
            TransportEvent::Closed => Step::Restart,
        }
    }

    pub async fn on_media_event(&mut self, event: MediaEvent) -> Step {
        if self.phase == SessionPhase::Closed {
            return Step::Continue;
        }
        match event {
            MediaEvent::CandidateDiscovered(candidate) => {
                self.queue.push(candidate);
                self.flush_candidates().await;
                Step::Continue
            }
            MediaEvent::NegotiationNeeded => match self.role {
                Role::Offerer => match self.advance_offer().await {
                    Ok(()) => Step::Continue,
                    Err(step) => step,
                },
                Role::Answerer => Step::Continue,
            },
            MediaEvent::SignalingChange(SignalingState::Closed) => {
                warn!(target: "beacon::negotiation", "media signaling closed underneath us");
                Step::Restart
            }
            MediaEvent::SignalingChange(state) => {
                debug!(target: "beacon::negotiation", ?state, "signaling state change");
                Step::Continue
            }
            MediaEvent::ConnectionChange(state) => match state {
                ConnectionState::Connected => {
                    self.mark_connected();
                    Step::Continue
                }
                ConnectionState::Failed | ConnectionState::Closed
                | ConnectionState::Disconnected => {
                    warn!(target: "beacon::negotiation", ?state, "media connection lost");
                    Step::Restart
                }
                _ => Step::Continue,
            },
            MediaEvent::IceConnectionChange(state) => match state {
                IceConnectionState::Connected | IceConnectionState::Completed => {
                    self.mark_connected();
                    Step::Continue
                }
                IceConnectionState::Disconnected | IceConnectionState::Failed => {
                    warn!(target: "beacon::negotiation", ?state, "ice connection lost");
                    Step::Restart
                }
                _ => Step::Continue,
            },
        }
    }

    /// Periodic pass: nudge the offer forward, retry queued candidates, and
    /// give up on the attempt once the budget runs out.
    pub async fn on_resend_tick(&mut self) -> Step {
        match self.phase {
            SessionPhase::Negotiating => {
                self.resend_attempts += 1;
                if self.resend_attempts > self.max_resend_attempts {
                    warn!(
                        target: "beacon::negotiation",
                        attempts = self.resend_attempts,
                        "negotiation did not converge, restarting"
                    );
                    return Step::Restart;
                }
                self.flush_candidates().await;
                if self.role == Role::Offerer {
                    if let Err(step) = self.advance_offer().await {
                        return step;
                    }
                }
                Step::Continue
            }
            _ => Step::Continue,
        }
    }

    async fn on_delivery(&mut self, raw: &[u8]) -> Step {
        let output = self.decoder.decode(raw);
        for err in &output.errors {
            warn!(target: "beacon::negotiation", error = %err, "dropped signaling chunk");
        }
        // Descriptions first: a delivery can carry an offer plus trailing
        // candidates, and candidates are meaningless before the description
        // they belong to is applied.
        let mut candidates = Vec::new();
        for message in output.messages {
            match message {
                SignalMessage::Description(description) => {
                    if let Err(step) = self.on_remote_description(description).await {
                        return step;
                    }
                }
                SignalMessage::Candidate(candidate) => candidates.push(candidate),
            }
        }
        for candidate in candidates {
            if let Err(step) = self.on_remote_candidate(candidate).await {
                return step;
            }
        }
        Step::Continue
    }

    async fn on_remote_description(&mut self, description: Description) -> Result<(), Step> {
        match (self.role, description.kind) {
            (Role::Offerer, DescriptionKind::Answer) => {
                if self.engine.remote_description().is_some() {
                    return Ok(());
                }
                self.engine
                    .set_remote_description(description)
                    .await
                    .map_err(media_step)?;
                info!(target: "beacon::negotiation", "remote answer applied");
                self.resend_attempts = 0;
                self.drain_early_candidates().await;
                Ok(())
            }
            (Role::Answerer, DescriptionKind::Offer) => {
                // The offerer resends until answered; only the first offer
                // is applied. A duplicate still retries the answer in case
                // the earlier send was lost.
                if self.engine.remote_description().is_none() {
                    self.engine
                        .set_remote_description(description)
                        .await
                        .map_err(media_step)?;
                    self.drain_early_candidates().await;
                }
                self.try_answer().await
            }
            (role, kind) => {
                warn!(
                    target: "beacon::negotiation",
                    ?role,
                    ?kind,
                    "ignoring description that does not fit our role"
                );
                Ok(())
            }
        }
    }

    async fn on_remote_candidate(&mut self, candidate: Candidate) -> Result<(), Step> {
        if self.engine.remote_description().is_none() {
            debug!(target: "beacon::negotiation", "candidate ahead of description, held");
            self.early_candidates.push(candidate);
            return Ok(());
        }
        self.apply_candidate(candidate).await;
        Ok(())
    }

    /// A candidate the engine rejects is dropped; one bad path proposal is
    /// no reason to abandon the negotiation.
    async fn apply_candidate(&mut self, candidate: Candidate) {
        if let Err(err) = self.engine.add_ice_candidate(candidate).await {
            warn!(target: "beacon::negotiation", error = %err, "candidate rejected");
        }
    }

    async fn drain_early_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.early_candidates) {
            self.apply_candidate(candidate).await;
        }
    }

    /// Offerer path, callable from any trigger: create the offer once,
    /// apply it locally when the engine is ready, and keep sending it until
    /// the peer answers.
    async fn advance_offer(&mut self) -> Result<(), Step> {
        if self.pending_offer.is_none() && self.engine.local_description().is_none() {
            let offer = self.engine.create_offer().await.map_err(media_step)?;
            debug!(target: "beacon::negotiation", "offer created");
            self.pending_offer = Some(offer);
        }

        // Commit gate: engine stable, transport has a peer, nothing applied
        // locally yet. Anything else and we hold the offer for a later
        // trigger.
        if let Some(offer) = self.pending_offer.clone() {
            if self.engine.signaling_state() == SignalingState::Stable
                && self.transport.connected()
                && self.engine.local_description().is_none()
            {
                self.engine
                    .set_local_description(offer)
                    .await
                    .map_err(media_step)?;
                info!(target: "beacon::negotiation", "local offer committed");
            }
        }

        // Resend until answered. The peer treats duplicates as no-ops.
        if let Some(local) = self.engine.local_description() {
            if local.kind == DescriptionKind::Offer
                && self.engine.remote_description().is_none()
                && self.transport.connected()
            {
                if let Err(err) = self.send(&SignalMessage::Description(local)).await {
                    warn!(target: "beacon::negotiation", error = %err, "offer send failed");
                }
            }
        }
        Ok(())
    }

    /// Answerer path: answer exactly once, and only while the engine is in a
    /// state that expects one.
    async fn try_answer(&mut self) -> Result<(), Step> {
        if !self.engine.signaling_state().expects_local_answer()
            || self.engine.local_description().is_some()
            || self.transport.is_closed()
        {
            return Ok(());
        }
        let answer = self.engine.create_answer().await.map_err(media_step)?;
        self.engine
            .set_local_description(answer.clone())
            .await
            .map_err(media_step)?;
        if let Err(err) = self.send(&SignalMessage::Description(answer)).await {
            warn!(target: "beacon::negotiation", error = %err, "answer send failed");
            return Err(Step::Restart);
        }
        info!(target: "beacon::negotiation", "answer sent");
        Ok(())
    }

    /// Drain the candidate queue in discovery order. A failed send puts the
    /// candidate back at the head and stops the pass; the resend tick picks
    /// it up again.
    async fn flush_candidates(&mut self) {
        if !self.transport.connected() {
            return;
        }
        while let Some(candidate) = self.queue.pop() {
            if let Err(err) = self
                .send(&SignalMessage::Candidate(candidate.clone()))
                .await
            {
                warn!(target: "beacon::negotiation", error = %err, "candidate send failed");
                self.queue.requeue(candidate);
                break;
            }
        }
    }

    fn mark_connected(&mut self) {
        if self.phase != SessionPhase::Connected {
            info!(target: "beacon::negotiation", role = ?self.role, "media link up");
            self.phase = SessionPhase::Connected;
            self.resend_attempts = 0;
        }
    }

    async fn send(&self, message: &SignalMessage) -> Result<(), TransportError> {
        let json = serde_json::to_vec(message)
            .map_err(|err| TransportError::Send(err.to_string()))?;
        self.transport.send(&json).await
    }
}

fn media_step(err: MediaError) -> Step {
    match err {
        MediaError::Capability(reason) => {
            warn!(target: "beacon::negotiation", %reason, "media capability unavailable");
            Step::Shutdown
        }
        MediaError::Engine(reason) => {
            warn!(target: "beacon::negotiation", %reason, "media engine error");
            Step::Restart
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::MockEngine;
    use signal_transport::{Endpoint, FrameConfig, SocketKind};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn next_event(rx: &mut UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("transport event channel closed")
    }

    /// Two datagram transports attached to each other over loopback, with
    /// the Listening/Connected preamble already consumed.
    async fn attached_pair() -> (
        Arc<SignalTransport>,
        UnboundedReceiver<TransportEvent>,
        Arc<SignalTransport>,
        UnboundedReceiver<TransportEvent>,
    ) {
        let (listener, mut listener_rx) =
            SignalTransport::new(SocketKind::Datagram, FrameConfig::default());
        let (dialer, mut dialer_rx) =
            SignalTransport::new(SocketKind::Datagram, FrameConfig::default());

        let bound = listener
            .listen(&Endpoint::new("127.0.0.1", 0))
            .await
            .expect("listen");
        assert!(matches!(
            next_event(&mut listener_rx).await,
            TransportEvent::Listening(_)
        ));
        dialer
            .connect(&Endpoint::new("127.0.0.1", bound.port()))
            .await
            .expect("connect");
        assert!(matches!(
            next_event(&mut listener_rx).await,
            TransportEvent::Connected(_)
        ));

        (
            Arc::new(listener),
            listener_rx,
            Arc::new(dialer),
            dialer_rx,
        )
    }

    async fn recv_message(rx: &mut UnboundedReceiver<TransportEvent>) -> SignalMessage {
        loop {
            if let TransportEvent::Message(raw) = next_event(rx).await {
                let mut decoder = Decoder::new(FrameConfig::default());
                let mut output = decoder.decode(&raw);
                assert!(output.errors.is_empty());
                return output.messages.remove(0);
            }
        }
    }

    #[tokio::test]
    async fn offer_is_created_and_committed_once() {
        let (listener, _listener_rx, dialer, mut dialer_rx) = attached_pair().await;
        let (engine, _events) = MockEngine::create("offer-sdp");
        let mut negotiator = Negotiator::new(Role::Offerer, engine.clone(), listener, 30);

        for _ in 0..3 {
            let step = negotiator.on_media_event(MediaEvent::NegotiationNeeded).await;
            assert_eq!(step, Step::Continue);
        }

        assert_eq!(engine.offers_created(), 1);
        assert_eq!(engine.local_applies(), 1);
        assert_eq!(negotiator.phase(), SessionPhase::AwaitingTransport);

        match recv_message(&mut dialer_rx).await {
            SignalMessage::Description(description) => {
                assert_eq!(description.kind, DescriptionKind::Offer);
                assert_eq!(description.sdp, "offer-sdp");
            }
            other => panic!("expected offer, got {other:?}"),
        }
        drop(dialer);
    }

    #[tokio::test]
    async fn offer_resends_until_answered() {
        let (listener, _listener_rx, _dialer, mut dialer_rx) = attached_pair().await;
        let (engine, _events) = MockEngine::create("offer-sdp");
        let mut negotiator = Negotiator::new(Role::Offerer, engine.clone(), listener, 30);

        negotiator
            .on_transport_event(TransportEvent::Connected(
                "127.0.0.1:1".parse().unwrap(),
            ))
            .await;
        assert_eq!(negotiator.phase(), SessionPhase::Negotiating);
        assert_eq!(negotiator.on_resend_tick().await, Step::Continue);
        assert_eq!(negotiator.on_resend_tick().await, Step::Continue);

        // Initial send plus two ticks, single create/apply throughout.
        for _ in 0..3 {
            match recv_message(&mut dialer_rx).await {
                SignalMessage::Description(description) => {
                    assert_eq!(description.kind, DescriptionKind::Offer)
                }
                other => panic!("expected offer, got {other:?}"),
            }
        }
        assert_eq!(engine.offers_created(), 1);
        assert_eq!(engine.local_applies(), 1);
    }

    #[tokio::test]
    async fn answerer_answers_a_remote_offer_exactly_once() {
        let (listener, mut listener_rx, dialer, _dialer_rx) = attached_pair().await;
        let (engine, _events) = MockEngine::create("answer-sdp");
        let mut negotiator = Negotiator::new(Role::Answerer, engine.clone(), dialer, 30);

        let offer = SignalMessage::Description(Description::offer("remote-offer"));
        let raw = serde_json::to_vec(&offer).unwrap();

        // The offerer resends; every duplicate must be a no-op.
        for _ in 0..3 {
            let step = negotiator
                .on_transport_event(TransportEvent::Message(raw.clone().into()))
                .await;
            assert_eq!(step, Step::Continue);
        }

        assert_eq!(engine.answers_created(), 1);
        assert_eq!(engine.remote_applies(), 1);
        match recv_message(&mut listener_rx).await {
            SignalMessage::Description(description) => {
                assert_eq!(description.kind, DescriptionKind::Answer);
                assert_eq!(description.sdp, "answer-sdp");
            }
            other => panic!("expected answer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_remote_offer_is_ignored_not_reapplied() {
        let (listener, mut listener_rx, dialer, _dialer_rx) = attached_pair().await;
        let (engine, _events) = MockEngine::create("answer-sdp");
        let mut negotiator = Negotiator::new(Role::Answerer, engine.clone(), dialer, 30);

        for sdp in ["O1", "O2"] {
            let offer = serde_json::to_vec(&SignalMessage::Description(Description::offer(sdp)))
                .unwrap();
            let step = negotiator
                .on_transport_event(TransportEvent::Message(offer.into()))
                .await;
            assert_eq!(step, Step::Continue);
        }

        // The first offer sticks; the differing second one never reaches
        // the engine.
        assert_eq!(engine.remote_applies(), 1);
        assert_eq!(engine.remote_description().map(|d| d.sdp), Some("O1".into()));
        assert_eq!(engine.answers_created(), 1);
        match recv_message(&mut listener_rx).await {
            SignalMessage::Description(description) => {
                assert_eq!(description.kind, DescriptionKind::Answer)
            }
            other => panic!("expected answer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn candidates_queue_until_peer_attaches_then_flush_in_order() {
        let (listener, mut listener_rx) =
            SignalTransport::new(SocketKind::Datagram, FrameConfig::default());
        let bound = listener
            .listen(&Endpoint::new("127.0.0.1", 0))
            .await
            .expect("listen");
        assert!(matches!(
            next_event(&mut listener_rx).await,
            TransportEvent::Listening(_)
        ));
        let listener = Arc::new(listener);

        let (engine, _events) = MockEngine::create("sdp");
        let mut negotiator = Negotiator::new(Role::Offerer, engine, listener.clone(), 30);

        for tag in ["a", "b", "c"] {
            let step = negotiator
                .on_media_event(MediaEvent::CandidateDiscovered(Candidate::new(format!(
                    "candidate:{tag}"
                ))))
                .await;
            assert_eq!(step, Step::Continue);
        }
        assert_eq!(negotiator.queued_candidates(), 3);

        let (dialer, mut dialer_rx) =
            SignalTransport::new(SocketKind::Datagram, FrameConfig::default());
        dialer
            .connect(&Endpoint::new("127.0.0.1", bound.port()))
            .await
            .expect("connect");
        let connected = next_event(&mut listener_rx).await;
        assert!(matches!(connected, TransportEvent::Connected(_)));

        negotiator.on_transport_event(connected).await;
        assert_eq!(negotiator.queued_candidates(), 0);

        for tag in ["a", "b", "c"] {
            match recv_message(&mut dialer_rx).await {
                SignalMessage::Candidate(candidate) => {
                    assert_eq!(candidate.candidate, format!("candidate:{tag}"))
                }
                other => panic!("expected candidate, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn remote_candidates_wait_for_a_description() {
        let (_listener, _listener_rx, dialer, _dialer_rx) = attached_pair().await;
        let (engine, _events) = MockEngine::create("sdp");
        let mut negotiator = Negotiator::new(Role::Answerer, engine.clone(), dialer, 30);

        let early = serde_json::to_vec(&SignalMessage::Candidate(Candidate::new(
            "candidate:early",
        )))
        .unwrap();
        negotiator
            .on_transport_event(TransportEvent::Message(early.into()))
            .await;
        assert!(engine.applied_candidates().is_empty());

        // The held candidate applies right after the description does.
        let offer = serde_json::to_vec(&SignalMessage::Description(Description::offer("o")))
            .unwrap();
        negotiator
            .on_transport_event(TransportEvent::Message(offer.into()))
            .await;
        let follow = serde_json::to_vec(&SignalMessage::Candidate(Candidate::new(
            "candidate:late",
        )))
        .unwrap();
        negotiator
            .on_transport_event(TransportEvent::Message(follow.into()))
            .await;
        let applied: Vec<String> = engine
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, vec!["candidate:early", "candidate:late"]);
    }

    #[tokio::test]
    async fn resend_budget_exhaustion_requests_restart() {
        let (listener, _listener_rx, _dialer, _dialer_rx) = attached_pair().await;
        let (engine, _events) = MockEngine::create("sdp");
        let mut negotiator = Negotiator::new(Role::Offerer, engine, listener, 2);

        negotiator
            .on_transport_event(TransportEvent::Connected(
                "127.0.0.1:1".parse().unwrap(),
            ))
            .await;
        assert_eq!(negotiator.on_resend_tick().await, Step::Continue);
        assert_eq!(negotiator.on_resend_tick().await, Step::Continue);
        assert_eq!(negotiator.on_resend_tick().await, Step::Restart);
    }

    #[tokio::test]
    async fn transport_failure_requests_restart() {
        let (listener, _listener_rx, _dialer, _dialer_rx) = attached_pair().await;
        let (engine, _events) = MockEngine::create("sdp");
        let mut negotiator = Negotiator::new(Role::Offerer, engine, listener, 30);

        let step = negotiator
            .on_transport_event(TransportEvent::Error(TransportError::Socket(
                "connection reset".into(),
            )))
            .await;
        assert_eq!(step, Step::Restart);
    }

    #[tokio::test]
    async fn media_failure_requests_restart_and_close_silences_events() {
        let (listener, _listener_rx, _dialer, _dialer_rx) = attached_pair().await;
        let (engine, _events) = MockEngine::create("sdp");
        let mut negotiator = Negotiator::new(Role::Offerer, engine, listener, 30);

        let step = negotiator
            .on_media_event(MediaEvent::ConnectionChange(ConnectionState::Failed))
            .await;
        assert_eq!(step, Step::Restart);

        negotiator.close();
        let step = negotiator
            .on_media_event(MediaEvent::ConnectionChange(ConnectionState::Failed))
            .await;
        assert_eq!(step, Step::Continue);
        assert_eq!(negotiator.phase(), SessionPhase::Closed);
    }

    #[tokio::test]
    async fn ice_connected_marks_the_session_up() {
        let (listener, _listener_rx, _dialer, _dialer_rx) = attached_pair().await;
        let (engine, _events) = MockEngine::create("sdp");
        let mut negotiator = Negotiator::new(Role::Offerer, engine, listener, 30);

        negotiator
            .on_transport_event(TransportEvent::Connected(
                "127.0.0.1:1".parse().unwrap(),
            ))
            .await;
        let step = negotiator
            .on_media_event(MediaEvent::IceConnectionChange(
                IceConnectionState::Connected,
            ))
            .await;
        assert_eq!(step, Step::Continue);
        assert_eq!(negotiator.phase(), SessionPhase::Connected);

        // Ticks while connected are free; the budget only applies while
        // negotiating.
        for _ in 0..50 {
            assert_eq!(negotiator.on_resend_tick().await, Step::Continue);
        }
    }
}
