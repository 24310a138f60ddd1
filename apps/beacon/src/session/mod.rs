//! Session lifecycle controller. One [`Session`] owns the whole bootstrap:
//! it builds a fresh media engine and signaling transport per attempt,
//! drives the [`Negotiator`] off their event streams, and tears everything
//! down and retries when an attempt dies. Teardown is idempotent; every
//! restart starts from clean objects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use signal_transport::{
    Endpoint, FrameConfig, SignalTransport, SocketKind, TransportError, TransportEvent,
};

use crate::media::{MediaEngine, MediaEngineFactory, MediaError, MediaEvents};
use crate::negotiation::{Negotiator, Role, SessionPhase, Step};

pub mod ticket;

pub use ticket::{RendezvousTicket, TicketError};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub role: Role,
    /// Local listen endpoint for the offerer, the host's endpoint for the
    /// answerer.
    pub endpoint: Endpoint,
    pub socket: SocketKind,
    pub frame: FrameConfig,
    pub resend_interval: Duration,
    pub max_resend_attempts: u32,
    pub capture_interval: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("host unreachable after {attempts} dial attempts")]
    DialExhausted { attempts: u32 },
}

/// Invoked on a fixed interval while the media link is up. The original use
/// is grabbing a frame from the live session for downstream processing.
#[async_trait]
pub trait CaptureHook: Send + Sync {
    async fn capture(&self);
}

/// Remote control for a running session: request shutdown, observe phase.
#[derive(Clone)]
pub struct SessionHandle {
    shutdown: watch::Sender<bool>,
    phase: watch::Receiver<SessionPhase>,
}

impl SessionHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    /// Wait until the session reaches `phase` (or the session ends).
    pub async fn wait_for(&mut self, phase: SessionPhase) {
        while *self.phase.borrow_and_update() != phase {
            if self.phase.changed().await.is_err() {
                return;
            }
        }
    }
}

pub struct Session {
    config: SessionConfig,
    factory: Arc<dyn MediaEngineFactory>,
    capture_hook: Option<Arc<dyn CaptureHook>>,
    shutdown: watch::Receiver<bool>,
    phase: watch::Sender<SessionPhase>,
}

impl Session {
    pub fn new(config: SessionConfig, factory: Arc<dyn MediaEngineFactory>) -> (Self, SessionHandle) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Idle);
        let session = Self {
            config,
            factory,
            capture_hook: None,
            shutdown: shutdown_rx,
            phase: phase_tx,
        };
        let handle = SessionHandle {
            shutdown: shutdown_tx,
            phase: phase_rx,
        };
        (session, handle)
    }

    pub fn set_capture_hook(&mut self, hook: Arc<dyn CaptureHook>) {
        self.capture_hook = Some(hook);
    }

    /// Run attempts until the session is shut down or fails unrecoverably.
    pub async fn run(mut self) -> Result<(), SessionError> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }
            match self.run_attempt().await? {
                Step::Restart => {
                    info!(target: "beacon::session", "attempt torn down, retrying");
                }
                _ => return Ok(()),
            }
        }
    }

    async fn run_attempt(&mut self) -> Result<Step, SessionError> {
        let (engine, mut media_events) = self.factory.create().await?;
        let (transport, mut transport_events) =
            SignalTransport::new(self.config.socket, self.config.frame.clone());
        let transport = Arc::new(transport);

        if let Err(err) = self.bring_up_transport(&transport).await {
            engine.close().await;
            transport.close();
            return Err(err);
        }

        let mut negotiator = Negotiator::new(
            self.config.role,
            engine.clone(),
            transport.clone(),
            self.config.max_resend_attempts,
        );
        let _ = self.phase.send(negotiator.phase());

        let step = self
            .drive(&mut negotiator, &mut transport_events, &mut media_events)
            .await;

        // Teardown order: stop reacting, close the signaling socket, close
        // the engine. Each piece is idempotent on its own.
        negotiator.close();
        transport.close();
        engine.close().await;
        let _ = self.phase.send(SessionPhase::Closed);
        debug!(target: "beacon::session", ?step, "attempt finished");
        Ok(step)
    }

    /// Offerers bind and wait; answerers dial, retrying on a fixed cadence
    /// in case the ticket is fresher than the host's socket.
    async fn bring_up_transport(
        &mut self,
        transport: &Arc<SignalTransport>,
    ) -> Result<(), SessionError> {
        match self.config.role {
            Role::Offerer => {
                let bound = transport.listen(&self.config.endpoint).await?;
                info!(target: "beacon::session", %bound, "awaiting peer");
                Ok(())
            }
            Role::Answerer => {
                let mut attempts = 0;
                loop {
                    match transport.connect(&self.config.endpoint).await {
                        Ok(()) => return Ok(()),
                        Err(err) => {
                            attempts += 1;
                            if attempts > self.config.max_resend_attempts {
                                warn!(target: "beacon::session", error = %err, "giving up on host");
                                return Err(SessionError::DialExhausted { attempts });
                            }
                            debug!(
                                target: "beacon::session",
                                error = %err,
                                attempts,
                                "dial failed, retrying"
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(self.config.resend_interval) => {}
                                _ = self.shutdown.changed() => {
                                    return Err(SessionError::DialExhausted { attempts });
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn drive(
        &mut self,
        negotiator: &mut Negotiator,
        transport_events: &mut mpsc::UnboundedReceiver<TransportEvent>,
        media_events: &mut MediaEvents,
    ) -> Step {
        let mut resend = tokio::time::interval(self.config.resend_interval);
        resend.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        resend.tick().await;

        let mut capture = self
            .config
            .capture_interval
            .map(tokio::time::interval);

        loop {
            let step = tokio::select! {
                _ = self.shutdown.changed() => Step::Shutdown,
                event = transport_events.recv() => match event {
                    Some(event) => negotiator.on_transport_event(event).await,
                    None => Step::Restart,
                },
                event = media_events.recv() => match event {
                    Some(event) => negotiator.on_media_event(event).await,
                    None => Step::Restart,
                },
                _ = resend.tick() => negotiator.on_resend_tick().await,
                _ = tick_opt(&mut capture) => {
                    if negotiator.phase() == SessionPhase::Connected {
                        if let Some(hook) = &self.capture_hook {
                            hook.capture().await;
                        }
                    }
                    Step::Continue
                }
            };
            let _ = self.phase.send(negotiator.phase());
            if step != Step::Continue {
                return step;
            }
        }
    }
}

/// Pending-forever when no capture interval is configured, so the branch
/// never wins the select.
async fn tick_opt(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::MockEngineFactory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(role: Role, endpoint: Endpoint, socket: SocketKind) -> SessionConfig {
        SessionConfig {
            role,
            endpoint,
            socket,
            frame: FrameConfig::default(),
            resend_interval: Duration::from_millis(50),
            max_resend_attempts: 5,
            capture_interval: None,
        }
    }

    #[tokio::test]
    async fn shutdown_closes_engine_and_ends_the_run() {
        let factory = Arc::new(MockEngineFactory::new("sdp"));
        let (session, handle) = Session::new(
            config(
                Role::Offerer,
                Endpoint::new("127.0.0.1", 0),
                SocketKind::Datagram,
            ),
            factory.clone(),
        );

        let run = tokio::spawn(session.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run did not stop")
            .expect("join")
            .expect("session error");

        let engines = factory.created();
        assert_eq!(engines.len(), 1);
        assert!(engines[0].is_closed());
    }

    #[tokio::test]
    async fn answerer_gives_up_when_nobody_listens() {
        let factory = Arc::new(MockEngineFactory::new("sdp"));
        let mut cfg = config(
            Role::Answerer,
            // Reserved port on loopback; nothing accepts here.
            Endpoint::new("127.0.0.1", 1),
            SocketKind::Stream,
        );
        cfg.resend_interval = Duration::from_millis(10);
        cfg.max_resend_attempts = 2;
        let (session, _handle) = Session::new(cfg, factory);

        let result = tokio::time::timeout(Duration::from_secs(5), session.run())
            .await
            .expect("run did not finish");
        match result {
            Err(SessionError::DialExhausted { attempts }) => assert_eq!(attempts, 3),
            other => panic!("expected dial exhaustion, got {other:?}"),
        }
    }

    struct CountingHook(AtomicUsize);

    #[async_trait]
    impl CaptureHook for CountingHook {
        async fn capture(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn capture_hook_stays_quiet_until_connected() {
        let factory = Arc::new(MockEngineFactory::new("sdp"));
        let mut cfg = config(
            Role::Offerer,
            Endpoint::new("127.0.0.1", 0),
            SocketKind::Datagram,
        );
        cfg.capture_interval = Some(Duration::from_millis(10));
        let (mut session, handle) = Session::new(cfg, factory);
        let hook = Arc::new(CountingHook(AtomicUsize::new(0)));
        session.set_capture_hook(hook.clone());

        let run = tokio::spawn(session.run());
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run did not stop")
            .expect("join")
            .expect("session error");

        // Never connected, so the hook never fired.
        assert_eq!(hook.0.load(Ordering::SeqCst), 0);
    }
}
