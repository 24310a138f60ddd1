//! Signaling transport: a framed, optionally compressed, connection-aware
//! message channel over either a reliable stream socket or an unreliable
//! datagram socket. One transport carries exactly one remote peer; it is a
//! 1:1 signaling channel, not a multiplexed server.
//!
//! All socket outcomes (peer attached, inbound payload, socket failure,
//! close) surface as [`TransportEvent`]s on a single receiver. Failures
//! inside the socket tasks never escape as panics.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub mod codec;
mod datagram;
mod stream;

pub use codec::{
    Candidate, CodecError, DecodeOutput, Decoder, Description, DescriptionKind, SignalMessage,
};
pub use datagram::SENTINEL;

/// A transport peer address as carried in the out-of-band rendezvous data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Resolve to a concrete socket address (first match wins).
    pub fn to_socket_addr(&self) -> Result<SocketAddr, TransportError> {
        (self.address.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|err| TransportError::Connect(err.to_string()))?
            .next()
            .ok_or_else(|| {
                TransportError::Connect(format!("{}:{} did not resolve", self.address, self.port))
            })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Underlying socket flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    Listener,
    Dialer,
}

/// On-the-wire shaping applied to every outbound payload. Both ends must
/// agree on compression; the delimiter only applies to stream sockets.
#[derive(Debug, Clone, Default)]
pub struct FrameConfig {
    pub delimiter: Option<String>,
    pub compression: bool,
}

#[derive(Debug)]
pub enum TransportEvent {
    Listening(SocketAddr),
    Connected(SocketAddr),
    Message(Bytes),
    Error(TransportError),
    Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("bind failed: {0}")]
    Bind(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport already connected")]
    AlreadyConnected,
    #[error("no peer attached")]
    NotConnected,
    #[error("send failed: {0}")]
    Send(String),
    #[error("socket error: {0}")]
    Socket(String),
    #[error("event channel closed")]
    ChannelClosed,
    #[error("transport closed")]
    Closed,
}

/// Connection state shared with the socket tasks.
pub(crate) struct Shared {
    events: mpsc::UnboundedSender<TransportEvent>,
    connected: AtomicBool,
    closed: AtomicBool,
    remote: Mutex<Option<SocketAddr>>,
    /// Writer handle for the stream backend, installed once a peer attaches.
    stream_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

impl Shared {
    fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            events,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            remote: Mutex::new(None),
            stream_tx: Mutex::new(None),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.lock().expect("remote lock")
    }

    /// Events are suppressed once the transport is closed; `Closed` itself
    /// goes through [`Shared::close_once`].
    pub(crate) fn emit(&self, event: TransportEvent) {
        if self.is_closed() {
            return;
        }
        let _ = self.events.send(event);
    }

    pub(crate) fn emit_listening(&self, local: SocketAddr) {
        self.emit(TransportEvent::Listening(local));
    }

    /// Record `addr` as *the* peer and announce it. Only the first peer per
    /// connection wins.
    pub(crate) fn peer_attached(&self, addr: SocketAddr) {
        {
            let mut remote = self.remote.lock().expect("remote lock");
            if remote.is_some() {
                return;
            }
            *remote = Some(addr);
        }
        self.connected.store(true, Ordering::SeqCst);
        self.emit(TransportEvent::Connected(addr));
    }

    pub(crate) fn install_stream_writer(&self, tx: mpsc::UnboundedSender<Bytes>) {
        *self.stream_tx.lock().expect("stream_tx lock") = Some(tx);
    }

    /// A socket-level failure: drop `connected`, report exactly one error
    /// event. The owning task exits right after calling this.
    pub(crate) fn socket_error(&self, err: TransportError) {
        self.connected.store(false, Ordering::SeqCst);
        debug!(target: "signal_transport", error = %err, "socket error");
        self.emit(TransportEvent::Error(err));
    }

    /// Transition to closed; returns true the first time only.
    pub(crate) fn close_once(&self) -> bool {
        self.connected.store(false, Ordering::SeqCst);
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.events.send(TransportEvent::Closed);
        true
    }
}

#[derive(Default)]
struct Backend {
    role: Option<TransportRole>,
    udp: Option<Arc<UdpSocket>>,
    tasks: Vec<JoinHandle<()>>,
}

/// One signaling channel to at most one remote peer.
///
/// Lifecycle: `unbound -> bound/listening -> connected -> closed`; closed is
/// terminal and the object is discarded. A retry always builds a fresh
/// transport.
pub struct SignalTransport {
    kind: SocketKind,
    frame: FrameConfig,
    shared: Arc<Shared>,
    backend: Mutex<Backend>,
}

impl SignalTransport {
    /// Build an unbound transport plus its event receiver. The role is fixed
    /// by whichever of [`listen`](Self::listen) or [`connect`](Self::connect)
    /// is called first.
    pub fn new(
        kind: SocketKind,
        frame: FrameConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            kind,
            frame,
            shared: Arc::new(Shared::new(tx)),
            backend: Mutex::new(Backend::default()),
        };
        (transport, rx)
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn role(&self) -> Option<TransportRole> {
        self.backend.lock().expect("backend lock").role
    }

    pub fn frame_config(&self) -> &FrameConfig {
        &self.frame
    }

    pub fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote_addr()
    }

    /// Bind a local endpoint and wait for exactly one remote peer. Emits
    /// `Listening` once bound and `Connected(addr)` when a peer attaches
    /// (for datagram sockets, when the connect sentinel arrives).
    pub async fn listen(&self, local: &Endpoint) -> Result<SocketAddr, TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed);
        }
        {
            let backend = self.backend.lock().expect("backend lock");
            if backend.role.is_some() {
                return Err(TransportError::Bind("transport already bound".into()));
            }
        }
        let addr = local
            .to_socket_addr()
            .map_err(|err| TransportError::Bind(err.to_string()))?;
        match self.kind {
            SocketKind::Stream => {
                let (bound, task) = stream::listen(self.shared.clone(), addr).await?;
                let mut backend = self.backend.lock().expect("backend lock");
                backend.role = Some(TransportRole::Listener);
                backend.tasks.push(task);
                Ok(bound)
            }
            SocketKind::Datagram => {
                let (bound, socket, task) = datagram::listen(self.shared.clone(), addr).await?;
                let mut backend = self.backend.lock().expect("backend lock");
                backend.role = Some(TransportRole::Listener);
                backend.udp = Some(socket);
                backend.tasks.push(task);
                Ok(bound)
            }
        }
    }

    /// Dial a remote endpoint. For datagram sockets this binds an ephemeral
    /// port and sends the reserved connect sentinel so the listener can
    /// attribute us; loss of the sentinel is not retried here.
    pub async fn connect(&self, remote: &Endpoint) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.connected() {
            return Err(TransportError::AlreadyConnected);
        }
        let addr = remote.to_socket_addr()?;
        match self.kind {
            SocketKind::Stream => {
                let task = stream::dial(self.shared.clone(), addr).await?;
                let mut backend = self.backend.lock().expect("backend lock");
                backend.role = Some(TransportRole::Dialer);
                backend.tasks.push(task);
            }
            SocketKind::Datagram => {
                let (socket, task) = datagram::dial(self.shared.clone(), addr).await?;
                let mut backend = self.backend.lock().expect("backend lock");
                backend.role = Some(TransportRole::Dialer);
                backend.udp = Some(socket);
                backend.tasks.push(task);
            }
        }
        Ok(())
    }

    /// Frame (compress, delimit) and write `payload` to the attached peer.
    pub async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed);
        }
        if !self.connected() {
            return Err(TransportError::NotConnected);
        }
        let framed = codec::frame_payload(payload, &self.frame)
            .map_err(|err| TransportError::Send(err.to_string()))?;
        match self.kind {
            SocketKind::Stream => {
                let tx = self
                    .shared
                    .stream_tx
                    .lock()
                    .expect("stream_tx lock")
                    .clone()
                    .ok_or(TransportError::NotConnected)?;
                tx.send(framed).map_err(|_| TransportError::ChannelClosed)
            }
            SocketKind::Datagram => {
                let socket = self
                    .backend
                    .lock()
                    .expect("backend lock")
                    .udp
                    .clone()
                    .ok_or(TransportError::NotConnected)?;
                let peer = self.remote_addr().ok_or(TransportError::NotConnected)?;
                socket
                    .send_to(&framed, peer)
                    .await
                    .map_err(|err| TransportError::Send(err.to_string()))?;
                Ok(())
            }
        }
    }

    /// Idempotent close: stops the socket tasks, releases the socket, and
    /// emits `Closed` exactly once. Closing an already-closed transport is a
    /// no-op.
    pub fn close(&self) {
        if !self.shared.close_once() {
            return;
        }
        let mut backend = self.backend.lock().expect("backend lock");
        for task in backend.tasks.drain(..) {
            task.abort();
        }
        backend.udp = None;
        *self.shared.stream_tx.lock().expect("stream_tx lock") = None;
        debug!(target: "signal_transport", "transport closed");
    }
}

impl Drop for SignalTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_resolves_loopback() {
        let endpoint = Endpoint::new("127.0.0.1", 4242);
        let addr = endpoint.to_socket_addr().expect("resolve");
        assert_eq!(addr.port(), 4242);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn endpoint_display_includes_port() {
        assert_eq!(Endpoint::new("10.0.0.7", 50000).to_string(), "10.0.0.7:50000");
    }

    #[tokio::test]
    async fn send_without_peer_is_rejected() {
        let (transport, _events) = SignalTransport::new(SocketKind::Datagram, FrameConfig::default());
        let err = transport.send(b"{}").await.expect_err("must fail");
        assert_eq!(err, TransportError::NotConnected);
    }

    #[tokio::test]
    async fn double_close_is_a_no_op() {
        let (transport, mut events) =
            SignalTransport::new(SocketKind::Datagram, FrameConfig::default());
        transport
            .listen(&Endpoint::new("127.0.0.1", 0))
            .await
            .expect("bind");
        transport.close();
        transport.close();

        let mut closed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TransportEvent::Closed) {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
        assert!(transport.is_closed());
        assert!(!transport.connected());
    }

    #[tokio::test]
    async fn listen_twice_is_rejected() {
        let (transport, _events) =
            SignalTransport::new(SocketKind::Datagram, FrameConfig::default());
        transport
            .listen(&Endpoint::new("127.0.0.1", 0))
            .await
            .expect("bind");
        let err = transport
            .listen(&Endpoint::new("127.0.0.1", 0))
            .await
            .expect_err("second bind must fail");
        assert!(matches!(err, TransportError::Bind(_)));
    }
}
