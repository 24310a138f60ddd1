//! Unreliable datagram backend (UDP). Raw datagrams have no connection
//! concept, so the dialer announces itself with a reserved sentinel payload;
//! the listener records the sentinel's source address as *the* peer and
//! ignores datagrams from anyone else afterwards.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::{Shared, TransportError, TransportEvent};

/// Pseudo-connection handshake payload. Distinct from any valid signaling
/// message: those are always JSON objects (or base64 text that both ends
/// only inflate after this check).
pub const SENTINEL: &[u8] = b"CONNECTED";

const RECV_BUF_BYTES: usize = 64 * 1024;

pub(crate) async fn listen(
    shared: Arc<Shared>,
    addr: SocketAddr,
) -> Result<(SocketAddr, Arc<UdpSocket>, JoinHandle<()>), TransportError> {
    let socket = Arc::new(
        UdpSocket::bind(addr)
            .await
            .map_err(|err| TransportError::Bind(err.to_string()))?,
    );
    let bound = socket
        .local_addr()
        .map_err(|err| TransportError::Bind(err.to_string()))?;
    shared.emit_listening(bound);
    debug!(target: "signal_transport::datagram", %bound, "listening");

    let task = tokio::spawn(recv_loop(shared, socket.clone(), true));
    Ok((bound, socket, task))
}

pub(crate) async fn dial(
    shared: Arc<Shared>,
    remote: SocketAddr,
) -> Result<(Arc<UdpSocket>, JoinHandle<()>), TransportError> {
    let socket = Arc::new(
        UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?,
    );
    socket
        .send_to(SENTINEL, remote)
        .await
        .map_err(|err| TransportError::Connect(err.to_string()))?;
    debug!(target: "signal_transport::datagram", %remote, "sentinel sent");
    shared.peer_attached(remote);

    let task = tokio::spawn(recv_loop(shared, socket.clone(), false));
    Ok((socket, task))
}

async fn recv_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>, accept_sentinel: bool) {
    let mut buf = vec![0u8; RECV_BUF_BYTES];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let payload = &buf[..len];
                match shared.remote_addr() {
                    None if accept_sentinel && payload == SENTINEL => {
                        shared.peer_attached(from);
                    }
                    None => {
                        trace!(target: "signal_transport::datagram", %from, "datagram before handshake dropped");
                    }
                    Some(peer) if peer == from => {
                        if payload == SENTINEL {
                            // Duplicate handshake from the bound peer.
                            continue;
                        }
                        shared.emit(TransportEvent::Message(Bytes::copy_from_slice(payload)));
                    }
                    Some(_) => {
                        trace!(target: "signal_transport::datagram", %from, "datagram from unbound peer ignored");
                    }
                }
            }
            Err(err) => {
                shared.socket_error(TransportError::Socket(err.to_string()));
                break;
            }
        }
    }
}
