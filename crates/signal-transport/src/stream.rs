//! Reliable stream backend (TCP). The listener accepts exactly one peer and
//! then stops accepting; the dialer connects to a known remote. Either way a
//! reader task turns socket data into `Message` events and a writer task
//! drains the outbound queue.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::{Shared, TransportError, TransportEvent};

const READ_BUF_BYTES: usize = 64 * 1024;

pub(crate) async fn listen(
    shared: Arc<Shared>,
    addr: SocketAddr,
) -> Result<(SocketAddr, JoinHandle<()>), TransportError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| TransportError::Bind(err.to_string()))?;
    let bound = listener
        .local_addr()
        .map_err(|err| TransportError::Bind(err.to_string()))?;
    shared.emit_listening(bound);
    debug!(target: "signal_transport::stream", %bound, "listening");

    let task = tokio::spawn(async move {
        match listener.accept().await {
            Ok((socket, peer)) => {
                // Single-peer policy: the listener is dropped here, so any
                // later connection attempt is refused by the OS.
                drop(listener);
                run_connection(shared, socket, peer).await;
            }
            Err(err) => shared.socket_error(TransportError::Socket(err.to_string())),
        }
    });
    Ok((bound, task))
}

pub(crate) async fn dial(
    shared: Arc<Shared>,
    addr: SocketAddr,
) -> Result<JoinHandle<()>, TransportError> {
    let socket = TcpStream::connect(addr)
        .await
        .map_err(|err| TransportError::Connect(err.to_string()))?;
    let peer = socket
        .peer_addr()
        .map_err(|err| TransportError::Connect(err.to_string()))?;
    debug!(target: "signal_transport::stream", %peer, "dialed");
    Ok(tokio::spawn(run_connection(shared, socket, peer)))
}

async fn run_connection(shared: Arc<Shared>, socket: TcpStream, peer: SocketAddr) {
    let (mut reader, mut writer) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    shared.install_stream_writer(tx);
    shared.peer_attached(peer);

    let writer_shared = shared.clone();
    let write_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(err) = writer.write_all(&bytes).await {
                writer_shared.socket_error(TransportError::Send(err.to_string()));
                break;
            }
            if let Err(err) = writer.flush().await {
                writer_shared.socket_error(TransportError::Send(err.to_string()));
                break;
            }
        }
    });

    let mut buf = vec![0u8; READ_BUF_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                trace!(target: "signal_transport::stream", %peer, "peer closed");
                shared.close_once();
                break;
            }
            Ok(len) => shared.emit(TransportEvent::Message(Bytes::copy_from_slice(&buf[..len]))),
            Err(err) => {
                shared.socket_error(TransportError::Socket(err.to_string()));
                break;
            }
        }
    }
    write_task.abort();
}
