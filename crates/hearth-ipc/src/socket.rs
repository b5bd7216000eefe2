//! Socket transport
//!
//! One TCP connection per add-on process. An `IpcSocket` is used for exactly
//! one role: it either binds a listener (hub side) or connects to one (add-on
//! side). Doing both, or doing either twice, is reported as an error instead
//! of silently opening a second endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::{FrameReader, FrameWriter};
use crate::error::{IpcError, IpcResult};
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketState {
    Idle,
    Bound(SocketAddr),
    Connected(SocketAddr),
}

/// Transport endpoint with exclusive bind/connect semantics
#[derive(Debug)]
pub struct IpcSocket {
    state: SocketState,
}

impl Default for IpcSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl IpcSocket {
    pub fn new() -> Self {
        Self {
            state: SocketState::Idle,
        }
    }

    fn ensure_idle(&self) -> IpcResult<()> {
        match self.state {
            SocketState::Idle => Ok(()),
            SocketState::Bound(addr) => Err(IpcError::AlreadyBound(addr)),
            SocketState::Connected(addr) => Err(IpcError::AlreadyConnected(addr)),
        }
    }

    /// Bind a listener on `addr`
    pub async fn bind(&mut self, addr: SocketAddr) -> IpcResult<IpcListener> {
        self.ensure_idle()?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                IpcError::AddrInUse(addr)
            } else {
                IpcError::Io(e)
            }
        })?;
        let local = listener.local_addr()?;
        self.state = SocketState::Bound(local);
        debug!("IPC socket bound to {}", local);
        Ok(IpcListener { listener })
    }

    /// Connect to a listener at `addr`
    pub async fn connect(&mut self, addr: SocketAddr) -> IpcResult<IpcConnection> {
        self.ensure_idle()?;
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        self.state = SocketState::Connected(addr);
        Ok(IpcConnection { stream, peer: addr })
    }
}

/// Listening side of the transport
#[derive(Debug)]
pub struct IpcListener {
    listener: TcpListener,
}

impl IpcListener {
    pub fn local_addr(&self) -> IpcResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the next add-on connection
    pub async fn accept(&self) -> IpcResult<IpcConnection> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(IpcConnection { stream, peer })
    }
}

/// An established duplex channel
#[derive(Debug)]
pub struct IpcConnection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl IpcConnection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Split into a cloneable sender and a receiver.
    ///
    /// Outbound messages go through a writer task, so `send` never blocks and
    /// frames leave in the order they were queued.
    pub fn split(self) -> (IpcSender, IpcReceiver) {
        let (read_half, write_half) = self.stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(write_loop(
            FrameWriter::new(write_half),
            rx,
            closed.clone(),
            self.peer,
        ));

        (
            IpcSender { tx, closed },
            IpcReceiver {
                reader: FrameReader::new(read_half),
                peer: self.peer,
            },
        )
    }
}

enum Outbound {
    Frame(Message),
    Close,
}

async fn write_loop(
    mut writer: FrameWriter<OwnedWriteHalf>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    closed: Arc<AtomicBool>,
    peer: SocketAddr,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame(msg) => {
                if let Err(e) = writer.write(&msg).await {
                    warn!("IPC write to {} failed: {}", peer, e);
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    closed.store(true, Ordering::SeqCst);
    let _ = writer.shutdown().await;
}

/// Sending half of a connection
#[derive(Debug, Clone)]
pub struct IpcSender {
    tx: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outbound::Frame(msg) => f.debug_tuple("Frame").field(&msg.msg_type).finish(),
            Outbound::Close => f.write_str("Close"),
        }
    }
}

impl IpcSender {
    /// Queue a message. Fails once the channel is closed or the peer is gone.
    pub fn send(&self, msg: Message) -> IpcResult<()> {
        if self.is_closed() {
            return Err(IpcError::Disconnected);
        }
        self.tx
            .send(Outbound::Frame(msg))
            .map_err(|_| IpcError::Disconnected)
    }

    /// Flush queued frames and shut the write side down
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Outbound::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.is_closed()
    }

    /// Whether both senders feed the same connection
    pub fn same_channel(&self, other: &IpcSender) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Receiving half of a connection
#[derive(Debug)]
pub struct IpcReceiver {
    reader: FrameReader<OwnedReadHalf>,
    peer: SocketAddr,
}

impl IpcReceiver {
    /// Receive the next message, or `None` once the peer disconnected.
    ///
    /// Frames that fail to decode are logged and skipped; the channel stays
    /// open.
    pub async fn recv(&mut self) -> IpcResult<Option<Message>> {
        loop {
            match self.reader.read().await {
                Err(e) if e.is_frame_local() => {
                    warn!("Dropping undecodable frame from {}: {}", self.peer, e);
                }
                other => return other,
            }
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use serde_json::json;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_second_bind_is_an_error() {
        let mut socket = IpcSocket::new();
        let listener = socket.bind(loopback()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        assert!(matches!(
            socket.bind(loopback()).await,
            Err(IpcError::AlreadyBound(a)) if a == addr
        ));
        assert!(matches!(
            socket.connect(addr).await,
            Err(IpcError::AlreadyBound(_))
        ));
    }

    #[tokio::test]
    async fn test_address_in_use_is_surfaced() {
        let mut first = IpcSocket::new();
        let listener = first.bind(loopback()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut second = IpcSocket::new();
        assert!(matches!(
            second.bind(addr).await,
            Err(IpcError::AddrInUse(a)) if a == addr
        ));
    }

    #[tokio::test]
    async fn test_second_connect_is_an_error() {
        let mut server = IpcSocket::new();
        let listener = server.bind(loopback()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = IpcSocket::new();
        let _conn = client.connect(addr).await.unwrap();
        assert!(matches!(
            client.connect(addr).await,
            Err(IpcError::AlreadyConnected(a)) if a == addr
        ));
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order_and_disconnect_is_reported() {
        let mut server = IpcSocket::new();
        let listener = server.bind(loopback()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut socket = IpcSocket::new();
            let (tx, _rx) = socket.connect(addr).await.unwrap().split();
            for i in 0..20u64 {
                tx.send(
                    Message::new(MessageType::DeviceEventNotification, "seq", json!({"n": i}))
                        .with_message_id(i),
                )
                .unwrap();
            }
            tx.close();
            assert!(matches!(
                tx.send(Message::new(MessageType::PluginUnloadRequest, "seq", json!({}))),
                Err(IpcError::Disconnected)
            ));
        });

        let (_tx, mut rx) = listener.accept().await.unwrap().split();
        for i in 0..20u64 {
            let msg = rx.recv().await.unwrap().unwrap();
            assert_eq!(msg.message_id, Some(i));
            assert_eq!(msg.data["n"], i);
        }
        assert!(rx.recv().await.unwrap().is_none());
        client.await.unwrap();
    }
}
