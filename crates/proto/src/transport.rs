// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Transport abstraction and framing.
//!
//! `FramedIo` is the single contract both framings satisfy: "deliver whole
//! DNS messages, accept whole DNS messages". `TcpConn` implements RFC 1035
//! §4.2.2's 2-byte length prefix; `UdpConn` is one-datagram-per-message
//! passthrough. Both serialize concurrent readers behind a read lock and
//! concurrent writers behind a write lock, in the same spirit as
//! `hickory-proto`'s split of a duplex stream into independently-lockable
//! read/write halves (see `iocompat::AsyncIoTokioAsStd` in
//! `hickory-proto`'s `lib.rs` for the analogous tokio/futures-io bridging).

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;

use crate::error::Error;

/// A single DNS message must fit in one UDP datagram.
pub const MAX_UDP_MESSAGE_SIZE: usize = 65_527;

/// Delivers and accepts whole DNS messages over an established connection.
#[async_trait]
pub trait FramedIo: Send + Sync + 'static {
    /// Reads the next whole message. A short read or a clean EOF are both
    /// surfaced as `Error::Framing`; either way this is terminal for the
    /// connection.
    async fn read_frame(&self) -> Result<Vec<u8>, Error>;

    /// Writes a whole message; header (if any), payload, and flush appear
    /// atomically on the wire relative to concurrent writers.
    async fn write_frame(&self, buf: &[u8]) -> Result<(), Error>;

    /// Tears down the underlying transport (spec §2's transport abstraction
    /// lists connect/bind/listen/read/write/close; spec §4.4.4's disconnect
    /// algorithm calls for "close the framed transport" as one of its
    /// atomic steps). Best-effort: a failure here doesn't change the fact
    /// that the caller is done with this connection, it's just logged.
    async fn close(&self) -> Result<(), Error>;
}

/// Constructs an outbound connection to `addr`.
#[async_trait]
pub trait Connector: Clone + Send + Sync + 'static {
    type Conn: FramedIo;

    async fn connect(&self, addr: SocketAddr) -> Result<Self::Conn, Error>;
}

// ---------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------

/// A TCP-framed connection: 2-byte big-endian length prefix around each
/// message (RFC 1035 §4.2.2).
pub struct TcpConn {
    read: Mutex<OwnedReadHalf>,
    write: Mutex<OwnedWriteHalf>,
}

impl TcpConn {
    pub fn new(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
        }
    }
}

#[async_trait]
impl FramedIo for TcpConn {
    async fn read_frame(&self) -> Result<Vec<u8>, Error> {
        let mut guard = self.read.lock().await;

        let mut len_buf = [0u8; 2];
        read_exact_or_eof(&mut *guard, &mut len_buf).await?;
        let len = u16::from_be_bytes(len_buf) as usize;

        let mut payload = vec![0u8; len];
        guard
            .read_exact(&mut payload)
            .await
            .map_err(|_| Error::framing("short read"))?;

        Ok(payload)
    }

    async fn write_frame(&self, buf: &[u8]) -> Result<(), Error> {
        if buf.len() > u16::MAX as usize {
            return Err(Error::framing("message too large for a 2-byte length prefix"));
        }

        let mut guard = self.write.lock().await;
        guard.write_all(&(buf.len() as u16).to_be_bytes()).await?;
        guard.write_all(buf).await?;
        guard.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        let mut guard = self.write.lock().await;
        guard.shutdown().await?;
        Ok(())
    }
}

/// Reads until `buf` is full. A clean EOF (zero bytes read before any byte
/// of this frame arrived) and a short read mid-frame both surface as the
/// same framing error; the caller doesn't need to tell them apart.
async fn read_exact_or_eof<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), Error> {
    reader
        .read_exact(buf)
        .await
        .map_err(|_| Error::framing("short read"))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Conn = TcpConn;

    async fn connect(&self, addr: SocketAddr) -> Result<Self::Conn, Error> {
        let stream = TcpStream::connect(addr).await?;
        Ok(TcpConn::new(stream))
    }
}

/// Binds a TCP listener and hands out `TcpConn`s for accepted connections,
/// reused for both the downstream listener and test harnesses.
pub struct TokioTcpAcceptor(TcpListener);

impl TokioTcpAcceptor {
    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        Ok(Self(TcpListener::bind(addr).await?))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.0.local_addr()?)
    }

    pub async fn accept(&self) -> Result<(TcpConn, SocketAddr), Error> {
        let (stream, peer) = self.0.accept().await?;
        Ok((TcpConn::new(stream), peer))
    }
}

// ---------------------------------------------------------------------
// UDP
// ---------------------------------------------------------------------

/// A UDP "connection": a socket that has been `connect()`-ed to a single
/// peer, so `read_frame`/`write_frame` behave like a stream of whole
/// datagrams to and from that one peer.
pub struct UdpConn {
    socket: UdpSocket,
    // Locks exist purely to satisfy the same read/write serialization
    // contract TcpConn has; a single UdpSocket is already safe to use from
    // multiple tasks concurrently, but interleaving two logical writers'
    // datagrams would still violate the "whole message" contract if either
    // write ever needed more than one syscall.
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
}

impl UdpConn {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl FramedIo for UdpConn {
    async fn read_frame(&self) -> Result<Vec<u8>, Error> {
        let _guard = self.read_lock.lock().await;
        let mut buf = bytes::BytesMut::zeroed(MAX_UDP_MESSAGE_SIZE);
        let len = self.socket.recv(&mut buf).await?;
        buf.truncate(len);
        Ok(buf.to_vec())
    }

    async fn write_frame(&self, buf: &[u8]) -> Result<(), Error> {
        if buf.len() > MAX_UDP_MESSAGE_SIZE {
            return Err(Error::framing("datagram exceeds maximum DNS message size"));
        }
        let _guard = self.write_lock.lock().await;
        self.socket.send(buf).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        // No remote session exists to tear down; the local fd is released
        // when the `UdpConn` is dropped.
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UdpConnector;

#[async_trait]
impl Connector for UdpConnector {
    type Conn = UdpConn;

    async fn connect(&self, addr: SocketAddr) -> Result<Self::Conn, Error> {
        let local = match addr {
            SocketAddr::V4(_) => "0.0.0.0:0",
            SocketAddr::V6(_) => "[::]:0",
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        Ok(UdpConn::new(socket))
    }
}

/// A bound, unconnected UDP socket used by the downstream listener, which
/// serves every peer from one socket rather than per-peer connections.
pub struct TokioUdpSocket(UdpSocket);

impl TokioUdpSocket {
    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        Ok(Self(UdpSocket::bind(addr).await?))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.0.local_addr()?)
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        Ok(self.0.recv_from(buf).await?)
    }

    pub async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, Error> {
        if buf.len() > MAX_UDP_MESSAGE_SIZE {
            return Err(Error::framing("datagram exceeds maximum DNS message size"));
        }
        Ok(self.0.send_to(buf, addr).await?)
    }
}

/// An in-memory stand-in for both UDP and TCP transports, used by this
/// crate's own tests and by `dnsfwd-server`'s so tests can inject a
/// deterministic transport instead of real sockets. Framing is a no-op here
/// since messages already travel as whole buffers over an mpsc channel;
/// there is no byte stream to cut into frames.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex as StdMutex};

    use tokio::sync::{mpsc, Mutex as AsyncMutex};

    use super::*;

    pub struct InMemoryConn {
        tx: AsyncMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
        rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    }

    impl InMemoryConn {
        fn pair() -> (Self, Self) {
            let (tx_a, rx_b) = mpsc::unbounded_channel();
            let (tx_b, rx_a) = mpsc::unbounded_channel();
            (
                Self {
                    tx: AsyncMutex::new(Some(tx_a)),
                    rx: AsyncMutex::new(rx_a),
                },
                Self {
                    tx: AsyncMutex::new(Some(tx_b)),
                    rx: AsyncMutex::new(rx_b),
                },
            )
        }
    }

    #[async_trait]
    impl FramedIo for InMemoryConn {
        async fn read_frame(&self) -> Result<Vec<u8>, Error> {
            let mut rx = self.rx.lock().await;
            rx.recv().await.ok_or_else(|| Error::framing("peer closed"))
        }

        async fn write_frame(&self, buf: &[u8]) -> Result<(), Error> {
            let tx = self.tx.lock().await;
            match tx.as_ref() {
                Some(tx) => tx
                    .send(buf.to_vec())
                    .map_err(|_| Error::framing("peer closed")),
                None => Err(Error::framing("connection closed locally")),
            }
        }

        async fn close(&self) -> Result<(), Error> {
            self.tx.lock().await.take();
            Ok(())
        }
    }

    fn connection_refused() -> Error {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "no listener at address",
        ))
    }

    /// A registry of bound addresses, each backed by a channel of inbound
    /// connections, standing in for `TcpListener::bind`/`accept` and
    /// `UdpSocket::bind`/`recv_from`.
    #[derive(Clone, Default)]
    pub struct InMemoryNetwork {
        listeners:
            Arc<StdMutex<HashMap<SocketAddr, mpsc::UnboundedSender<(InMemoryConn, SocketAddr)>>>>,
    }

    impl InMemoryNetwork {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn listen(&self, addr: SocketAddr) -> InMemoryListener {
            let (tx, rx) = mpsc::unbounded_channel();
            self.listeners
                .lock()
                .expect("in-memory network mutex poisoned")
                .insert(addr, tx);
            InMemoryListener {
                rx: AsyncMutex::new(rx),
            }
        }

        fn connect(&self, addr: SocketAddr) -> Result<InMemoryConn, Error> {
            let tx = self
                .listeners
                .lock()
                .expect("in-memory network mutex poisoned")
                .get(&addr)
                .cloned()
                .ok_or_else(connection_refused)?;
            let (client, server) = InMemoryConn::pair();
            let peer: SocketAddr = "127.0.0.1:0".parse().expect("valid address literal");
            tx.send((server, peer)).map_err(|_| connection_refused())?;
            Ok(client)
        }
    }

    pub struct InMemoryListener {
        rx: AsyncMutex<mpsc::UnboundedReceiver<(InMemoryConn, SocketAddr)>>,
    }

    impl InMemoryListener {
        pub async fn accept(&self) -> Result<(InMemoryConn, SocketAddr), Error> {
            self.rx
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| Error::framing("network closed"))
        }
    }

    #[derive(Clone)]
    pub struct InMemoryConnector {
        network: InMemoryNetwork,
    }

    impl InMemoryConnector {
        pub fn new(network: InMemoryNetwork) -> Self {
            Self { network }
        }
    }

    #[async_trait]
    impl Connector for InMemoryConnector {
        type Conn = InMemoryConn;

        async fn connect(&self, addr: SocketAddr) -> Result<Self::Conn, Error> {
            self.network.connect(addr)
        }
    }
}
