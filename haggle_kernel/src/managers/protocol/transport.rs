// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The socket-like contract protocols run over.
//!
//! Anything that is an async byte stream qualifies as a transport; TCP is
//! the stock implementation, and an in-memory duplex pair serves tests and
//! loopback contacts. Connecting to a peer goes through a
//! [`TransportConnector`] so link-specific dialing stays outside the engine.

use async_trait::async_trait;
use haggle_protocol::Interface;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Buffer size for streaming data objects in either direction.
pub(crate) const TRANSPORT_CHUNK_SIZE: usize = 8192;

/// A connected byte stream a protocol drives.
#[async_trait]
pub trait ProtocolTransport: Send + Unpin {
    /// Reads the next chunk; 0 means the peer closed the stream.
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    async fn send_all(&mut self, buf: &[u8]) -> io::Result<()>;

    async fn close(&mut self) -> io::Result<()>;
}

#[async_trait]
impl<T> ProtocolTransport for T
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf).await
    }

    async fn send_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write_all(buf).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

/// Opens transports toward remote interfaces.
#[async_trait]
pub trait TransportConnector: Send + Sync + 'static {
    async fn connect(&self, remote: &Interface) -> io::Result<Box<dyn ProtocolTransport>>;
}

/// Dials the remote interface's socket address over TCP.
#[derive(Default)]
pub struct TcpConnector;

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn connect(&self, remote: &Interface) -> io::Result<Box<dyn ProtocolTransport>> {
        let addr = remote.socket_address().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("interface {remote} has no socket address"),
            )
        })?;
        let stream = TcpStream::connect(addr).await?;
        Ok(Box::new(stream))
    }
}

/// In-memory connector: endpoints are registered ahead of time per remote
/// interface and handed out on connect. The other half of each pair is the
/// caller's to read from.
#[derive(Default)]
pub struct MemoryConnector {
    endpoints: Mutex<HashMap<(haggle_protocol::InterfaceType, Vec<u8>), VecDeque<tokio::io::DuplexStream>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one connectable endpoint for the remote interface and
    /// returns the peer half of the pipe.
    pub fn add_endpoint(&self, remote: &Interface) -> tokio::io::DuplexStream {
        let (ours, theirs) = tokio::io::duplex(TRANSPORT_CHUNK_SIZE * 4);
        self.endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(remote.key())
            .or_default()
            .push_back(ours);
        theirs
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(&self, remote: &Interface) -> io::Result<Box<dyn ProtocolTransport>> {
        let stream = self
            .endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&remote.key())
            .and_then(|q| q.pop_front());
        match stream {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no registered endpoint for {remote}"),
            )),
        }
    }
}
