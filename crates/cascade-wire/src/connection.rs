//! The physical connection to the first mix.
//!
//! The engine only needs a blocking, reliable, ordered byte stream that can be
//! split into a read half (owned by the receive loop) and a write half (owned
//! by the send path), given a timeout during login, and closed from any
//! thread to unblock pending reads.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use tracing::debug;

use crate::Result;

/// Boxed read half of a connection.
pub type ReadHalf = Box<dyn Read + Send>;

/// Boxed write half of a connection.
pub type WriteHalf = Box<dyn Write + Send>;

/// A blocking byte-stream connection to a cascade.
pub trait StreamConnection: Send + Sync {
    /// Independent read and write handles onto the same stream.
    fn split(&self) -> Result<(ReadHalf, WriteHalf)>;

    /// Read/write timeout, `None` for blocking forever.
    fn set_timeout(&self, timeout: Option<Duration>) -> Result<()>;

    /// Shut the stream down; blocked readers return an error or EOF.
    fn close(&self) -> Result<()>;

    /// Human-readable peer description for logs.
    fn peer(&self) -> String;
}

/// [`StreamConnection`] over a TCP socket.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
}

impl TcpConnection {
    /// Connect to `addr`, failing after `timeout`.
    pub fn connect(addr: &SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect_timeout(addr, timeout)?;
        stream.set_nodelay(true)?;
        debug!(%addr, "TCP connection established");
        Ok(Self { stream })
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl StreamConnection for TcpConnection {
    fn split(&self) -> Result<(ReadHalf, WriteHalf)> {
        let reader = self.stream.try_clone()?;
        let writer = self.stream.try_clone()?;
        Ok((Box::new(reader), Box::new(writer)))
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn peer(&self) -> String {
        self.stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<disconnected>".to_string())
    }
}

/// A connected pair of loopback TCP connections (client side, remote side).
///
/// Used by test cascades and local tooling.
pub fn loopback_pair() -> Result<(TcpConnection, TcpConnection)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let client = TcpStream::connect(addr)?;
    let (remote, _) = listener.accept()?;
    client.set_nodelay(true)?;
    remote.set_nodelay(true)?;
    Ok((TcpConnection::from_stream(client), TcpConnection::from_stream(remote)))
}
