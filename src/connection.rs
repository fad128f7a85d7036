//! Connection identity, state machine and transport capability.
//!
//! Each accepted connection gets a [`ConnectionId`] and is wrapped in a
//! [`Connection`], which is owned by exactly one handler and released through
//! a [`ResourceGuard`](crate::guard::ResourceGuard).

use crate::error::ReleaseError;
use crate::guard::Release;
use socket2::SockRef;
use std::fmt;
use std::io;
use std::net::Shutdown;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection, for logs and outcome reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Accepted,
    /// Reading request bytes until the frame is complete.
    Reading,
    Transforming,
    /// Writing and flushing the response.
    Writing,
    Closed,
    Error,
}

impl ConnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnState::Closed | ConnState::Error)
    }
}

/// The byte-stream capability the handler needs from a transport.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {
    /// Synchronously tear the transport down.
    fn close(&mut self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        match SockRef::from(&*self).shutdown(Shutdown::Both) {
            // Peer already went away.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl Transport for DuplexStream {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A live connection owned by a single handler.
pub struct Connection<T: Transport> {
    id: ConnectionId,
    peer: String,
    state: ConnState,
    transport: T,
}

impl<T: Transport> Connection<T> {
    pub fn new(id: ConnectionId, peer: impl Into<String>, transport: T) -> Self {
        Self {
            id,
            peer: peer.into(),
            state: ConnState::Accepted,
            transport,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Move to `next`. Terminal states are sticky.
    pub fn transition(&mut self, next: ConnState) {
        if self.state.is_terminal() {
            return;
        }
        tracing::trace!(conn = %self.id, from = ?self.state, to = ?next, "State transition");
        self.state = next;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

impl<T: Transport> Release for Connection<T> {
    fn label(&self) -> String {
        self.id.to_string()
    }

    fn release(&mut self) -> Result<(), ReleaseError> {
        if !self.state.is_terminal() {
            self.state = ConnState::Error;
        }
        self.transport
            .close()
            .map_err(|e| ReleaseError::new(self.label(), e))
    }
}
