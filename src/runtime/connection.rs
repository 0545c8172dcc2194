//! Connection state for accepted TCP clients.
//!
//! Each connection owns its stream and its echo buffer, and remembers the
//! interest set it is currently registered with so the event loop only
//! re-registers when that set actually changes.

use crate::runtime::buffer::EchoBuffer;
use mio::net::TcpStream;
use mio::Interest;
use slab::Slab;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    /// Non-blocking client socket.
    pub stream: TcpStream,
    /// Remote address, for logging.
    pub peer: SocketAddr,
    /// File descriptor, used as the connection identifier in logs.
    pub fd: RawFd,
    /// Bytes received and not yet echoed.
    pub buffer: EchoBuffer,
    /// Interest currently registered with the poll.
    pub interest: Interest,
    /// Sitting in the event loop's ready queue.
    pub queued: bool,
}

impl Connection {
    /// Create a new connection with a zeroed buffer, interested in reads.
    pub fn new(stream: TcpStream, peer: SocketAddr, buffer_size: usize) -> Self {
        let fd = stream.as_raw_fd();
        Self {
            stream,
            peer,
            fd,
            buffer: EchoBuffer::new(buffer_size),
            interest: Interest::READABLE,
            queued: false,
        }
    }
}

/// Registry of active connections using slab allocation.
///
/// Keys double as mio tokens. Provides O(1) insert, lookup, and remove.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
}

impl ConnectionRegistry {
    /// Create a new registry with room for `capacity` connections before
    /// reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            connections: Slab::with_capacity(capacity),
        }
    }

    /// Key the next inserted connection will get.
    pub fn next_key(&self) -> usize {
        self.connections.vacant_key()
    }

    /// Insert a new connection, returning its key.
    pub fn insert(&mut self, conn: Connection) -> usize {
        self.connections.insert(conn)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }
}
