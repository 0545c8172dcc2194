//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! ## Echo cycle
//!
//! Every connection is registered for readability. On readiness the handler
//! drains the socket into the connection's buffer and immediately writes the
//! bytes back, going round (read, echo, read again) until the socket would
//! block. When the peer is not reading fast enough and a write blocks, the
//! connection is additionally registered for writability until its buffer is
//! flushed.
//!
//! A handler runs at most `max_rounds` buffer-sized rounds per call. mio
//! readiness is edge-triggered, so a connection cut off that way gets no new
//! event for the bytes it left behind; it goes on the ready queue instead and
//! is resumed after the next (non-blocking) poll.

use crate::config::Config;
use crate::runtime::buffer::{ReadStatus, WriteStatus};
use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::socket::{listen_on, SocketOptions};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Initial slab capacity for the connection registry.
const INITIAL_CONNECTIONS: usize = 1024;

/// Where a connection stands after its handler returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    /// Waiting for the next readiness event.
    Idle,
    /// Stopped at the round limit with input possibly left in the socket.
    Yielded,
    /// Peer closed its side.
    Closed,
}

/// What the accept loop does after a failed accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// Transient, try the next pending connection.
    Retry,
    /// Backlog drained.
    Drained,
    /// Anything else. Pending connections wait for the next listener event.
    Stalled,
}

fn classify_accept_error(e: &io::Error) -> AcceptFailure {
    match e.kind() {
        io::ErrorKind::WouldBlock => AcceptFailure::Drained,
        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted => AcceptFailure::Retry,
        _ => AcceptFailure::Stalled,
    }
}

/// Single-threaded echo reactor.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: ConnectionRegistry,
    /// Connections that yielded and must be resumed without a new event.
    ready: Vec<usize>,
    buffer_size: usize,
    max_rounds: usize,
    nodelay: bool,
}

impl EventLoop {
    /// Bind the listening socket and register it with a fresh poll.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let options = SocketOptions {
            nodelay: config.nodelay,
            quickack: config.quickack,
        };
        let listener = listen_on(config.listen_addr(), config.backlog, true, options)?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            listener,
            connections: ConnectionRegistry::with_capacity(INITIAL_CONNECTIONS),
            ready: Vec::new(),
            buffer_size: config.buffer_size,
            max_rounds: config.max_rounds.max(1),
            nodelay: config.nodelay,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of open client connections.
    #[cfg(test)]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run the loop until polling itself fails.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.poll_once(None)?;
        }
    }

    /// Wait for one batch of readiness events and dispatch them, then give
    /// every yielded connection one more turn.
    ///
    /// Does not block while connections are waiting on the ready queue.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = if self.ready.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => {
                    accept_connections(
                        &self.listener,
                        &self.poll,
                        &mut self.connections,
                        self.buffer_size,
                        self.nodelay,
                    );
                }
                Token(conn_id) => dispatch(
                    conn_id,
                    &self.poll,
                    &mut self.connections,
                    &mut self.ready,
                    self.max_rounds,
                ),
            }
        }

        for conn_id in std::mem::take(&mut self.ready) {
            match self.connections.get_mut(conn_id) {
                Some(conn) => conn.queued = false,
                None => continue,
            }
            dispatch(
                conn_id,
                &self.poll,
                &mut self.connections,
                &mut self.ready,
                self.max_rounds,
            );
        }

        Ok(())
    }
}

fn accept_connections(
    listener: &TcpListener,
    poll: &Poll,
    connections: &mut ConnectionRegistry,
    buffer_size: usize,
    nodelay: bool,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if nodelay {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                }

                let mut conn = Connection::new(stream, peer, buffer_size);
                let conn_id = connections.next_key();
                if let Err(e) =
                    poll.registry()
                        .register(&mut conn.stream, Token(conn_id), Interest::READABLE)
                {
                    warn!(peer = %peer, error = %e, "Failed to register connection");
                    continue;
                }

                let (fd, capacity) = (conn.fd, conn.buffer.capacity());
                connections.insert(conn);
                info!(
                    conn = fd,
                    conn_id,
                    peer = %peer,
                    buffer = capacity,
                    active = connections.len(),
                    "Accepted connection"
                );
            }
            Err(e) => match classify_accept_error(&e) {
                AcceptFailure::Retry => continue,
                AcceptFailure::Drained => break,
                AcceptFailure::Stalled => {
                    warn!(error = %e, "Accept error");
                    break;
                }
            },
        }
    }
}

/// Run the echo handler for one connection and act on the outcome.
fn dispatch(
    conn_id: usize,
    poll: &Poll,
    connections: &mut ConnectionRegistry,
    ready: &mut Vec<usize>,
    max_rounds: usize,
) {
    match handle_connection_event(conn_id, poll, connections, max_rounds) {
        Ok(Progress::Idle) => {}
        Ok(Progress::Yielded) => {
            if let Some(conn) = connections.get_mut(conn_id) {
                if !conn.queued {
                    conn.queued = true;
                    ready.push(conn_id);
                }
            }
        }
        Ok(Progress::Closed) => close_connection(poll, connections, conn_id),
        Err(e) => {
            debug!(conn_id, error = %e, "Connection error");
            close_connection(poll, connections, conn_id);
        }
    }
}

fn handle_connection_event(
    conn_id: usize,
    poll: &Poll,
    connections: &mut ConnectionRegistry,
    max_rounds: usize,
) -> io::Result<Progress> {
    let conn = match connections.get_mut(conn_id) {
        Some(conn) => conn,
        None => return Ok(Progress::Idle),
    };

    // Leftovers from a blocked write go out before anything new is read.
    if conn.buffer.has_pending() && conn.buffer.write_to(&mut conn.stream)? == WriteStatus::Partial
    {
        return Ok(Progress::Idle);
    }

    let mut rounds = 0;
    loop {
        let start = conn.buffer.cursor();
        let status = conn.buffer.read_from(&mut conn.stream)?;

        let fresh = conn.buffer.since(start);
        if !fresh.is_empty() {
            info!(
                conn = conn.fd,
                bytes = fresh.len(),
                data = %String::from_utf8_lossy(fresh),
                "Received"
            );
        }

        if status == ReadStatus::Closed {
            return Ok(Progress::Closed);
        }

        match conn.buffer.write_to(&mut conn.stream)? {
            WriteStatus::Partial => {
                set_interest(poll, conn, conn_id, Interest::READABLE | Interest::WRITABLE)?;
                return Ok(Progress::Idle);
            }
            WriteStatus::Flushed if status == ReadStatus::Full => {
                // Buffer filled up; the socket may hold more.
                rounds += 1;
                if rounds >= max_rounds {
                    set_interest(poll, conn, conn_id, Interest::READABLE)?;
                    return Ok(Progress::Yielded);
                }
            }
            WriteStatus::Flushed => {
                set_interest(poll, conn, conn_id, Interest::READABLE)?;
                return Ok(Progress::Idle);
            }
        }
    }
}

fn set_interest(
    poll: &Poll,
    conn: &mut Connection,
    conn_id: usize,
    interest: Interest,
) -> io::Result<()> {
    if conn.interest != interest {
        poll.registry()
            .reregister(&mut conn.stream, Token(conn_id), interest)?;
        conn.interest = interest;
    }
    Ok(())
}

fn close_connection(poll: &Poll, connections: &mut ConnectionRegistry, conn_id: usize) {
    if let Some(mut conn) = connections.remove(conn_id) {
        let _ = poll.registry().deregister(&mut conn.stream);
        info!(
            conn = conn.fd,
            conn_id,
            peer = %conn.peer,
            unsent = conn.buffer.received(),
            active = connections.len(),
            "Connection closed"
        );
    }
}
