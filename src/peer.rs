//! Defines IO with a chat peer.
//!
//! A [`Connection`] is the shared half of one TCP socket: the relay writes through it and anyone
//! may close it. The [`ReadLoop`] is the private half, one task per socket that owns the receive
//! buffer and the bytes of the message currently being assembled.
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::prelude::{task, Async, AsyncRead, AsyncWrite, Future, Poll};

use crate::message::{self, MessageBoundary};
use crate::sink::Log;
use crate::{Settings, CHUNKS_PER_TICK};

/// Server-assigned identity of a connection. Handed out in accept order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One live TCP socket.
pub struct Connection {
    /// `None` for the client's single connection.
    id: Option<ConnectionId>,
    socket: TcpStream,
    peer: SocketAddr,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(id: Option<ConnectionId>, socket: TcpStream, peer: SocketAddr) -> Connection {
        Connection {
            id,
            socket,
            peer,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Option<ConnectionId> {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Size for the receive buffer: the socket's own receive buffer hint, or `fallback`.
    pub fn recv_buffer_size(&self, fallback: usize) -> usize {
        match self.socket.recv_buffer_size() {
            Ok(size) if size > 0 => size,
            _ => fallback,
        }
    }

    /// Shut the socket down in both directions. Only the first call does anything; it returns
    /// `true`, every later call `false`.
    ///
    /// The read loop notices through a zero byte read and winds the connection down.
    pub fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        if let Err(err) = self.socket.shutdown(Shutdown::Both) {
            // the peer got there first
            debug!(id = ?self.id, peer = %self.peer, %err, "socket shutdown");
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn poll_read(&self, buf: &mut [u8]) -> Poll<usize, io::Error> {
        let mut socket = &self.socket;
        socket.poll_read(buf)
    }

    pub fn poll_write(&self, buf: &[u8]) -> Poll<usize, io::Error> {
        let mut socket = &self.socket;
        socket.poll_write(buf)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// What happens with a connection's traffic. The server registers the connection and relays its
/// messages to everyone else; the client just shows them.
pub trait Relay: Send {
    /// The read loop is about to issue its first read.
    fn opened(&mut self, conn: &Arc<Connection>);

    /// A complete inbound message.
    fn message(&mut self, conn: &Arc<Connection>, text: String);

    /// The socket is closed and the read loop is done. Called exactly once.
    fn closed(&mut self, conn: &Arc<Connection>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// No read in flight.
    Idle,
    /// Waiting for the first chunk of a message.
    Reading,
    /// At least one chunk is pending; the next read doubles as the check whether the socket has
    /// more buffered.
    Accumulating,
    Closed,
}

/// Drains a TCP socket, one read in flight at a time, and hands complete messages to a [`Relay`].
pub struct ReadLoop<R> {
    conn: Arc<Connection>,
    buffer: Vec<u8>,
    pending: BytesMut,
    boundary: Box<dyn MessageBoundary>,
    relay: R,
    log: Log,
    state: State,
    opened: bool,
}

impl<R: Relay> ReadLoop<R> {
    pub fn new(conn: Arc<Connection>, relay: R, settings: &Settings, log: Log) -> ReadLoop<R> {
        let size = conn.recv_buffer_size(settings.recv_buffer_fallback);
        ReadLoop {
            conn,
            buffer: vec![0; size],
            pending: BytesMut::with_capacity(size),
            boundary: settings.framing.boundary(),
            relay,
            log,
            state: State::Idle,
            opened: false,
        }
    }

    fn deliver(&mut self, drained: bool) {
        for msg in self.boundary.extract(&mut self.pending, drained) {
            self.relay.message(&self.conn, message::decode(&msg));
        }
    }

    fn finish(&mut self) {
        self.conn.close();
        self.pending.clear();
        self.state = State::Closed;
        debug!(id = ?self.conn.id(), peer = %self.conn.peer_addr(), "read loop closed");
        self.relay.closed(&self.conn);
    }
}

impl<R: Relay> Future for ReadLoop<R> {
    type Item = ();
    type Error = ();

    fn poll(&mut self) -> Poll<(), ()> {
        if !self.opened {
            self.opened = true;
            self.relay.opened(&self.conn);
        }

        let mut chunks = 0;
        loop {
            match self.state {
                State::Closed => return Ok(Async::Ready(())),
                State::Idle => {
                    if self.conn.is_closed() {
                        self.finish();
                    } else {
                        self.state = State::Reading;
                    }
                }
                State::Reading | State::Accumulating => {
                    if chunks == CHUNKS_PER_TICK {
                        task::current().notify();
                        return Ok(Async::NotReady);
                    }
                    let accumulating = self.state == State::Accumulating;
                    match self.conn.poll_read(&mut self.buffer) {
                        Ok(Async::NotReady) => {
                            if !accumulating {
                                return Ok(Async::NotReady);
                            }
                            // nothing else buffered: the message is complete
                            self.deliver(true);
                            self.state = State::Idle;
                        }
                        Ok(Async::Ready(n)) => {
                            // a socket closed locally reads as end of stream
                            let n = if self.conn.is_closed() { 0 } else { n };
                            if n == 0 {
                                if accumulating {
                                    self.deliver(true);
                                }
                                self.finish();
                            } else {
                                chunks += 1;
                                trace!(id = ?self.conn.id(), bytes = n, "read");
                                self.pending.extend_from_slice(&self.buffer[..n]);
                                self.deliver(false);
                                self.state = State::Accumulating;
                            }
                        }
                        Err(err) => {
                            warn!(id = ?self.conn.id(), peer = %self.conn.peer_addr(), %err, "read failed");
                            self.log.notice(&err);
                            self.finish();
                        }
                    }
                }
            }
        }
    }
}
