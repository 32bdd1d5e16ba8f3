//! # A minimal TCP text-chat relay.
//!
//! Contains both halves of the relay. The server accepts any number of TCP connections and
//! rebroadcasts every message a client sends to every *other* connected client. The client opens
//! a single connection to a server and exchanges UTF-8 text with it. Through their control
//! surfaces a front end can:
//!
//! 1. Start or stop a server on an address and port.
//! 2. Broadcast operator text to every connected client.
//! 3. Force every client off the server without stopping the listener.
//! 4. Connect a client to a server, send text through it, and disconnect it.
//! 5. Clear the log.
//!
//! There is no framing on the wire. By default a message is considered complete when a read
//! finishes and the socket has nothing further buffered at that instant, which is a heuristic and
//! not a guarantee: a slow sender can have one message split in two, and a fast sender can have
//! two messages merged into one. The boundary policy lives behind
//! [`message::MessageBoundary`] so a stricter framing can be swapped in (see
//! [`message::Framing::Lines`]).
//!
//! TODO: Replace the unbounded outbound channel with a bounded one once senders can observe
//! backpressure.
//!
//! Architecture:
//!
//!  TcpListener (Acceptor, polled every `accept_poll`)
//!     v
//! +------------+          +----------+                 +----------+
//! | Connection |<-reads---| ReadLoop |--Relay::message->| Registry |--+
//! +------------+          +----------+                 +----------+  |
//! | Connection |<-reads---| ReadLoop |--Relay::message->    ...       |
//! +------------+          +----------+                               |
//!       ^                                                            v
//!       |                                                     +------------+
//!       +----------------------writes-------------------------| WriteChain |<- WriteQueue::send
//!                                                             +------------+
//!
//! Every box on the left is a task of its own; the `WriteChain` is the single consumer of the
//! process-wide outbound queue, so sends complete strictly in the order they were issued.

extern crate bytes;
extern crate chrono;
extern crate dashmap;
#[macro_use]
extern crate futures;
extern crate parking_lot;
extern crate thiserror;
extern crate tokio;
#[macro_use]
extern crate tracing;

pub mod client;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod outbound;
pub mod peer;
pub mod registry;
pub mod server;
pub mod sink;
pub mod terminal;

use std::time::Duration;

use crate::message::Framing;

pub use crate::client::Client;
pub use crate::error::{Error, Result};
pub use crate::server::Server;
pub use crate::sink::{Log, LogSink, MemorySink};

// Tokio (and futures) use cooperative scheduling without any
// preemption. If a task never yields execution back to the executor,
// then other tasks may be starved.
//
// To deal with this, a read loop handles at most `CHUNKS_PER_TICK`
// chunks from its socket on each poll. If the limit is hit, the
// current task is notified, informing the executor to schedule the
// task again asap.
pub const CHUNKS_PER_TICK: usize = 10;

/// How long the acceptor waits between checks of the listening socket when nothing is pending.
pub const DEFAULT_ACCEPT_POLL: Duration = Duration::from_millis(500);

/// Receive buffer size used when the OS will not report one for the socket.
pub const DEFAULT_RECV_BUFFER: usize = 8 * 1024;

/// Tunables shared by the server and the client.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Idle wait of the acceptor between listener polls.
    pub accept_poll: Duration,
    /// How inbound bytes are cut into messages.
    pub framing: Framing,
    /// Receive buffer size when the socket gives no hint.
    pub recv_buffer_fallback: usize,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            accept_poll: DEFAULT_ACCEPT_POLL,
            framing: Framing::Drained,
            recv_buffer_fallback: DEFAULT_RECV_BUFFER,
        }
    }
}
