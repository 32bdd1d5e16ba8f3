//! The chat client: one connection to a relay server.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future;
use parking_lot::Mutex;
use tokio::net::tcp::ConnectFuture;
use tokio::net::TcpStream;
use tokio::prelude::{Async, Future, Poll};
use tokio::runtime::{Runtime, TaskExecutor};

use crate::endpoint;
use crate::error::{Error, Result};
use crate::outbound::{Sent, Targets, WriteQueue};
use crate::peer::{Connection, ReadLoop, Relay};
use crate::sink::{Log, LogSink};
use crate::Settings;

#[derive(Debug)]
enum Link {
    Idle,
    Dialing,
    Connected(Arc<Connection>),
}

/// Client side relay policy: everything received goes straight to the log.
struct ClientRelay {
    link: Arc<Mutex<Link>>,
    /// Set once the client is being torn down.
    closing: Arc<AtomicBool>,
    log: Log,
}

impl Relay for ClientRelay {
    fn opened(&mut self, conn: &Arc<Connection>) {
        *self.link.lock() = Link::Connected(conn.clone());
        self.log.notice("Client connected");
        // a teardown that saw `Dialing` won't close this connection for us
        if self.closing.load(Ordering::SeqCst) {
            conn.close();
        }
    }

    fn message(&mut self, _conn: &Arc<Connection>, text: String) {
        self.log.line(text);
    }

    fn closed(&mut self, _conn: &Arc<Connection>) {
        *self.link.lock() = Link::Idle;
        self.log.notice("Client disconnected");
    }
}

enum DialState {
    Connecting(ConnectFuture),
    Reading(ReadLoop<ClientRelay>),
}

/// Opens the connection and then runs its read loop until it closes.
struct Dialer {
    addr: SocketAddr,
    state: DialState,
    link: Arc<Mutex<Link>>,
    closing: Arc<AtomicBool>,
    settings: Settings,
    log: Log,
}

impl Dialer {
    fn new(
        addr: SocketAddr,
        link: Arc<Mutex<Link>>,
        closing: Arc<AtomicBool>,
        settings: Settings,
        log: Log,
    ) -> Dialer {
        Dialer {
            addr,
            state: DialState::Connecting(TcpStream::connect(&addr)),
            link,
            closing,
            settings,
            log,
        }
    }
}

impl Future for Dialer {
    type Item = ();
    type Error = ();

    fn poll(&mut self) -> Poll<(), ()> {
        let stream = match self.state {
            DialState::Reading(ref mut reader) => return reader.poll(),
            DialState::Connecting(ref mut connect) => match connect.poll() {
                Ok(Async::Ready(stream)) => stream,
                Ok(Async::NotReady) => return Ok(Async::NotReady),
                Err(err) => {
                    warn!(addr = %self.addr, %err, "connect failed");
                    *self.link.lock() = Link::Idle;
                    self.log.notice(&err);
                    return Ok(Async::Ready(()));
                }
            },
        };
        info!(addr = %self.addr, "connected");
        let conn = Arc::new(Connection::new(None, stream, self.addr));
        let relay = ClientRelay {
            link: self.link.clone(),
            closing: self.closing.clone(),
            log: self.log.clone(),
        };
        let mut reader = ReadLoop::new(conn, relay, &self.settings, self.log.clone());
        let res = reader.poll();
        self.state = DialState::Reading(reader);
        res
    }
}

/// Control surface of the client.
///
/// Owns the I/O runtime its connection runs on. Dropping the client (or calling
/// [`Client::shutdown`]) closes the connection and waits for its tasks to finish.
pub struct Client {
    settings: Settings,
    log: Log,
    link: Arc<Mutex<Link>>,
    closing: Arc<AtomicBool>,
    queue: Option<WriteQueue>,
    executor: TaskExecutor,
    runtime: Option<Runtime>,
}

impl Client {
    pub fn new(settings: Settings, sink: Arc<dyn LogSink>) -> Result<Client> {
        let runtime = Runtime::new().map_err(Error::Runtime)?;
        let executor = runtime.executor();
        let log = Log::new(sink);
        let (queue, chain) = WriteQueue::new(log.clone());
        executor.spawn(chain);
        Ok(Client {
            settings,
            log,
            link: Arc::new(Mutex::new(Link::Idle)),
            closing: Arc::new(AtomicBool::new(false)),
            queue: Some(queue),
            executor,
            runtime: Some(runtime),
        })
    }

    /// Validate `address` and `port`, then [`dial`](Client::dial) them.
    pub fn connect(&self, address: &str, port: &str) -> Result<()> {
        let addr = endpoint::parse_logged(address, port, &self.log)?;
        self.dial(addr)
    }

    /// Start connecting to `addr`. Connection failures are reported through the log; the client
    /// just stays disconnected.
    pub fn dial(&self, addr: SocketAddr) -> Result<()> {
        let idle = {
            let mut link = self.link.lock();
            let idle = match *link {
                Link::Idle => true,
                _ => false,
            };
            if idle {
                *link = Link::Dialing;
            }
            idle
        };
        if !idle {
            self.log.notice(Error::AlreadyConnected);
            return Err(Error::AlreadyConnected);
        }
        let link = self.link.clone();
        let closing = self.closing.clone();
        let settings = self.settings.clone();
        let log = self.log.clone();
        self.executor
            .spawn(future::lazy(move || Dialer::new(addr, link, closing, settings, log)));
        Ok(())
    }

    /// Close the active connection, if there is one.
    pub fn disconnect(&self) -> bool {
        match *self.link.lock() {
            Link::Connected(ref conn) => conn.close(),
            _ => false,
        }
    }

    /// Send `text` to the server. Shown in the log either way, but only written when connected.
    pub fn send(&self, text: &str) -> Option<Sent> {
        if text.is_empty() {
            return None;
        }
        self.log.line(format!("<- You -> {}", text));
        let conn = match *self.link.lock() {
            Link::Connected(ref conn) => conn.clone(),
            _ => return None,
        };
        let queue = self.queue.as_ref()?;
        Some(queue.send(Bytes::from(text), Targets::One(conn)))
    }

    pub fn clear_log(&self) {
        self.log.clear();
    }

    pub fn is_connected(&self) -> bool {
        match *self.link.lock() {
            Link::Connected(_) => true,
            _ => false,
        }
    }

    /// Close the connection and wait for every task to finish.
    pub fn shutdown(self) {
        drop(self)
    }

    fn teardown(&mut self) {
        let runtime = match self.runtime.take() {
            Some(runtime) => runtime,
            None => return,
        };
        self.log.exit();
        // set before looking at the link: whichever of us runs second closes the connection
        self.closing.store(true, Ordering::SeqCst);
        let dialing = match *self.link.lock() {
            Link::Connected(ref conn) => {
                conn.close();
                false
            }
            Link::Dialing => true,
            Link::Idle => false,
        };
        self.queue = None;
        debug!(dialing, "waiting for client tasks");
        if dialing {
            // a connect attempt can hang for minutes; don't wait on it
            let _ = runtime.shutdown_now().wait();
        } else {
            let _ = runtime.shutdown_on_idle().wait();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.teardown();
    }
}
