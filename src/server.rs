//! The relay server: accepts clients and passes every message on to everyone else.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::prelude::{Async, Future, Poll, Stream};
use tokio::runtime::{Runtime, TaskExecutor};
use tokio::timer::Interval;

use crate::endpoint;
use crate::error::{Error, Result};
use crate::outbound::{Sent, WriteQueue};
use crate::peer::{Connection, ConnectionId, ReadLoop, Relay};
use crate::registry::Registry;
use crate::sink::{Log, LogSink};
use crate::Settings;

/// Server side relay policy: pass messages on to everybody but the sender, unregister on close.
///
/// Registration happens in [`Acceptor::admit`], before the read loop exists, so a snapshot taken
/// by `stop` always sees every admitted connection.
struct ServerRelay {
    id: ConnectionId,
    registry: Registry,
    queue: WriteQueue,
    log: Log,
}

impl Relay for ServerRelay {
    fn opened(&mut self, _conn: &Arc<Connection>) {
        self.log.notice(format!("Client {} connected", self.id));
    }

    fn message(&mut self, _conn: &Arc<Connection>, text: String) {
        self.log.line(format!("<- Client {} -> {}", self.id, text));
        // relayed verbatim
        self.registry
            .broadcast(&self.queue, Bytes::from(text), Some(self.id));
    }

    fn closed(&mut self, _conn: &Arc<Connection>) {
        self.registry.unregister(self.id);
        self.log.notice(format!("Client {} connection closed", self.id));
    }
}

/// Polls the listening socket for new clients and spawns a read loop for each.
///
/// When nothing is pending it sleeps for one `accept_poll` interval at most, so clearing the
/// `active` flag stops it within that time.
struct Acceptor {
    listener: Option<TcpListener>,
    tick: Interval,
    /// Shared across restarts so ids are never handed out twice.
    next_id: Arc<AtomicU64>,
    active: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    registry: Registry,
    queue: WriteQueue,
    settings: Settings,
    log: Log,
}

impl Acceptor {
    fn admit(&mut self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        info!(%id, %peer, "accepted");
        let conn = Arc::new(Connection::new(Some(id), stream, peer));
        self.registry.register(id, conn.clone());
        let relay = ServerRelay {
            id,
            registry: self.registry.clone(),
            queue: self.queue.clone(),
            log: self.log.clone(),
        };
        tokio::spawn(ReadLoop::new(conn, relay, &self.settings, self.log.clone()));
    }

    fn stop(&mut self) {
        // closes the listening socket
        self.listener = None;
        self.active.store(false, Ordering::SeqCst);
        // catches anything admitted after `Server::stop` took its snapshot
        let late = self.registry.disconnect_all();
        if late > 0 {
            debug!(late, "disconnected clients admitted during stop");
        }
        self.running.store(false, Ordering::SeqCst);
        self.log.notice("Server stopped");
    }
}

impl Future for Acceptor {
    type Item = ();
    type Error = ();

    fn poll(&mut self) -> Poll<(), ()> {
        loop {
            if !self.active.load(Ordering::SeqCst) {
                self.stop();
                return Ok(Async::Ready(()));
            }
            let accepted = match self.listener.as_mut() {
                Some(listener) => listener.poll_accept(),
                None => return Ok(Async::Ready(())),
            };
            match accepted {
                Ok(Async::Ready((stream, peer))) => self.admit(stream, peer),
                Ok(Async::NotReady) => match self.tick.poll() {
                    Ok(Async::Ready(_)) => {}
                    Ok(Async::NotReady) => return Ok(Async::NotReady),
                    Err(err) => {
                        error!(%err, "accept timer failed");
                        self.log.notice(&err);
                        self.stop();
                        return Ok(Async::Ready(()));
                    }
                },
                Err(err) => {
                    error!(%err, "accept failed");
                    self.log.notice(&err);
                    self.stop();
                    return Ok(Async::Ready(()));
                }
            }
        }
    }
}

/// Control surface of the server.
///
/// Owns the I/O runtime everything runs on. Dropping the server (or calling
/// [`Server::shutdown`]) stops the listener, disconnects every client and waits for all of its
/// tasks to finish.
pub struct Server {
    settings: Settings,
    log: Log,
    registry: Registry,
    queue: Option<WriteQueue>,
    /// Cleared to ask the acceptor to stop.
    active: Arc<AtomicBool>,
    /// Set while an acceptor task exists.
    running: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
    local_addr: Mutex<Option<SocketAddr>>,
    executor: TaskExecutor,
    runtime: Option<Runtime>,
}

impl Server {
    pub fn new(settings: Settings, sink: Arc<dyn LogSink>) -> Result<Server> {
        let runtime = Runtime::new().map_err(Error::Runtime)?;
        let executor = runtime.executor();
        let log = Log::new(sink);
        let (queue, chain) = WriteQueue::new(log.clone());
        executor.spawn(chain);
        Ok(Server {
            settings,
            log,
            registry: Registry::new(),
            queue: Some(queue),
            active: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            next_id: Arc::new(AtomicU64::new(0)),
            local_addr: Mutex::new(None),
            executor,
            runtime: Some(runtime),
        })
    }

    /// Validate `address` and `port`, then [`listen`](Server::listen) on them.
    pub fn start(&self, address: &str, port: &str) -> Result<SocketAddr> {
        let addr = endpoint::parse_logged(address, port, &self.log)?;
        self.listen(addr)
    }

    /// Bind `addr` and start accepting clients. Returns the bound address, which differs from
    /// `addr` when port 0 was asked for.
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        if self.active.load(Ordering::SeqCst) || self.running.load(Ordering::SeqCst) {
            self.log.notice(Error::AlreadyActive);
            return Err(Error::AlreadyActive);
        }
        let queue = match self.queue {
            Some(ref queue) => queue.clone(),
            None => return Err(Error::QueueClosed),
        };
        let listener = TcpListener::bind(&addr)
            .and_then(|listener| {
                let local = listener.local_addr()?;
                Ok((listener, local))
            })
            .map_err(|err| {
                error!(%addr, %err, "bind failed");
                self.log.notice(&err);
                Error::Bind(err)
            })?;
        let (listener, local) = listener;

        *self.local_addr.lock() = Some(local);
        self.active.store(true, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        self.log.notice("Server started");
        info!(addr = %local, "listening");

        let active = self.active.clone();
        let running = self.running.clone();
        let next_id = self.next_id.clone();
        let registry = self.registry.clone();
        let settings = self.settings.clone();
        let log = self.log.clone();
        self.executor.spawn(future::lazy(move || {
            let poll = settings.accept_poll;
            Acceptor {
                listener: Some(listener),
                tick: Interval::new(Instant::now() + poll, poll),
                next_id,
                active,
                running,
                registry,
                queue,
                settings,
                log,
            }
        }));
        Ok(local)
    }

    /// Stop accepting and disconnect every client.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.registry.disconnect_all();
    }

    /// Send operator text to every connected client.
    pub fn broadcast(&self, text: &str) -> Option<Sent> {
        if text.is_empty() {
            return None;
        }
        self.log.line(format!("<- Server (You) -> {}", text));
        let queue = self.queue.as_ref()?;
        let payload = Bytes::from(format!("<- Server -> {}", text));
        Some(self.registry.broadcast(queue, payload, None))
    }

    /// Close every client connection but keep listening. Returns how many were closed.
    pub fn disconnect_all(&self) -> usize {
        self.registry.disconnect_all()
    }

    pub fn clear_log(&self) {
        self.log.clear();
    }

    /// Whether the listener is up.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether an acceptor task still exists; it lingers up to one poll interval after `stop`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Stop everything and wait for every task to finish.
    pub fn shutdown(self) {
        drop(self)
    }

    fn teardown(&mut self) {
        let runtime = match self.runtime.take() {
            Some(runtime) => runtime,
            None => return,
        };
        self.log.exit();
        self.stop();
        // the write chain ends once the last queue handle is gone
        self.queue = None;
        debug!("waiting for server tasks");
        let _ = runtime.shutdown_on_idle().wait();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.teardown();
    }
}
