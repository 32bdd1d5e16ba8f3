//! Serialized outbound writes.
//!
//! Every send in the process goes through one [`WriteQueue`]. Its single consumer, the
//! [`WriteChain`] task, runs one job at a time: a job writes its whole payload to each of its
//! targets, and the next job is not started until every one of those writes has finished or
//! failed. Sends therefore complete in the order they were issued and never interleave on a
//! socket. The flip side is that one slow peer holds up every send queued behind it, for every
//! connection.
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::future;
use futures::sync::{mpsc, oneshot};
use tokio::prelude::{Async, Future, Poll, Stream};

use crate::error::Error;
use crate::peer::{Connection, ConnectionId};
use crate::registry::Registry;
use crate::sink::Log;

/// Who a job is written to.
#[derive(Debug)]
pub enum Targets {
    One(Arc<Connection>),
    /// Everyone in the registry at the time the job runs, minus `exclude`.
    AllExcept {
        registry: Registry,
        exclude: Option<ConnectionId>,
    },
}

impl Targets {
    fn resolve(self) -> Vec<Arc<Connection>> {
        let conns = match self {
            Targets::One(conn) => vec![conn],
            Targets::AllExcept { registry, exclude } => registry.snapshot(exclude),
        };
        conns.into_iter().filter(|conn| !conn.is_closed()).collect()
    }
}

/// "Write this payload to these connections."
pub struct OutboundJob {
    payload: Bytes,
    targets: Targets,
    done: oneshot::Sender<()>,
}

type Running = Box<dyn Future<Item = (), Error = ()> + Send>;

impl OutboundJob {
    fn start(self, log: &Log) -> Running {
        let OutboundJob {
            payload,
            targets,
            done,
        } = self;
        let writes: Vec<_> = targets
            .resolve()
            .into_iter()
            .map(|conn| {
                let log = log.clone();
                let id = conn.id();
                WriteAll::new(conn, payload.clone()).then(move |res| {
                    if let Err(err) = res {
                        // left to the read loop to notice if the connection is really gone
                        warn!(id = ?id, %err, "write failed");
                        log.notice(&err);
                    }
                    Ok::<(), ()>(())
                })
            })
            .collect();
        trace!(targets = writes.len(), bytes = payload.len(), "outbound job");
        Box::new(future::join_all(writes).map(move |_| {
            let _ = done.send(());
        }))
    }
}

/// Sending side of the process-wide write queue.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<OutboundJob>,
}

impl WriteQueue {
    /// The queue and the task that drains it. The chain has to be spawned for anything to be
    /// written; it finishes once every `WriteQueue` clone is gone and the last job is done.
    pub fn new(log: Log) -> (WriteQueue, WriteChain) {
        let (tx, rx) = mpsc::unbounded();
        let chain = WriteChain {
            jobs: rx,
            current: None,
            log,
        };
        (WriteQueue { tx }, chain)
    }

    /// Queue `payload` for `targets`. Starts right away if nothing else is in flight, otherwise
    /// once everything queued before it has finished.
    pub fn send(&self, payload: Bytes, targets: Targets) -> Sent {
        let (done, rx) = oneshot::channel();
        let job = OutboundJob {
            payload,
            targets,
            done,
        };
        if self.tx.unbounded_send(job).is_err() {
            debug!("send after the write chain stopped");
        }
        Sent { rx }
    }
}

/// Resolves once the job it belongs to has been written to all of its targets, successfully or
/// not.
pub struct Sent {
    rx: oneshot::Receiver<()>,
}

impl Future for Sent {
    type Item = ();
    type Error = Error;

    fn poll(&mut self) -> Poll<(), Error> {
        self.rx.poll().map_err(|_| Error::QueueClosed)
    }
}

/// The single consumer of a [`WriteQueue`].
pub struct WriteChain {
    jobs: mpsc::UnboundedReceiver<OutboundJob>,
    current: Option<Running>,
    log: Log,
}

impl Future for WriteChain {
    type Item = ();
    type Error = ();

    fn poll(&mut self) -> Poll<(), ()> {
        loop {
            if let Some(running) = self.current.as_mut() {
                match running.poll() {
                    Ok(Async::NotReady) => return Ok(Async::NotReady),
                    _ => self.current = None,
                }
            }
            match self.jobs.poll() {
                Ok(Async::Ready(Some(job))) => self.current = Some(job.start(&self.log)),
                Ok(Async::NotReady) => return Ok(Async::NotReady),
                Ok(Async::Ready(None)) | Err(()) => {
                    debug!("write chain finished");
                    return Ok(Async::Ready(()));
                }
            }
        }
    }
}

/// Writes all of `payload` to one connection.
struct WriteAll {
    conn: Arc<Connection>,
    payload: Bytes,
    written: usize,
}

impl WriteAll {
    fn new(conn: Arc<Connection>, payload: Bytes) -> WriteAll {
        WriteAll {
            conn,
            payload,
            written: 0,
        }
    }
}

impl Future for WriteAll {
    type Item = ();
    type Error = io::Error;

    fn poll(&mut self) -> Poll<(), io::Error> {
        while self.written < self.payload.len() {
            let n = try_ready!(self.conn.poll_write(&self.payload[self.written..]));
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "connection accepted no more bytes",
                ));
            }
            self.written += n;
        }
        Ok(Async::Ready(()))
    }
}
