//! One stream shared by many concurrent exchanges, demultiplexed by DNS ID.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ferrous_forward_application::ports::ExchangeContext;
use ferrous_forward_domain::DomainError;
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::framing::{read_framed, write_framed, MAX_MESSAGE_SIZE};
use crate::dns::message::{
    decode, encode, question_name, question_type, set_message_id, set_wire_id, wire_id,
};

/// Exchanges allowed in flight on one connection before the pool dials another.
pub const MAX_IN_FLIGHT_PER_CONN: usize = 128;

const ID_ALLOCATION_ATTEMPTS: usize = 64;

type Waiter = oneshot::Sender<Result<Message, DomainError>>;

struct Pending {
    seq: u64,
    question: Option<Question>,
    waiter: Waiter,
}

type Question = (String, RecordType);

fn question_of(message: &Message) -> Option<Question> {
    Some((question_name(message)?, question_type(message)?))
}

impl Pending {
    /// A reply whose question differs answers an earlier owner of this ID.
    fn answers(&self, reply: &Message) -> bool {
        match (&self.question, question_of(reply)) {
            (Some(asked), Some(answered)) => *asked == answered,
            _ => true,
        }
    }
}

struct ConnShared {
    server: Arc<str>,
    outbound: mpsc::Sender<Vec<u8>>,
    pending: DashMap<u16, Pending>,
    next_seq: AtomicU64,
    refs: AtomicUsize,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    last_used: Mutex<Instant>,
    shutdown: CancellationToken,
}

impl ConnShared {
    /// Registers `waiter` under a free wire ID; returns the ID and the
    /// sequence number that owns the slot.
    fn allocate_id(
        &self,
        question: Option<Question>,
        waiter: Waiter,
    ) -> Result<(u16, u64), DomainError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut pending = Some(Pending {
            seq,
            question,
            waiter,
        });
        for _ in 0..ID_ALLOCATION_ATTEMPTS {
            let id = fastrand::u16(..);
            if let Entry::Vacant(slot) = self.pending.entry(id) {
                if let Some(pending) = pending.take() {
                    slot.insert(pending);
                }
                return Ok((id, seq));
            }
        }
        Err(DomainError::ProtocolError(format!(
            "No free query ID on pipelined connection to {}",
            self.server
        )))
    }

    fn shut_down(&self, err: DomainError) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.cancel();
        self.fail_all(err);
    }

    fn fail_all(&self, err: DomainError) {
        let ids: Vec<u16> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.waiter.send(Err(err.clone()));
            }
        }
    }

    fn closed_error(&self) -> DomainError {
        DomainError::ConnectionClosed(self.server.to_string())
    }
}

/// Releases the pending slot and in-flight count however the exchange ends.
/// The slot is only removed while it still belongs to this exchange, since a
/// delivered reply frees the ID for reuse.
struct InFlightGuard<'a> {
    shared: &'a ConnShared,
    id: u16,
    seq: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let seq = self.seq;
        self.shared.pending.remove_if(&self.id, |_, p| p.seq == seq);
        self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
        *self.shared.last_used.lock() = Instant::now();
    }
}

/// A multiplexed DNS stream. Clones share the connection; the last clone
/// dropped stops the reader and writer tasks and closes the stream.
///
/// Frames are written by a dedicated task, so an exchange abandoned at any
/// point never leaves a partial frame on the wire.
pub struct PipelinedConn {
    shared: Arc<ConnShared>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl PipelinedConn {
    pub fn new<S>(stream: S, server: impl Into<Arc<str>>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, queue) = mpsc::channel(MAX_IN_FLIGHT_PER_CONN);
        let shared = Arc::new(ConnShared {
            server: server.into(),
            outbound,
            pending: DashMap::new(),
            next_seq: AtomicU64::new(0),
            refs: AtomicUsize::new(1),
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            last_used: Mutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
        });

        let reader = tokio::spawn(read_loop(Arc::clone(&shared), read_half));
        let writer = tokio::spawn(write_loop(Arc::clone(&shared), write_half, queue));

        Self {
            shared,
            tasks: Arc::new(Mutex::new(vec![reader, writer])),
        }
    }

    pub async fn exchange(
        &self,
        ctx: &ExchangeContext,
        query: &Message,
    ) -> Result<Message, DomainError> {
        let shared = &*self.shared;
        if self.is_closed() {
            return Err(shared.closed_error());
        }

        let mut bytes = encode(query)?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(DomainError::ProtocolError(format!(
                "DNS message too large: {} bytes",
                bytes.len()
            )));
        }

        let (tx, rx) = oneshot::channel();
        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        let (id, seq) = match shared.allocate_id(question_of(query), tx) {
            Ok(slot) => slot,
            Err(e) => {
                shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        };
        let _guard = InFlightGuard { shared, id, seq };

        // The connection may have died between the first check and registration.
        if self.is_closed() {
            return Err(shared.closed_error());
        }

        set_wire_id(&mut bytes, id);
        tokio::select! {
            sent = shared.outbound.send(bytes) => {
                sent.map_err(|_| shared.closed_error())?;
            }
            _ = ctx.cancel.cancelled() => return Err(DomainError::Cancelled),
            _ = shared.shutdown.cancelled() => return Err(shared.closed_error()),
        }
        trace!(server = %shared.server, wire_id = id, log_id = ctx.log_id, "Pipelined query queued");

        tokio::select! {
            reply = rx => match reply {
                Ok(Ok(mut message)) => {
                    set_message_id(&mut message, query.id());
                    Ok(message)
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(shared.closed_error()),
            },
            _ = ctx.cancel.cancelled() => Err(DomainError::Cancelled),
            _ = shared.shutdown.cancelled() => Err(shared.closed_error()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn idle_for(&self) -> Duration {
        self.shared.last_used.lock().elapsed()
    }

    pub fn ref_count(&self) -> usize {
        self.shared.refs.load(Ordering::Acquire)
    }

    /// Releases this reference; same as dropping it.
    pub fn close(self) {
        drop(self);
    }
}

impl Clone for PipelinedConn {
    fn clone(&self) -> Self {
        self.shared.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: Arc::clone(&self.shared),
            tasks: Arc::clone(&self.tasks),
        }
    }
}

impl Drop for PipelinedConn {
    fn drop(&mut self) {
        if self.shared.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.closed.store(true, Ordering::Release);
            self.shared.shutdown.cancel();
            // Both tasks exit on the token and drop their halves of the stream.
            self.tasks.lock().clear();
        }
    }
}

async fn write_loop<S>(
    shared: Arc<ConnShared>,
    mut writer: WriteHalf<S>,
    mut queue: mpsc::Receiver<Vec<u8>>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let written = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            written = write_framed(&mut writer, &frame) => written,
        };
        if let Err(e) = written {
            debug!(server = %shared.server, error = %e, "Pipelined connection write failed");
            shared.shut_down(DomainError::from_io(shared.server.to_string(), e));
            break;
        }
    }
}

async fn read_loop<S>(shared: Arc<ConnShared>, mut reader: ReadHalf<S>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let err = loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => break shared.closed_error(),
            frame = read_framed(&mut reader) => frame,
        };

        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(server = %shared.server, error = %e, "Pipelined connection read failed");
                break DomainError::from_io(shared.server.to_string(), e);
            }
        };

        let Some(id) = wire_id(&bytes) else {
            continue;
        };
        let delivered = match decode(&bytes) {
            Ok(reply) => shared
                .pending
                .remove_if(&id, |_, p| p.answers(&reply))
                .map(|(_, pending)| pending.waiter.send(Ok(reply))),
            Err(e) => shared
                .pending
                .remove(&id)
                .map(|(_, pending)| pending.waiter.send(Err(e))),
        };
        if delivered.is_none() {
            trace!(server = %shared.server, wire_id = id, "Dropping unmatched reply");
        }
    };

    shared.shut_down(err);
}

/// Opens the streams a [`PipelinePool`] multiplexes over.
#[async_trait]
pub trait PipelineConnector: Send + Sync + 'static {
    async fn connect(&self, ctx: &ExchangeContext) -> Result<PipelinedConn, DomainError>;
}

struct PipelineInner<C: PipelineConnector> {
    connector: C,
    conns: Mutex<Vec<PipelinedConn>>,
    max_conns: usize,
    idle_timeout: Duration,
    closed: AtomicBool,
}

impl<C: PipelineConnector> PipelineInner<C> {
    /// Least-loaded live connection, or `None` when a new one should be dialed.
    fn pick(&self) -> Option<PipelinedConn> {
        let mut conns = self.conns.lock();
        conns.retain(|c| !c.is_closed());
        let best = conns.iter().min_by_key(|c| c.in_flight())?;
        if best.in_flight() < MAX_IN_FLIGHT_PER_CONN || conns.len() >= self.max_conns {
            return Some(best.clone());
        }
        None
    }

    fn sweep(&self) {
        let removed: Vec<PipelinedConn> = {
            let mut conns = self.conns.lock();
            let mut removed = Vec::new();
            let mut i = 0;
            while i < conns.len() {
                let conn = &conns[i];
                let idle = conn.in_flight() == 0 && conn.idle_for() > self.idle_timeout;
                if conn.is_closed() || idle {
                    removed.push(conns.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            removed
        };
        if !removed.is_empty() {
            debug!(count = removed.len(), "Dropping idle pipelined connections");
        }
    }
}

/// Up to `max_conns` shared connections, picked by load.
pub struct PipelinePool<C: PipelineConnector> {
    inner: Arc<PipelineInner<C>>,
    dial_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<C: PipelineConnector> PipelinePool<C> {
    pub fn new(connector: C, max_conns: usize, idle_timeout: Duration) -> Self {
        let inner = Arc::new(PipelineInner {
            connector,
            conns: Mutex::new(Vec::new()),
            max_conns: max_conns.max(1),
            idle_timeout,
            closed: AtomicBool::new(false),
        });

        let shutdown = CancellationToken::new();
        let sweeper = tokio::spawn({
            let inner = Arc::clone(&inner);
            let shutdown = shutdown.clone();
            async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => inner.sweep(),
                    }
                }
            }
        });

        Self {
            inner,
            dial_lock: tokio::sync::Mutex::new(()),
            shutdown,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    pub async fn get(&self, ctx: &ExchangeContext) -> Result<PipelinedConn, DomainError> {
        if self.is_closed() {
            return Err(DomainError::PoolClosed);
        }
        if let Some(conn) = self.inner.pick() {
            return Ok(conn);
        }

        // Concurrent misses wait here and reuse whatever the first one dialed.
        let _dialing = ctx.run(async { Ok(self.dial_lock.lock().await) }).await?;
        if let Some(conn) = self.inner.pick() {
            return Ok(conn);
        }

        let conn = self.inner.connector.connect(ctx).await?;
        if self.is_closed() {
            return Err(DomainError::PoolClosed);
        }
        self.inner.conns.lock().push(conn.clone());
        Ok(conn)
    }

    pub async fn exchange(
        &self,
        ctx: &ExchangeContext,
        query: &Message,
    ) -> Result<Message, DomainError> {
        let conn = self.get(ctx).await?;
        conn.exchange(ctx, query).await
    }

    pub fn connection_count(&self) -> usize {
        self.inner.conns.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }
        let conns = std::mem::take(&mut *self.inner.conns.lock());
        drop(conns);
    }
}

impl<C: PipelineConnector> Drop for PipelinePool<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
