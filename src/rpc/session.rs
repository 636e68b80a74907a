//! Connection-scoped and request-scoped session state.
//!
//! # Responsibilities
//! - Own the per-connection correlation table (request id → reply slot)
//! - Own the bounded downstream and upstream write queues
//! - Expose the connection-done and upstream-done signals
//! - Record the sticky upstream target for the connection
//! - Carry one call through the chain and hold its response slot

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use axum::body::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::{ProxyError, ProxyResult};
use crate::net::connection::ConnectionId;
use crate::pool::PoolError;
use crate::rpc::envelope::{RpcRequest, RpcResponse};
use crate::rpc::frame::{CloseReason, Frame};
use crate::rpc::signal::DoneSignal;

/// Capacity of the downstream write queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Lifecycle of the upstream link owned by a connection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle = 0,
    Dialing = 1,
    Connected = 2,
    Draining = 3,
    Closed = 4,
}

impl From<u8> for LinkState {
    fn from(val: u8) -> Self {
        match val {
            1 => LinkState::Dialing,
            2 => LinkState::Connected,
            3 => LinkState::Draining,
            4 => LinkState::Closed,
            _ => LinkState::Idle,
        }
    }
}

#[derive(Debug)]
struct PendingReply {
    ticket: u64,
    tx: oneshot::Sender<RpcResponse>,
}

/// State shared by everything serving one downstream connection.
#[derive(Debug)]
pub struct ConnectionSession {
    id: ConnectionId,
    peer: Option<SocketAddr>,

    pending: DashMap<u64, PendingReply>,
    next_ticket: AtomicU64,
    /// Calls given up on while their reply could still arrive.
    abandoned: AtomicU64,

    downstream_tx: Mutex<Option<mpsc::Sender<Frame>>>,
    downstream_rx: Mutex<Option<mpsc::Receiver<Frame>>>,
    downstream_close: Mutex<Option<CloseReason>>,
    done: DoneSignal,

    selected_target: ArcSwapOption<String>,
    link_state: AtomicU8,
    upstream_tx: Mutex<Option<mpsc::Sender<Frame>>>,
    upstream_done: DoneSignal,
    upstream_error: Mutex<Option<PoolError>>,

    closed: AtomicBool,
}

impl ConnectionSession {
    pub fn new(id: ConnectionId, peer: Option<SocketAddr>, queue_capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        Arc::new(Self {
            id,
            peer,
            pending: DashMap::new(),
            next_ticket: AtomicU64::new(1),
            abandoned: AtomicU64::new(0),
            downstream_tx: Mutex::new(Some(tx)),
            downstream_rx: Mutex::new(Some(rx)),
            downstream_close: Mutex::new(None),
            done: DoneSignal::new(),
            selected_target: ArcSwapOption::empty(),
            link_state: AtomicU8::new(LinkState::Idle as u8),
            upstream_tx: Mutex::new(None),
            upstream_done: DoneSignal::new(),
            upstream_error: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    // --- correlation table ---

    /// Register a reply slot for `id`. Must happen before the request is sent.
    ///
    /// A slot already registered under the same id is superseded; its waiter
    /// resolves as if the upstream had closed.
    pub fn register_reply(&self, id: u64) -> (u64, oneshot::Receiver<RpcResponse>) {
        let (tx, rx) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        if self.pending.insert(id, PendingReply { ticket, tx }).is_some() {
            tracing::warn!(connection_id = %self.id, request_id = id, "Duplicate in-flight request id");
        }
        (ticket, rx)
    }

    /// Hand a reply to its waiter and forget the slot.
    pub fn route_reply(&self, response: RpcResponse) -> bool {
        let id = response.id;
        match self.pending.remove(&id) {
            Some((_, slot)) => slot.tx.send(response).is_ok(),
            None => {
                tracing::debug!(connection_id = %self.id, request_id = id, "Reply for unknown or expired request");
                false
            }
        }
    }

    /// Drop the slot for `id` if it still belongs to `ticket`.
    pub fn cancel_reply(&self, id: u64, ticket: u64) -> bool {
        self.pending
            .remove_if(&id, |_, slot| slot.ticket == ticket)
            .is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn mark_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn abandoned_count(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    /// No call is in flight and none was ever given up on.
    ///
    /// Pending is read first: `close` moves pending slots into the abandoned
    /// count before clearing them, so one of the two reads sees every orphan.
    pub fn is_quiescent(&self) -> bool {
        self.pending.is_empty() && self.abandoned_count() == 0
    }

    // --- downstream ---

    /// Queue a frame for the downstream peer, waiting while the queue is full.
    pub async fn send_downstream(&self, frame: Frame) -> ProxyResult<()> {
        let tx = lock(&self.downstream_tx)
            .clone()
            .ok_or(ProxyError::ConnectionGone)?;
        tokio::select! {
            res = tx.send(frame) => res.map_err(|_| ProxyError::ConnectionGone),
            _ = self.done.wait() => Err(ProxyError::ConnectionGone),
        }
    }

    /// Hand the single consumer end of the downstream queue to the writer task.
    pub fn take_downstream_receiver(&self) -> Option<mpsc::Receiver<Frame>> {
        lock(&self.downstream_rx).take()
    }

    pub fn connection_done(&self) -> &DoneSignal {
        &self.done
    }

    /// Remember the close frame the downstream peer sent.
    pub fn record_downstream_close(&self, reason: Option<CloseReason>) {
        *lock(&self.downstream_close) = reason;
    }

    pub fn downstream_close(&self) -> Option<CloseReason> {
        lock(&self.downstream_close).clone()
    }

    // --- upstream ---

    pub fn selected_target(&self) -> Option<Arc<String>> {
        self.selected_target.load_full()
    }

    /// Set the target unless one was already chosen. Returns whether it was set.
    pub fn select_target_once(&self, target: impl Into<String>) -> bool {
        let prev = self
            .selected_target
            .compare_and_swap(&None::<Arc<String>>, Some(Arc::new(target.into())));
        prev.is_none()
    }

    /// Replace the target unconditionally.
    pub fn reselect_target(&self, target: impl Into<String>) {
        self.selected_target.store(Some(Arc::new(target.into())));
    }

    pub fn link_state(&self) -> LinkState {
        LinkState::from(self.link_state.load(Ordering::Acquire))
    }

    pub fn set_link_state(&self, state: LinkState) {
        self.link_state.store(state as u8, Ordering::Release);
    }

    /// Create the upstream outbound queue and return its consumer end.
    pub fn attach_upstream_queue(&self, capacity: usize) -> ProxyResult<mpsc::Receiver<Frame>> {
        if self.is_closed() {
            return Err(ProxyError::ConnectionGone);
        }
        let mut slot = lock(&self.upstream_tx);
        if slot.is_some() {
            return Err(ProxyError::UpstreamAlreadyAttached);
        }
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *slot = Some(tx);
        Ok(rx)
    }

    /// Queue a frame for the upstream link.
    pub async fn send_upstream(&self, frame: Frame) -> ProxyResult<()> {
        let tx = lock(&self.upstream_tx)
            .clone()
            .ok_or_else(|| self.upstream_failure())?;
        tokio::select! {
            res = tx.send(frame) => res.map_err(|_| self.upstream_failure()),
            _ = self.upstream_done.wait() => Err(self.upstream_failure()),
            _ = self.done.wait() => Err(ProxyError::ConnectionGone),
        }
    }

    /// Close the upstream queue. Returns `true` the first time only.
    pub fn close_upstream_queue(&self) -> bool {
        lock(&self.upstream_tx).take().is_some()
    }

    pub fn upstream_done(&self) -> &DoneSignal {
        &self.upstream_done
    }

    /// No link could be obtained. Stores why and releases every waiter.
    pub fn fail_upstream(&self, error: PoolError) {
        *lock(&self.upstream_error) = Some(error);
        self.upstream_done.fire();
    }

    /// What a call sees once the upstream is done.
    pub fn upstream_failure(&self) -> ProxyError {
        match lock(&self.upstream_error).clone() {
            Some(e) => ProxyError::Pool(e),
            None => ProxyError::UpstreamClosed,
        }
    }

    // --- teardown ---

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tear the session down. Safe to call any number of times; only the
    /// first call does anything and returns `true`.
    ///
    /// Signals fire before queues close so blocked writers wake on the signal
    /// rather than on a dropped receiver.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.done.fire();
        lock(&self.upstream_tx).take();
        lock(&self.downstream_tx).take();

        // Each slot is counted before it leaves the table.
        let mut orphaned = 0u64;
        self.pending.retain(|_, _| {
            self.abandoned.fetch_add(1, Ordering::Relaxed);
            orphaned += 1;
            false
        });

        tracing::debug!(connection_id = %self.id, orphaned, "Connection session closed");
        true
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct ReplyHandle {
    ticket: u64,
    rx: oneshot::Receiver<RpcResponse>,
}

/// One inbound call on its way through the chain.
#[derive(Debug)]
pub struct RequestSession {
    conn: Weak<ConnectionSession>,
    connection_id: ConnectionId,
    pub trace_id: Uuid,
    pub received_at: Instant,

    request_bytes: Bytes,
    request: Option<RpcRequest>,
    response: Option<RpcResponse>,
    reply: Option<ReplyHandle>,

    /// Set when the response came from the cache.
    pub response_set_by_cache: bool,
    /// Replaces the method name when computing cache keys.
    pub cache_key_override: Option<String>,
}

impl RequestSession {
    pub fn new(conn: &Arc<ConnectionSession>) -> Self {
        Self {
            conn: Arc::downgrade(conn),
            connection_id: conn.id(),
            trace_id: Uuid::new_v4(),
            received_at: Instant::now(),
            request_bytes: Bytes::new(),
            request: None,
            response: None,
            reply: None,
            response_set_by_cache: false,
            cache_key_override: None,
        }
    }

    /// Session for an already decoded call.
    pub fn for_request(conn: &Arc<ConnectionSession>, bytes: Bytes, request: RpcRequest) -> Self {
        let mut session = Self::new(conn);
        session.set_request(bytes, request);
        session
    }

    pub fn connection(&self) -> ProxyResult<Arc<ConnectionSession>> {
        self.conn.upgrade().ok_or(ProxyError::ConnectionGone)
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn set_request(&mut self, bytes: Bytes, request: RpcRequest) {
        self.request_bytes = bytes;
        self.request = Some(request);
    }

    pub fn request(&self) -> ProxyResult<&RpcRequest> {
        self.request.as_ref().ok_or(ProxyError::MissingRequest)
    }

    pub fn request_bytes(&self) -> &Bytes {
        &self.request_bytes
    }

    pub fn request_id(&self) -> Option<u64> {
        self.request.as_ref().map(|r| r.id)
    }

    /// Name used to build cache keys: the override, else the method.
    pub fn method_for_cache(&self) -> Option<&str> {
        self.cache_key_override
            .as_deref()
            .or_else(|| self.request.as_ref().map(|r| r.method.as_str()))
    }

    pub fn response(&self) -> Option<&RpcResponse> {
        self.response.as_ref()
    }

    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }

    /// Set the response. A second attempt is rejected and leaves the first in place.
    pub fn fill_response(&mut self, response: RpcResponse) -> ProxyResult<()> {
        if let Some(existing) = &self.response {
            return Err(ProxyError::ResponseAlreadySet(existing.id));
        }
        self.response = Some(response);
        Ok(())
    }

    /// Attach the reply future that will carry this call's answer.
    pub fn attach_reply(&mut self, ticket: u64, rx: oneshot::Receiver<RpcResponse>) {
        self.reply = Some(ReplyHandle { ticket, rx });
    }

    pub fn has_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Wait for the attached reply, the upstream closing, the connection
    /// closing or `timeout`, whichever comes first.
    pub async fn wait_for_reply(&mut self, timeout: Duration) -> ProxyResult<RpcResponse> {
        let id = self.request()?.id;
        let ReplyHandle { ticket, rx } = self.reply.take().ok_or(ProxyError::MissingReplyFuture(id))?;
        let conn = self.connection()?;

        let outcome = tokio::select! {
            biased;
            reply = rx => reply.map_err(|_| ProxyError::UpstreamClosed),
            _ = conn.upstream_done().wait() => Err(conn.upstream_failure()),
            _ = conn.connection_done().wait() => Err(ProxyError::ConnectionGone),
            _ = tokio::time::sleep(timeout) => Err(ProxyError::UpstreamTimeout(timeout)),
        };

        if outcome.is_err() && conn.cancel_reply(id, ticket) {
            conn.mark_abandoned();
        }
        outcome
    }
}
