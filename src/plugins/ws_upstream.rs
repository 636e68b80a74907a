//! WebSocket upstream relay.
//!
//! # Data Flow
//! ```text
//! on_rpc_request ──register_reply──▶ correlation table
//!        │
//!        └──send_upstream──▶ upstream queue ──▶ outbound pump ──▶ upstream socket
//!                                                                      │
//! process_rpc_request ◀──reply── route_reply ◀── inbound pump ◀────────┘
//!                                                   │ non-text frames
//!                                                   └──▶ downstream queue
//! ```
//!
//! # Design Decisions
//! - Links come from a per-target [`ConnPool`]; a link goes back to the pool
//!   only when the downstream closed cleanly and no call was abandoned on it
//! - The reply slot is registered before the request is written, so a fast
//!   upstream cannot answer an unknown id
//! - Idle links are checked for a buffered close before they are leased, and
//!   a link that dies before anything was written to it is redialed once
//! - Any upstream failure fires the upstream-done signal, which releases every
//!   waiter on the connection at once

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{ProxyError, ProxyResult};
use crate::middleware::{Middleware, Next};
use crate::pool::{ConnFactory, ConnPool, PoolError, Poolable, Pooled};
use crate::rpc::envelope::decode_response;
use crate::rpc::frame::CloseReason;
use crate::rpc::signal::DoneSignal;
use crate::rpc::{ConnectionSession, Frame, LinkState, RequestSession, RpcResponse};

pub type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type UpstreamSink = SplitSink<UpstreamStream, Message>;
type UpstreamSource = SplitStream<UpstreamStream>;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_LINKS_PER_TARGET: usize = 64;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// An open WebSocket to one upstream target.
#[derive(Debug)]
pub struct UpstreamLink {
    target: String,
    stream: Option<UpstreamStream>,
}

impl UpstreamLink {
    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Poolable for UpstreamLink {
    /// Drain whatever the upstream sent while the link was idle without
    /// waiting. A close, EOF or read error means the link is dead.
    fn is_alive(&mut self) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        loop {
            match stream.next().now_or_never() {
                None => return true,
                Some(None) | Some(Some(Ok(Message::Close(_)))) => {
                    tracing::debug!(upstream = %self.target, "Idle upstream link was closed by peer");
                    return false;
                }
                Some(Some(Err(e))) => {
                    tracing::debug!(upstream = %self.target, error = %e, "Idle upstream link failed");
                    return false;
                }
                Some(Some(Ok(msg))) => {
                    tracing::trace!(upstream = %self.target, len = msg.len(), "Discarding frame received while idle");
                }
            }
        }
    }

    fn close(self) {
        tracing::debug!(upstream = %self.target, "Upstream link closed");
    }
}

struct Dialer {
    target: String,
}

#[async_trait]
impl ConnFactory<UpstreamLink> for Dialer {
    async fn create(&self) -> Result<UpstreamLink, PoolError> {
        tracing::debug!(upstream = %self.target, "Dialing upstream");
        let (stream, _) = connect_async(self.target.as_str())
            .await
            .map_err(|e| PoolError::Factory(e.to_string()))?;
        tracing::debug!(upstream = %self.target, "Upstream connected");
        Ok(UpstreamLink {
            target: self.target.clone(),
            stream: Some(stream),
        })
    }
}

#[derive(Debug, Clone)]
pub struct WsUpstreamOptions {
    /// Used when no earlier plugin chose a target.
    pub default_target: Option<String>,
    /// How long a call waits for its reply.
    pub timeout: Duration,
    pub queue_capacity: usize,
    pub max_links_per_target: usize,
    pub acquire_timeout: Duration,
}

impl Default for WsUpstreamOptions {
    fn default() -> Self {
        Self {
            default_target: None,
            timeout: DEFAULT_TIMEOUT,
            queue_capacity: crate::rpc::session::DEFAULT_QUEUE_CAPACITY,
            max_links_per_target: DEFAULT_MAX_LINKS_PER_TARGET,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

/// Terminal plugin relaying calls over a WebSocket per connection.
#[derive(Debug)]
pub struct WsUpstreamMiddleware {
    options: WsUpstreamOptions,
    pools: DashMap<String, ConnPool<UpstreamLink>>,
}

impl WsUpstreamMiddleware {
    pub fn new(options: WsUpstreamOptions) -> Self {
        Self {
            options,
            pools: DashMap::new(),
        }
    }

    pub fn options(&self) -> &WsUpstreamOptions {
        &self.options
    }

    /// Idle links currently parked for `target`.
    pub fn idle_links(&self, target: &str) -> usize {
        self.pools.get(target).map(|p| p.idle_count()).unwrap_or(0)
    }

    async fn pool_for(&self, target: &str) -> ProxyResult<ConnPool<UpstreamLink>> {
        if let Some(pool) = self.pools.get(target) {
            return Ok(pool.clone());
        }
        let dialer = Dialer {
            target: target.to_string(),
        };
        let pool = ConnPool::new(self.options.max_links_per_target, 0, dialer).await?;
        Ok(self
            .pools
            .entry(target.to_string())
            .or_insert(pool)
            .clone())
    }

    fn target_for(&self, conn: &ConnectionSession) -> ProxyResult<String> {
        if let Some(target) = conn.selected_target() {
            return Ok(target.to_string());
        }
        let target = self
            .options
            .default_target
            .clone()
            .ok_or(ProxyError::NoUpstreamTarget)?;
        conn.select_target_once(target.clone());
        Ok(target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkExit {
    DownstreamClosed,
    UpstreamClosed,
    Failed,
}

/// State the two pumps of one leased link share.
#[derive(Debug, Default)]
struct LinkTurn {
    stop: DoneSignal,
    written: AtomicUsize,
}

impl LinkTurn {
    fn wrote_anything(&self) -> bool {
        self.written.load(Ordering::Acquire) > 0
    }
}

async fn run_link(
    conn: Arc<ConnectionSession>,
    pool: ConnPool<UpstreamLink>,
    mut queue: mpsc::Receiver<Frame>,
    acquire_timeout: Duration,
) {
    let mut redialed = false;
    let exit = loop {
        conn.set_link_state(LinkState::Dialing);
        let mut link = match pool.get_or_wait(acquire_timeout).await {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(connection_id = %conn.id(), error = %e, "Failed to acquire upstream link");
                conn.fail_upstream(e);
                conn.set_link_state(LinkState::Closed);
                return;
            }
        };
        let Some(stream) = link.stream.take() else {
            drop(pool.remove(link));
            conn.upstream_done().fire();
            conn.set_link_state(LinkState::Closed);
            return;
        };

        conn.set_link_state(LinkState::Connected);
        tracing::debug!(connection_id = %conn.id(), upstream = %link.target(), redialed, "Upstream link attached");

        let turn = Arc::new(LinkTurn::default());
        let (sink, source) = stream.split();
        let outbound = tokio::spawn(pump_outbound(
            Arc::clone(&conn),
            sink,
            queue,
            Arc::clone(&turn),
        ));
        let (source, exit) = pump_inbound(&conn, source, &turn).await;
        turn.stop.fire();

        let Ok((sink, returned)) = outbound.await else {
            drop(pool.remove(link));
            conn.upstream_done().fire();
            conn.set_link_state(LinkState::Closed);
            return;
        };
        queue = returned;
        let stream = sink.and_then(|sink| source.reunite(sink).ok());

        let unused = exit != LinkExit::DownstreamClosed
            && !turn.wrote_anything()
            && !conn.connection_done().is_fired()
            && !queue.is_closed();
        if unused && !redialed {
            tracing::debug!(connection_id = %conn.id(), exit = ?exit, "Upstream link died before use, redialing");
            redialed = true;
            discard(&pool, link, stream, None).await;
            continue;
        }

        conn.upstream_done().fire();
        conn.set_link_state(LinkState::Draining);

        let clean = exit == LinkExit::DownstreamClosed && conn.is_quiescent();
        match stream {
            Some(stream) if clean => {
                link.stream = Some(stream);
                tracing::debug!(connection_id = %conn.id(), "Upstream link returned to pool");
                link.close();
            }
            stream => discard(&pool, link, stream, conn.downstream_close()).await,
        }
        break exit;
    };

    conn.set_link_state(LinkState::Closed);
    tracing::debug!(connection_id = %conn.id(), exit = ?exit, "Upstream link finished");
}

/// Take a link out of the pool for good, closing it with `reason`.
async fn discard(
    pool: &ConnPool<UpstreamLink>,
    link: Pooled<UpstreamLink>,
    stream: Option<UpstreamStream>,
    reason: Option<CloseReason>,
) {
    let link = pool.remove(link);
    if let Some(mut stream) = stream {
        let frame = reason.map(CloseReason::into_upstream);
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, stream.close(frame)).await;
    }
    link.close();
}

/// Write queued frames until the queue closes or the link stops.
///
/// The queue is handed back so a redialed link can keep draining it.
async fn pump_outbound(
    conn: Arc<ConnectionSession>,
    mut sink: UpstreamSink,
    mut queue: mpsc::Receiver<Frame>,
    turn: Arc<LinkTurn>,
) -> (Option<UpstreamSink>, mpsc::Receiver<Frame>) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = turn.stop.wait() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        turn.written.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = sink.send(frame.into_upstream()).await {
            tracing::warn!(connection_id = %conn.id(), error = %e, "Upstream write failed");
            turn.stop.fire();
            return (None, queue);
        }
    }
    (Some(sink), queue)
}

/// Route replies to their waiters and relay control frames downstream.
///
/// A close on a link nothing was written to yet belongs to the link, not to
/// this connection, and is not relayed.
async fn pump_inbound(
    conn: &ConnectionSession,
    mut source: UpstreamSource,
    turn: &LinkTurn,
) -> (UpstreamSource, LinkExit) {
    let exit = loop {
        let msg = tokio::select! {
            biased;
            _ = conn.connection_done().wait() => break LinkExit::DownstreamClosed,
            _ = turn.stop.wait() => break LinkExit::Failed,
            msg = source.next() => msg,
        };

        let frame = match msg {
            None => break LinkExit::UpstreamClosed,
            Some(Err(e)) => {
                tracing::warn!(connection_id = %conn.id(), error = %e, "Upstream read failed");
                break LinkExit::Failed;
            }
            Some(Ok(msg)) => match Frame::from_upstream(msg) {
                Some(frame) => frame,
                None => continue,
            },
        };

        match frame {
            Frame::Text(text) => match decode_response(text.as_bytes()) {
                Ok(response) => {
                    conn.route_reply(response);
                }
                Err(e) => {
                    tracing::warn!(connection_id = %conn.id(), error = %e, "Malformed upstream envelope");
                    break LinkExit::Failed;
                }
            },
            frame if frame.is_close() && !turn.wrote_anything() => {
                tracing::debug!(connection_id = %conn.id(), "Unused upstream link closed by peer");
                break LinkExit::UpstreamClosed;
            }
            frame => {
                let closing = frame.is_close();
                if conn.send_downstream(frame).await.is_err() {
                    break LinkExit::DownstreamClosed;
                }
                if closing {
                    break LinkExit::UpstreamClosed;
                }
            }
        }
    };
    (source, exit)
}

#[async_trait]
impl Middleware for WsUpstreamMiddleware {
    fn name(&self) -> &'static str {
        "ws_upstream"
    }

    async fn on_connection(&self, conn: &Arc<ConnectionSession>, next: Next<'_>) -> ProxyResult<()> {
        let target = self.target_for(conn)?;
        let pool = self.pool_for(&target).await?;
        let queue = conn.attach_upstream_queue(self.options.queue_capacity)?;
        tokio::spawn(run_link(
            Arc::clone(conn),
            pool,
            queue,
            self.options.acquire_timeout,
        ));
        next.on_connection(conn).await
    }

    async fn on_connection_closed(
        &self,
        conn: &Arc<ConnectionSession>,
        next: Next<'_>,
    ) -> ProxyResult<()> {
        next.on_connection_closed(conn).await?;
        conn.close_upstream_queue();
        Ok(())
    }

    async fn on_websocket_frame(
        &self,
        session: &mut RequestSession,
        frame: &Frame,
        next: Next<'_>,
    ) -> ProxyResult<()> {
        // Close is not relayed while the link may go back to the pool. The
        // reason is kept for when the link is torn down instead.
        if let Frame::Close(reason) = frame {
            session.connection()?.record_downstream_close(reason.clone());
        } else if frame.is_passthrough() {
            let conn = session.connection()?;
            if let Err(e) = conn.send_upstream(frame.clone()).await {
                tracing::debug!(connection_id = %conn.id(), kind = frame.kind(), error = %e, "Frame not relayed upstream");
            }
        }
        next.on_websocket_frame(session, frame).await
    }

    async fn on_rpc_request(&self, session: &mut RequestSession, next: Next<'_>) -> ProxyResult<()> {
        if !session.has_response() {
            let conn = session.connection()?;
            let request = session.request()?;
            let id = request.id;
            let text = match std::str::from_utf8(session.request_bytes()) {
                Ok(text) if !text.is_empty() => text.to_owned(),
                _ => serde_json::to_string(request)?,
            };

            let (ticket, rx) = conn.register_reply(id);
            session.attach_reply(ticket, rx);
            if let Err(e) = conn.send_upstream(Frame::Text(text)).await {
                conn.cancel_reply(id, ticket);
                tracing::debug!(connection_id = %conn.id(), request_id = id, error = %e, "Request not sent upstream");
                session.fill_response(RpcResponse::failure(id, e.to_rpc_error()))?;
            }
        }
        next.on_rpc_request(session).await
    }

    async fn process_rpc_request(
        &self,
        session: &mut RequestSession,
        next: Next<'_>,
    ) -> ProxyResult<()> {
        if !session.has_response() {
            let id = session.request()?.id;
            let response = match session.wait_for_reply(self.options.timeout).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!(connection_id = %session.connection_id(), request_id = id, error = %e, "No upstream reply");
                    RpcResponse::failure(id, e.to_rpc_error())
                }
            };
            session.fill_response(response)?;
        }
        next.process_rpc_request(session).await
    }
}
