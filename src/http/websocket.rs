//! Persistent WebSocket provider.
//!
//! # Data Flow
//! ```text
//! client frames ──▶ read loop ──▶ on_websocket_frame
//!                       │ text
//!                       ▼
//!                decode ──▶ on_rpc_request ──▶ spawn(complete) ──┐
//!                                                               ▼
//! client ◀── writer task ◀────────────── downstream queue ◀── encode
//! ```
//!
//! # Design Decisions
//! - Calls on one connection complete concurrently; replies are written in
//!   completion order, not request order
//! - The writer owns the socket sink; everything else writes through the
//!   bounded downstream queue
//! - Every failure is answered with a structured error response

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::http::server::AppState;
use crate::middleware::MiddlewareChain;
use crate::rpc::envelope::{decode_request, encode_response};
use crate::rpc::frame::CloseReason;
use crate::rpc::{codes, ConnectionSession, Frame, RequestSession, RpcError, RpcResponse};

const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| serve_connection(socket, peer, state))
}

/// Serve one upgraded connection until either side closes or shutdown.
pub async fn serve_connection(socket: WebSocket, peer: SocketAddr, state: AppState) {
    let guard = state.tracker.track();
    let conn = ConnectionSession::new(guard.id(), Some(peer), state.queue_capacity);
    tracing::debug!(connection_id = %conn.id(), peer = %peer, "WebSocket connection opened");

    let (mut sink, mut stream) = socket.split();

    if let Err(e) = state.chain.on_connection(&conn).await {
        tracing::warn!(connection_id = %conn.id(), error = %e, "Connection rejected");
        let close = Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: e.to_string().into(),
        }));
        let _ = sink.send(close).await;
        finish(&state.chain, &conn).await;
        return;
    }

    let Some(queue) = conn.take_downstream_receiver() else {
        tracing::error!(connection_id = %conn.id(), "Downstream queue already taken");
        finish(&state.chain, &conn).await;
        return;
    };
    let writer = tokio::spawn(write_downstream(Arc::clone(&conn), sink, queue));

    let shutdown = state.shutdown.signal();
    tokio::pin!(shutdown);

    loop {
        let msg = tokio::select! {
            _ = &mut shutdown => {
                let going_away = Frame::Close(Some(CloseReason {
                    code: close_code::AWAY,
                    reason: "server shutting down".into(),
                }));
                let _ = conn.send_downstream(going_away).await;
                break;
            }
            _ = conn.connection_done().wait() => break,
            msg = stream.next() => msg,
        };

        let frame = match msg {
            Some(Ok(msg)) => Frame::from(msg),
            Some(Err(e)) => {
                tracing::debug!(connection_id = %conn.id(), error = %e, "WebSocket read failed");
                break;
            }
            None => break,
        };

        if !handle_frame(&state.chain, &conn, frame).await {
            break;
        }
    }

    finish(&state.chain, &conn).await;
    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
        tracing::debug!(connection_id = %conn.id(), "Writer did not flush in time");
    }
    tracing::debug!(connection_id = %conn.id(), "WebSocket connection closed");
    drop(guard);
}

async fn finish(chain: &MiddlewareChain, conn: &Arc<ConnectionSession>) {
    if let Err(e) = chain.on_connection_closed(conn).await {
        tracing::warn!(connection_id = %conn.id(), error = %e, "Connection teardown hook failed");
    }
    conn.close();
}

/// Drain the downstream queue into the socket. Ends once every sender is gone.
async fn write_downstream(
    conn: Arc<ConnectionSession>,
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<Frame>,
) {
    while let Some(frame) = queue.recv().await {
        let closing = frame.is_close();
        if let Err(e) = sink.send(Message::from(frame)).await {
            tracing::debug!(connection_id = %conn.id(), error = %e, "WebSocket write failed");
            conn.close();
            return;
        }
        if closing {
            conn.close();
            return;
        }
    }
    let _ = sink.close().await;
}

/// Returns `false` once the connection should stop reading.
async fn handle_frame(chain: &Arc<MiddlewareChain>, conn: &Arc<ConnectionSession>, frame: Frame) -> bool {
    let mut session = RequestSession::new(conn);
    if let Err(e) = chain.on_websocket_frame(&mut session, &frame).await {
        tracing::debug!(connection_id = %conn.id(), kind = frame.kind(), error = %e, "Frame hook failed");
    }

    let text = match frame {
        Frame::Close(_) => return false,
        Frame::Text(text) => text,
        _ => return true,
    };

    let request = match decode_request(text.as_bytes()) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(connection_id = %conn.id(), error = %e, "Invalid rpc request");
            let error = RpcError::new(codes::INTERNAL_ERROR, format!("invalid rpc request: {e}"));
            reply(conn, RpcResponse::failure(0, error)).await;
            return true;
        }
    };
    let id = request.id;
    session.set_request(Bytes::from(text), request);

    if let Err(e) = chain.on_rpc_request(&mut session).await {
        tracing::debug!(connection_id = %conn.id(), request_id = id, error = %e, "Rpc request rejected");
        reply(conn, RpcResponse::failure(id, e.to_rpc_error())).await;
        return true;
    }

    let chain = Arc::clone(chain);
    let conn = Arc::clone(conn);
    tokio::spawn(async move {
        let response = match chain.complete(&mut session).await {
            Ok(response) => response,
            Err(e) => RpcResponse::failure(id, e.to_rpc_error()),
        };
        reply(&conn, response).await;
    });
    true
}

async fn reply(conn: &ConnectionSession, response: RpcResponse) {
    match encode_response(&response) {
        Ok(text) => {
            if let Err(e) = conn.send_downstream(Frame::Text(text)).await {
                tracing::debug!(connection_id = %conn.id(), request_id = response.id, error = %e, "Reply dropped");
            }
        }
        Err(e) => {
            tracing::error!(connection_id = %conn.id(), request_id = response.id, error = %e, "Failed to encode reply");
        }
    }
}
