//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router: `GET` upgrades to WebSocket, `POST` serves one call
//! - Wire up middleware (tracing, body limits)
//! - Serve with connect info and graceful shutdown
//! - Drain open connections before returning

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::http::websocket::ws_handler;
use crate::lifecycle::Shutdown;
use crate::middleware::MiddlewareChain;
use crate::net::ConnectionTracker;
use crate::rpc::envelope::decode_request;
use crate::rpc::{codes, ConnectionSession, RequestSession, RpcError, RpcRequest, RpcResponse};

const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub chain: Arc<MiddlewareChain>,
    pub tracker: ConnectionTracker,
    pub shutdown: Shutdown,
    pub queue_capacity: usize,
    pub response_timeout: Duration,
}

/// JSON-RPC proxy front end.
pub struct ProxyServer {
    router: Router,
    state: AppState,
}

impl ProxyServer {
    pub fn new(config: &ProxyConfig, chain: Arc<MiddlewareChain>, shutdown: Shutdown) -> Self {
        let state = AppState {
            chain,
            tracker: ConnectionTracker::new(),
            shutdown,
            queue_capacity: crate::rpc::session::DEFAULT_QUEUE_CAPACITY,
            response_timeout: Duration::from_secs(config.upstream.response_timeout_secs),
        };
        let router = Self::build_router(config, state.clone());
        Self { router, state }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(config: &ProxyConfig, state: AppState) -> Router {
        Router::new()
            .route(&config.listener.path, get(ws_handler).post(http_handler))
            .with_state(state)
            .layer(DefaultBodyLimit::disable())
            .layer(RequestBodyLimitLayer::new(config.listener.max_body_bytes))
            .layer(TraceLayer::new_for_http())
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.state.tracker
    }

    /// Run the server until shutdown is triggered, then drain connections.
    pub async fn run(self, listener: TcpListener) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "Proxy server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(self.state.shutdown.signal())
            .await?;

        tracing::info!(
            active = self.state.tracker.active_count(),
            "Proxy server stopped accepting, draining connections"
        );
        if !self.state.tracker.drain(DRAIN_DEADLINE).await {
            tracing::warn!(
                remaining = self.state.tracker.active_count(),
                "Connections still open after drain deadline"
            );
        }
        Ok(())
    }
}

/// One JSON-RPC call over HTTP, served as a single-use connection.
async fn http_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    let request = match decode_request(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "Invalid rpc request");
            let error = RpcError::new(codes::INTERNAL_ERROR, format!("invalid rpc request: {e}"));
            return Json(RpcResponse::failure(0, error)).into_response();
        }
    };
    let id = request.id;

    let guard = state.tracker.track();
    let conn = ConnectionSession::new(guard.id(), Some(peer), state.queue_capacity);
    let chain = &state.chain;

    let response = match chain.on_connection(&conn).await {
        Err(e) => {
            tracing::debug!(connection_id = %conn.id(), error = %e, "Connection rejected");
            RpcResponse::failure(id, e.to_rpc_error())
        }
        Ok(()) => {
            let call = serve_call(chain, &conn, body, request);
            match tokio::time::timeout(state.response_timeout, call).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => RpcResponse::failure(id, e.to_rpc_error()),
                Err(_) => {
                    tracing::warn!(connection_id = %conn.id(), request_id = id, "Response timed out");
                    let e = ProxyError::ResponseTimeout(state.response_timeout);
                    RpcResponse::failure(id, e.to_rpc_error())
                }
            }
        }
    };

    if let Err(e) = chain.on_connection_closed(&conn).await {
        tracing::warn!(connection_id = %conn.id(), error = %e, "Connection teardown hook failed");
    }
    conn.close();
    drop(guard);

    Json(response).into_response()
}

async fn serve_call(
    chain: &MiddlewareChain,
    conn: &Arc<ConnectionSession>,
    body: Bytes,
    request: RpcRequest,
) -> ProxyResult<RpcResponse> {
    let mut session = RequestSession::for_request(conn, body, request);
    chain.on_rpc_request(&mut session).await?;
    chain.complete(&mut session).await
}
