//! Ordered middleware chain.

use std::sync::Arc;

use super::{Middleware, Next};
use crate::error::{ProxyError, ProxyResult};
use crate::rpc::{codes, ConnectionSession, Frame, RequestSession, RpcError, RpcResponse};

/// Plugins in transport-to-upstream order.
#[derive(Default, Clone)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a plugin closest to the transport.
    pub fn insert_head(&mut self, middleware: impl Middleware + 'static) -> &mut Self {
        self.insert_head_arc(Arc::new(middleware))
    }

    pub fn insert_head_arc(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.middlewares.insert(0, middleware);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    fn first(&self) -> Next<'_> {
        Next::new(&self.middlewares)
    }

    /// Start every plugin in chain order. Stops on the first failure.
    pub async fn on_start(&self) -> ProxyResult<()> {
        for middleware in &self.middlewares {
            tracing::debug!(middleware = middleware.name(), "Starting middleware");
            middleware.on_start().await.inspect_err(|e| {
                tracing::error!(middleware = middleware.name(), error = %e, "Middleware failed to start");
            })?;
        }
        Ok(())
    }

    pub async fn on_connection(&self, conn: &Arc<ConnectionSession>) -> ProxyResult<()> {
        self.first().on_connection(conn).await
    }

    pub async fn on_connection_closed(&self, conn: &Arc<ConnectionSession>) -> ProxyResult<()> {
        self.first().on_connection_closed(conn).await
    }

    pub async fn on_websocket_frame(
        &self,
        session: &mut RequestSession,
        frame: &Frame,
    ) -> ProxyResult<()> {
        self.first().on_websocket_frame(session, frame).await
    }

    pub async fn on_rpc_request(&self, session: &mut RequestSession) -> ProxyResult<()> {
        self.first().on_rpc_request(session).await
    }

    pub async fn on_rpc_response(&self, session: &mut RequestSession) -> ProxyResult<()> {
        self.first().on_rpc_response(session).await
    }

    pub async fn process_rpc_request(&self, session: &mut RequestSession) -> ProxyResult<()> {
        self.first().process_rpc_request(session).await
    }

    /// Drive an admitted call to its response: process, guarantee a
    /// response exists, then run the response hooks.
    pub async fn complete(&self, session: &mut RequestSession) -> ProxyResult<RpcResponse> {
        let id = session.request()?.id;

        if let Err(e) = self.process_rpc_request(session).await {
            tracing::warn!(
                connection_id = %session.connection_id(),
                request_id = id,
                error = %e,
                "Processing rpc request failed"
            );
            if !session.has_response() {
                session.fill_response(RpcResponse::failure(id, e.to_rpc_error()))?;
            }
        }

        if !session.has_response() {
            session.fill_response(RpcResponse::failure(
                id,
                RpcError::new(codes::INTERNAL_ERROR, "no response produced"),
            ))?;
        }

        if let Err(e) = self.on_rpc_response(session).await {
            tracing::warn!(
                connection_id = %session.connection_id(),
                request_id = id,
                error = %e,
                "Response hook failed"
            );
        }

        session.response().cloned().ok_or(ProxyError::MissingReplyFuture(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{Flow, Linear, Stage};
    use crate::net::connection::ConnectionId;
    use crate::rpc::RpcRequest;
    use async_trait::async_trait;
    use axum::body::Bytes;
    use serde_json::json;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        log: Log,
    }

    impl Recorder {
        fn push(&self, event: &str) {
            self.log.lock().unwrap().push(format!("{}:{}", self.name, event));
        }
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn on_connection(&self, conn: &Arc<ConnectionSession>, next: Next<'_>) -> ProxyResult<()> {
            self.push("conn");
            next.on_connection(conn).await
        }

        async fn on_connection_closed(
            &self,
            conn: &Arc<ConnectionSession>,
            next: Next<'_>,
        ) -> ProxyResult<()> {
            next.on_connection_closed(conn).await?;
            self.push("closed");
            Ok(())
        }

        async fn on_rpc_request(&self, session: &mut RequestSession, next: Next<'_>) -> ProxyResult<()> {
            self.push("req");
            next.on_rpc_request(session).await
        }

        async fn on_rpc_response(&self, session: &mut RequestSession, next: Next<'_>) -> ProxyResult<()> {
            next.on_rpc_response(session).await?;
            self.push("resp");
            Ok(())
        }
    }

    struct Answer;

    #[async_trait]
    impl Middleware for Answer {
        fn name(&self) -> &'static str {
            "answer"
        }

        async fn process_rpc_request(
            &self,
            session: &mut RequestSession,
            next: Next<'_>,
        ) -> ProxyResult<()> {
            if !session.has_response() {
                let id = session.request()?.id;
                session.fill_response(RpcResponse::success(id, json!("pong")))?;
            }
            next.process_rpc_request(session).await
        }
    }

    struct Reject;

    #[async_trait]
    impl Middleware for Reject {
        fn name(&self) -> &'static str {
            "reject"
        }

        async fn on_rpc_request(&self, _session: &mut RequestSession, _next: Next<'_>) -> ProxyResult<()> {
            Err(ProxyError::RateLimited)
        }
    }

    struct Gate(Flow, Log);

    impl Stage for Gate {
        fn name(&self) -> &'static str {
            "gate"
        }

        fn on_rpc_request(&self, _session: &mut RequestSession) -> ProxyResult<Flow> {
            self.1.lock().unwrap().push("gate:req".into());
            Ok(self.0)
        }
    }

    fn conn() -> Arc<ConnectionSession> {
        ConnectionSession::new(ConnectionId::new(), None, 8)
    }

    fn request(conn: &Arc<ConnectionSession>) -> RequestSession {
        RequestSession::for_request(conn, Bytes::new(), RpcRequest::new(1, "ping", json!([])))
    }

    fn recorded_chain(log: &Log) -> MiddlewareChain {
        let mut chain = MiddlewareChain::new();
        chain.insert_head(Answer);
        chain.insert_head(Recorder { name: "inner", log: log.clone() });
        chain.insert_head(Recorder { name: "outer", log: log.clone() });
        chain
    }

    #[test]
    fn insert_head_prepends() {
        let log = Log::default();
        let chain = recorded_chain(&log);
        assert_eq!(chain.names(), vec!["outer", "inner", "answer"]);
    }

    #[tokio::test]
    async fn release_hooks_run_in_reverse() {
        let log = Log::default();
        let chain = recorded_chain(&log);
        let conn = conn();

        chain.on_connection(&conn).await.unwrap();
        let mut session = request(&conn);
        chain.on_rpc_request(&mut session).await.unwrap();
        let response = chain.complete(&mut session).await.unwrap();
        chain.on_connection_closed(&conn).await.unwrap();

        assert_eq!(response.result, Some(json!("pong")));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "outer:conn", "inner:conn",
                "outer:req", "inner:req",
                "inner:resp", "outer:resp",
                "inner:closed", "outer:closed",
            ]
        );
    }

    #[tokio::test]
    async fn error_aborts_remaining_stages() {
        let log = Log::default();
        let mut chain = recorded_chain(&log);
        chain.insert_head(Reject);

        let conn = conn();
        let mut session = request(&conn);
        let err = chain.on_rpc_request(&mut session).await.unwrap_err();
        assert!(matches!(err, ProxyError::RateLimited));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn linear_stop_short_circuits() {
        let log = Log::default();
        let mut chain = recorded_chain(&log);
        chain.insert_head(Linear(Gate(Flow::Stop, log.clone())));

        let conn = conn();
        let mut session = request(&conn);
        chain.on_rpc_request(&mut session).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["gate:req"]);
    }

    #[tokio::test]
    async fn linear_continue_delegates() {
        let log = Log::default();
        let mut chain = recorded_chain(&log);
        chain.insert_head(Linear(Gate(Flow::Continue, log.clone())));

        let conn = conn();
        let mut session = request(&conn);
        chain.on_rpc_request(&mut session).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["gate:req", "outer:req", "inner:req"]);
    }

    #[tokio::test]
    async fn complete_synthesizes_missing_response() {
        let chain = MiddlewareChain::new();
        let conn = conn();
        let mut session = request(&conn);
        let response = chain.complete(&mut session).await.unwrap();
        assert_eq!(response.error.unwrap().code, codes::INTERNAL_ERROR);
    }
}
