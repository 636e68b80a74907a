//! Linear short-circuit stages.
//!
//! A [`Stage`] never sees `next`. It answers [`Flow::Continue`] or
//! [`Flow::Stop`] and [`Linear`] decides whether the rest of the chain runs.
//! Release-side hooks (`on_connection_closed`, `on_rpc_response`) always let
//! the rest of the chain run first and cannot stop it.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Middleware, Next};
use crate::error::ProxyResult;
use crate::rpc::{ConnectionSession, Frame, RequestSession};

/// Outcome of a linear stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Admission-style pipeline stage.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_start(&self) -> ProxyResult<()> {
        Ok(())
    }

    fn on_connection(&self, _conn: &Arc<ConnectionSession>) -> ProxyResult<Flow> {
        Ok(Flow::Continue)
    }

    fn on_connection_closed(&self, _conn: &Arc<ConnectionSession>) -> ProxyResult<()> {
        Ok(())
    }

    fn on_websocket_frame(&self, _session: &mut RequestSession, _frame: &Frame) -> ProxyResult<Flow> {
        Ok(Flow::Continue)
    }

    fn on_rpc_request(&self, _session: &mut RequestSession) -> ProxyResult<Flow> {
        Ok(Flow::Continue)
    }

    fn on_rpc_response(&self, _session: &mut RequestSession) -> ProxyResult<()> {
        Ok(())
    }

    fn process_rpc_request(&self, _session: &mut RequestSession) -> ProxyResult<Flow> {
        Ok(Flow::Continue)
    }
}

/// Runs a [`Stage`] inside the delegating chain.
#[derive(Debug)]
pub struct Linear<S>(pub S);

impl<S> Linear<S> {
    pub fn inner(&self) -> &S {
        &self.0
    }
}

#[async_trait]
impl<S: Stage> Middleware for Linear<S> {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    async fn on_start(&self) -> ProxyResult<()> {
        self.0.on_start()
    }

    async fn on_connection(&self, conn: &Arc<ConnectionSession>, next: Next<'_>) -> ProxyResult<()> {
        match self.0.on_connection(conn)? {
            Flow::Continue => next.on_connection(conn).await,
            Flow::Stop => Ok(()),
        }
    }

    async fn on_connection_closed(
        &self,
        conn: &Arc<ConnectionSession>,
        next: Next<'_>,
    ) -> ProxyResult<()> {
        let downstream = next.on_connection_closed(conn).await;
        self.0.on_connection_closed(conn)?;
        downstream
    }

    async fn on_websocket_frame(
        &self,
        session: &mut RequestSession,
        frame: &Frame,
        next: Next<'_>,
    ) -> ProxyResult<()> {
        match self.0.on_websocket_frame(session, frame)? {
            Flow::Continue => next.on_websocket_frame(session, frame).await,
            Flow::Stop => Ok(()),
        }
    }

    async fn on_rpc_request(&self, session: &mut RequestSession, next: Next<'_>) -> ProxyResult<()> {
        match self.0.on_rpc_request(session)? {
            Flow::Continue => next.on_rpc_request(session).await,
            Flow::Stop => Ok(()),
        }
    }

    async fn on_rpc_response(&self, session: &mut RequestSession, next: Next<'_>) -> ProxyResult<()> {
        next.on_rpc_response(session).await?;
        self.0.on_rpc_response(session)
    }

    async fn process_rpc_request(
        &self,
        session: &mut RequestSession,
        next: Next<'_>,
    ) -> ProxyResult<()> {
        match self.0.process_rpc_request(session)? {
            Flow::Continue => next.process_rpc_request(session).await,
            Flow::Stop => Ok(()),
        }
    }
}
