//! Middleware pipeline.
//!
//! # Data Flow
//! ```text
//! transport ──▶ chain[0] ──next──▶ chain[1] ──next──▶ ... ──▶ chain[n-1] (upstream)
//!
//! on_connection / on_rpc_request:      work before `next` → head first
//! on_connection_closed / on_rpc_response: work after `next` → tail first
//! ```
//!
//! # Design Decisions
//! - One capability set ([`Middleware`]) for every plugin; each hook defaults
//!   to passing straight through to `next`
//! - Delegation is explicit: a plugin that does not call `next` stops the chain
//! - New plugins are inserted at the head, so a later plugin wraps the earlier
//!   ones in both directions
//! - Admission-style stages can use the linear [`Stage`] discipline instead
//!   and be adapted with [`Linear`]

pub mod chain;
pub mod linear;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ProxyResult;
use crate::rpc::{ConnectionSession, Frame, RequestSession};

pub use chain::MiddlewareChain;
pub use linear::{Flow, Linear, Stage};

/// A pipeline plugin.
///
/// Hooks that release or observe results (`on_connection_closed`,
/// `on_rpc_response`) should call `next` before doing their own work so they
/// run innermost-first.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once when the chain starts, in chain order.
    async fn on_start(&self) -> ProxyResult<()> {
        Ok(())
    }

    async fn on_connection(&self, conn: &Arc<ConnectionSession>, next: Next<'_>) -> ProxyResult<()> {
        next.on_connection(conn).await
    }

    async fn on_connection_closed(
        &self,
        conn: &Arc<ConnectionSession>,
        next: Next<'_>,
    ) -> ProxyResult<()> {
        next.on_connection_closed(conn).await
    }

    async fn on_websocket_frame(
        &self,
        session: &mut RequestSession,
        frame: &Frame,
        next: Next<'_>,
    ) -> ProxyResult<()> {
        next.on_websocket_frame(session, frame).await
    }

    async fn on_rpc_request(&self, session: &mut RequestSession, next: Next<'_>) -> ProxyResult<()> {
        next.on_rpc_request(session).await
    }

    async fn on_rpc_response(&self, session: &mut RequestSession, next: Next<'_>) -> ProxyResult<()> {
        next.on_rpc_response(session).await
    }

    async fn process_rpc_request(
        &self,
        session: &mut RequestSession,
        next: Next<'_>,
    ) -> ProxyResult<()> {
        next.process_rpc_request(session).await
    }
}

/// The rest of the chain after the current plugin.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub(crate) fn new(rest: &'a [Arc<dyn Middleware>]) -> Self {
        Self { rest }
    }

    /// Name of the plugin that would run next, if any.
    pub fn peek(&self) -> Option<&'static str> {
        self.rest.first().map(|m| m.name())
    }

    pub async fn on_connection(self, conn: &Arc<ConnectionSession>) -> ProxyResult<()> {
        match self.rest.split_first() {
            Some((head, tail)) => head.on_connection(conn, Next::new(tail)).await,
            None => Ok(()),
        }
    }

    pub async fn on_connection_closed(self, conn: &Arc<ConnectionSession>) -> ProxyResult<()> {
        match self.rest.split_first() {
            Some((head, tail)) => head.on_connection_closed(conn, Next::new(tail)).await,
            None => Ok(()),
        }
    }

    pub async fn on_websocket_frame(
        self,
        session: &mut RequestSession,
        frame: &Frame,
    ) -> ProxyResult<()> {
        match self.rest.split_first() {
            Some((head, tail)) => head.on_websocket_frame(session, frame, Next::new(tail)).await,
            None => Ok(()),
        }
    }

    pub async fn on_rpc_request(self, session: &mut RequestSession) -> ProxyResult<()> {
        match self.rest.split_first() {
            Some((head, tail)) => head.on_rpc_request(session, Next::new(tail)).await,
            None => Ok(()),
        }
    }

    pub async fn on_rpc_response(self, session: &mut RequestSession) -> ProxyResult<()> {
        match self.rest.split_first() {
            Some((head, tail)) => head.on_rpc_response(session, Next::new(tail)).await,
            None => Ok(()),
        }
    }

    pub async fn process_rpc_request(self, session: &mut RequestSession) -> ProxyResult<()> {
        match self.rest.split_first() {
            Some((head, tail)) => head.process_rpc_request(session, Next::new(tail)).await,
            None => Ok(()),
        }
    }
}
