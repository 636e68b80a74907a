//! Sticky weighted upstream selection.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ProxyResult;
use crate::load_balancer::WeightedSelector;
use crate::middleware::{Middleware, Next};
use crate::rpc::ConnectionSession;

/// A candidate upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamItem {
    pub id: String,
    pub target: String,
    pub weight: i64,
}

impl UpstreamItem {
    pub fn new(id: impl Into<String>, target: impl Into<String>, weight: i64) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            weight,
        }
    }
}

/// Picks one upstream per connection when it opens.
#[derive(Debug, Default)]
pub struct LoadBalanceMiddleware {
    selector: WeightedSelector<UpstreamItem>,
}

impl LoadBalanceMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_upstream_item(&self, item: UpstreamItem) -> ProxyResult<()> {
        tracing::debug!(id = %item.id, upstream = %item.target, weight = item.weight, "Upstream registered");
        self.selector.add_node(item.weight, item)
    }

    pub fn remove_upstream_item(&self, id: &str) -> bool {
        self.selector.remove_where(|item| item.id == id) > 0
    }

    pub fn select(&self) -> ProxyResult<UpstreamItem> {
        self.selector.next()
    }

    pub fn len(&self) -> usize {
        self.selector.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selector.is_empty()
    }
}

#[async_trait]
impl Middleware for LoadBalanceMiddleware {
    fn name(&self) -> &'static str {
        "load_balance"
    }

    async fn on_start(&self) -> ProxyResult<()> {
        tracing::info!(upstreams = self.len(), "Load balancer started");
        Ok(())
    }

    async fn on_connection(&self, conn: &Arc<ConnectionSession>, next: Next<'_>) -> ProxyResult<()> {
        if conn.selected_target().is_none() {
            let item = self.select()?;
            if conn.select_target_once(item.target.clone()) {
                tracing::debug!(connection_id = %conn.id(), upstream = %item.id, url = %item.target, "Upstream selected");
            }
        }
        next.on_connection(conn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;
    use crate::middleware::MiddlewareChain;
    use crate::net::connection::ConnectionId;

    fn balancer() -> LoadBalanceMiddleware {
        let lb = LoadBalanceMiddleware::new();
        lb.add_upstream_item(UpstreamItem::new("a", "ws://a", 1)).unwrap();
        lb.add_upstream_item(UpstreamItem::new("b", "ws://b", 2)).unwrap();
        lb
    }

    #[tokio::test]
    async fn each_connection_gets_one_target() {
        let mut chain = MiddlewareChain::new();
        chain.insert_head(balancer());

        let mut targets = Vec::new();
        for _ in 0..3 {
            let conn = ConnectionSession::new(ConnectionId::new(), None, 4);
            chain.on_connection(&conn).await.unwrap();
            targets.push(conn.selected_target().unwrap().to_string());
        }
        assert_eq!(targets, vec!["ws://b", "ws://a", "ws://b"]);
    }

    #[tokio::test]
    async fn preselected_target_is_kept() {
        let mut chain = MiddlewareChain::new();
        chain.insert_head(balancer());

        let conn = ConnectionSession::new(ConnectionId::new(), None, 4);
        conn.select_target_once("ws://pinned");
        chain.on_connection(&conn).await.unwrap();
        assert_eq!(conn.selected_target().unwrap().as_str(), "ws://pinned");
    }

    #[tokio::test]
    async fn empty_pool_rejects_connection() {
        let mut chain = MiddlewareChain::new();
        chain.insert_head(LoadBalanceMiddleware::new());
        let conn = ConnectionSession::new(ConnectionId::new(), None, 4);
        assert!(matches!(chain.on_connection(&conn).await, Err(ProxyError::EmptySelector)));
    }

    #[test]
    fn rejects_bad_weight_and_removes() {
        let lb = balancer();
        assert!(lb.add_upstream_item(UpstreamItem::new("c", "ws://c", -1)).is_err());
        assert!(lb.remove_upstream_item("a"));
        assert_eq!(lb.select().unwrap().id, "b");
    }
}
