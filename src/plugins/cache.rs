//! Response cache keyed by method name and params.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

use crate::error::ProxyResult;
use crate::middleware::{Flow, Stage};
use crate::observability::metrics;
use crate::rpc::{RequestSession, RpcResponse};

const PURGE_INTERVAL: Duration = Duration::from_secs(30);

/// Build the name a cache item matches on: `method$param1$param2...`,
/// each param rendered as JSON.
pub fn make_method_name_for_cache(method: &str, params: &[Value]) -> serde_json::Result<String> {
    let mut name = method.to_string();
    for param in params {
        name.push('$');
        name.push_str(&serde_json::to_string(param)?);
    }
    Ok(name)
}

fn cache_key(name: &str, params: &Value) -> serde_json::Result<String> {
    Ok(format!("cache_rpc_{}${}", name, serde_json::to_string(params)?))
}

/// One cacheable method and how long its answers stay valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfigItem {
    pub method_name: String,
    pub duration: Duration,
}

#[derive(Debug)]
struct CachedResponse {
    response: RpcResponse,
    expires_at: Instant,
}

type Store = DashMap<String, CachedResponse>;

/// Serves repeated calls from memory.
#[derive(Debug, Default)]
pub struct CacheStage {
    items: HashMap<String, Duration>,
    store: Arc<Store>,
}

impl CacheStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cache_config_item(&mut self, item: CacheConfigItem) -> &mut Self {
        self.items.insert(item.method_name, item.duration);
        self
    }

    /// Whether any method is configured as cacheable.
    pub fn has_items(&self) -> bool {
        !self.items.is_empty()
    }

    /// Cached entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        purge(&self.store)
    }

    /// Cache key and TTL for this call, if its method is cacheable.
    fn lookup_key(&self, session: &RequestSession) -> ProxyResult<Option<(String, Duration)>> {
        let Some(name) = session.method_for_cache() else {
            return Ok(None);
        };
        let Some(ttl) = self.items.get(name) else {
            return Ok(None);
        };
        let key = cache_key(name, &session.request()?.params)?;
        Ok(Some((key, *ttl)))
    }

    fn get(&self, key: &str) -> Option<RpcResponse> {
        let now = Instant::now();
        let hit = self.store.get(key).map(|entry| {
            (entry.expires_at > now).then(|| entry.response.clone())
        })?;
        if hit.is_none() {
            self.store.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        hit
    }
}

fn purge(store: &Store) -> usize {
    let now = Instant::now();
    let before = store.len();
    store.retain(|_, entry| entry.expires_at > now);
    before.saturating_sub(store.len())
}

impl Stage for CacheStage {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn on_start(&self) -> ProxyResult<()> {
        let store: Weak<Store> = Arc::downgrade(&self.store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PURGE_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else { break };
                let removed = purge(&store);
                if removed > 0 {
                    tracing::debug!(removed, "Purged expired cache entries");
                }
            }
        });
        Ok(())
    }

    fn on_rpc_request(&self, session: &mut RequestSession) -> ProxyResult<Flow> {
        let Some((key, _)) = self.lookup_key(session)? else {
            return Ok(Flow::Continue);
        };
        let Some(cached) = self.get(&key) else {
            return Ok(Flow::Continue);
        };

        let id = session.request()?.id;
        session.fill_response(cached.with_id(id))?;
        session.response_set_by_cache = true;

        let name = session.method_for_cache().unwrap_or_default();
        metrics::record_cache_hit(name);
        tracing::debug!(connection_id = %session.connection_id(), request_id = id, method = name, "Cache hit");
        Ok(Flow::Stop)
    }

    fn process_rpc_request(&self, session: &mut RequestSession) -> ProxyResult<Flow> {
        Ok(if session.response_set_by_cache { Flow::Stop } else { Flow::Continue })
    }

    fn on_rpc_response(&self, session: &mut RequestSession) -> ProxyResult<()> {
        if session.response_set_by_cache {
            return Ok(());
        }
        let Some(response) = session.response().filter(|r| !r.is_error()) else {
            return Ok(());
        };
        let Some((key, ttl)) = self.lookup_key(session)? else {
            return Ok(());
        };

        self.store.insert(
            key,
            CachedResponse {
                response: response.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        tracing::debug!(connection_id = %session.connection_id(), method = session.method_for_cache().unwrap_or_default(), "Cached response");
        Ok(())
    }
}
