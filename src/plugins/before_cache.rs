//! Derives the cache-lookup name from leading params.
//!
//! For calls shaped like `{method: "call", params: ["realMethod", ...]}` the
//! method alone is too coarse to cache on. With
//! `fetch_cache_key_from_params_count = 2` and params `[2, "info", "hello"]`
//! the cache sees the name `call$2$"info"`.

use crate::error::ProxyResult;
use crate::middleware::{Flow, Stage};
use crate::plugins::cache::make_method_name_for_cache;
use crate::rpc::RequestSession;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeforeCacheConfigItem {
    pub method_name: String,
    pub fetch_cache_key_from_params_count: usize,
}

#[derive(Debug, Default)]
pub struct BeforeCacheStage {
    items: Vec<BeforeCacheConfigItem>,
}

impl BeforeCacheStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items asking for zero params are ignored.
    pub fn add_config_item(&mut self, item: BeforeCacheConfigItem) -> &mut Self {
        if item.fetch_cache_key_from_params_count > 0 {
            self.items.push(item);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Stage for BeforeCacheStage {
    fn name(&self) -> &'static str {
        "before_cache"
    }

    fn on_rpc_request(&self, session: &mut RequestSession) -> ProxyResult<Flow> {
        let name = {
            let request = session.request()?;
            let Some(params) = request.params_array() else {
                return Ok(Flow::Continue);
            };
            let Some(item) = self.items.iter().find(|item| {
                item.method_name == request.method
                    && params.len() >= item.fetch_cache_key_from_params_count
            }) else {
                return Ok(Flow::Continue);
            };

            let count = item.fetch_cache_key_from_params_count;
            match make_method_name_for_cache(&request.method, &params[..count]) {
                Ok(name) => name,
                Err(e) => {
                    tracing::warn!(method = %request.method, error = %e, "Failed to encode cache params");
                    return Ok(Flow::Continue);
                }
            }
        };
        session.cache_key_override = Some(name);
        Ok(Flow::Continue)
    }
}
