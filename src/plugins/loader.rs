//! Turns a [`ProxyConfig`] into a ready [`MiddlewareChain`].
//!
//! Each loader inserts at the head, so the last one loaded sits closest to
//! the transport.

use std::sync::Arc;
use std::time::Duration;

use crate::config::schema::{PluginsConfig, ProxyConfig, UpstreamConfig, UpstreamKind};
use crate::error::ProxyResult;
use crate::middleware::{Linear, MiddlewareChain};
use crate::security::rate_limit::TokenBucketLimiter;

use super::{
    make_method_name_for_cache, BeforeCacheConfigItem, BeforeCacheStage, CacheConfigItem,
    CacheStage, DisableStage, HttpUpstreamMiddleware, HttpUpstreamOptions, LoadBalanceMiddleware,
    MemoryMetricStore, RateLimitStage, StatisticMiddleware, UpstreamItem, WsUpstreamMiddleware,
    WsUpstreamOptions,
};

pub fn build_chain(config: &ProxyConfig) -> ProxyResult<MiddlewareChain> {
    let mut chain = MiddlewareChain::new();
    load_upstream(&mut chain, &config.upstream)?;
    load_load_balance(&mut chain, &config.upstream)?;
    load_disable(&mut chain, &config.plugins);
    load_cache(&mut chain, &config.plugins)?;
    load_before_cache(&mut chain, &config.plugins);
    load_rate_limit(&mut chain, &config.plugins);
    load_statistic(&mut chain, &config.plugins);

    tracing::info!(chain = ?chain.names(), "Middleware chain assembled");
    Ok(chain)
}

fn live_targets(upstream: &UpstreamConfig) -> impl Iterator<Item = (usize, &str, i64)> {
    upstream
        .targets
        .iter()
        .enumerate()
        .filter(|(_, t)| !t.ignore)
        .map(|(i, t)| (i, t.url.as_str(), t.weight))
}

fn load_upstream(chain: &mut MiddlewareChain, upstream: &UpstreamConfig) -> ProxyResult<()> {
    let default_target = live_targets(upstream).next().map(|(_, url, _)| url.to_string());
    let timeout = Duration::from_secs(upstream.timeout_secs);

    match upstream.kind {
        UpstreamKind::Websocket => {
            chain.insert_head(WsUpstreamMiddleware::new(WsUpstreamOptions {
                default_target,
                timeout,
                queue_capacity: upstream.queue_capacity,
                max_links_per_target: upstream.max_links_per_target,
                acquire_timeout: Duration::from_millis(upstream.acquire_timeout_ms),
            }));
        }
        UpstreamKind::Http => {
            chain.insert_head(HttpUpstreamMiddleware::new(HttpUpstreamOptions {
                default_target,
                timeout,
            })?);
        }
    }
    Ok(())
}

fn load_load_balance(chain: &mut MiddlewareChain, upstream: &UpstreamConfig) -> ProxyResult<()> {
    let balancer = LoadBalanceMiddleware::new();
    for (i, url, weight) in live_targets(upstream) {
        balancer.add_upstream_item(UpstreamItem::new(format!("target-{i}"), url, weight))?;
    }
    if !balancer.is_empty() {
        chain.insert_head(balancer);
    }
    Ok(())
}

fn load_disable(chain: &mut MiddlewareChain, plugins: &PluginsConfig) {
    let conf = &plugins.disable;
    if !conf.enabled || conf.methods.is_empty() {
        return;
    }
    let mut stage = DisableStage::new();
    for method in &conf.methods {
        stage.add_rpc_method_to_blacklist(method.as_str());
    }
    chain.insert_head(Linear(stage));
}

fn load_cache(chain: &mut MiddlewareChain, plugins: &PluginsConfig) -> ProxyResult<()> {
    let mut stage = CacheStage::new();
    for item in plugins.cache.iter().filter(|i| i.expire_secs > 0) {
        stage.add_cache_config_item(CacheConfigItem {
            method_name: make_method_name_for_cache(&item.name, &item.params_for_cache)?,
            duration: Duration::from_secs(item.expire_secs.unsigned_abs()),
        });
    }
    if stage.has_items() {
        chain.insert_head(Linear(stage));
    }
    Ok(())
}

fn load_before_cache(chain: &mut MiddlewareChain, plugins: &PluginsConfig) {
    let mut stage = BeforeCacheStage::new();
    for item in &plugins.before_cache {
        let Ok(count) = usize::try_from(item.fetch_cache_key_from_params_count) else {
            continue;
        };
        stage.add_config_item(BeforeCacheConfigItem {
            method_name: item.method.clone(),
            fetch_cache_key_from_params_count: count,
        });
    }
    if !stage.is_empty() {
        chain.insert_head(Linear(stage));
    }
}

fn load_rate_limit(chain: &mut MiddlewareChain, plugins: &PluginsConfig) {
    let conf = &plugins.rate_limit;
    if !conf.enabled {
        return;
    }
    let window = Duration::from_millis(conf.window_ms);
    let stage = RateLimitStage::new(conf.connection_rate, window)
        .with_rpc_limiter(Arc::new(TokenBucketLimiter::new(conf.rpc_rate, window)));
    chain.insert_head(Linear(stage));
}

fn load_statistic(chain: &mut MiddlewareChain, plugins: &PluginsConfig) {
    let conf = &plugins.statistic;
    if !conf.enabled {
        return;
    }
    chain.insert_head(StatisticMiddleware::new(
        Arc::new(MemoryMetricStore::new()),
        conf.queue_capacity,
        Duration::from_secs(conf.dump_interval_secs),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn full_chain_order() {
        let config = parse_config(
            r#"
            [[upstream.targets]]
            url = "ws://127.0.0.1:8546"

            [plugins.disable]
            enabled = true
            methods = ["eth_sign"]

            [[plugins.cache]]
            name = "eth_chainId"
            expire_secs = 10

            [[plugins.before_cache]]
            method = "eth_getBalance"
            fetch_cache_key_from_params_count = 1

            [plugins.rate_limit]
            enabled = true

            [plugins.statistic]
            enabled = true
            "#,
        )
        .unwrap();

        let chain = build_chain(&config).unwrap();
        assert_eq!(
            chain.names(),
            vec![
                "statistic",
                "rate_limit",
                "before_cache",
                "cache",
                "disable",
                "load_balance",
                "ws_upstream",
            ]
        );
    }

    #[test]
    fn skips_unusable_items() {
        let config = parse_config(
            r#"
            [upstream]
            kind = "http"
            [[upstream.targets]]
            url = "http://127.0.0.1:8545"

            [plugins.disable]
            enabled = false
            methods = ["eth_sign"]

            [[plugins.cache]]
            name = "eth_chainId"
            expire_secs = 0

            [[plugins.before_cache]]
            method = "eth_getBalance"
            fetch_cache_key_from_params_count = -1
            "#,
        )
        .unwrap();

        let chain = build_chain(&config).unwrap();
        assert_eq!(chain.names(), vec!["load_balance", "http_upstream"]);
    }
}
