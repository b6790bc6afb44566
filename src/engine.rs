//! Pricing engine
//!
//! Wires the cache, the call batcher, the fetchers and the resolver together
//! from an `AppConfig`. Must be built inside a tokio runtime.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::batching::abi::ReadFunctions;
use crate::batching::{BatchSettings, CallBatcher, Multicall3Reader, QueueStats};
use crate::cache::PriceCache;
use crate::config::AppConfig;
use crate::error::PricingResult;
use crate::fetchers::{ChainlinkFetcher, DefiLlamaFetcher, Erc4626Fetcher, UniswapV2LpFetcher};
use crate::orchestrator::PriceResolver;
use crate::types::{ResolvedMap, Token};

pub struct PricingEngine {
    cache: Arc<PriceCache>,
    batcher: Arc<CallBatcher>,
    resolver: PriceResolver,
    sweeper: JoinHandle<()>,
}

impl PricingEngine {
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        cfg.validate()?;

        let cache = Arc::new(PriceCache::from_config(&cfg.cache)?);
        let sweeper = cache.spawn_cleanup(Duration::from_secs(cfg.cache.cleanup_interval_secs));

        let mut batcher = CallBatcher::new(BatchSettings::from(&cfg.batching))?;
        for chain in &cfg.chains {
            let reader = Multicall3Reader::connect(&chain.rpc_url, chain.multicall_address.as_deref())
                .with_context(|| format!("Failed to set up reader for chain {}", chain.chain_id))?;
            batcher.register_chain(chain.chain_id, Arc::new(reader))?;
        }
        let batcher = Arc::new(batcher);

        let fns = ReadFunctions::load()?;
        let mut resolver = PriceResolver::from_config(Arc::clone(&cache), &cfg.resolver);

        if cfg.defillama.enabled {
            resolver = resolver.with_fetcher(Arc::new(DefiLlamaFetcher::new(&cfg.defillama)?));
        }
        if cfg.chainlink.enabled && !cfg.chainlink.feeds.is_empty() {
            let chainlink =
                ChainlinkFetcher::from_config(Arc::clone(&batcher), fns.clone(), &cfg.chainlink)?;
            resolver = resolver.with_fetcher(Arc::new(chainlink));
        }
        resolver = resolver
            .with_fetcher(Arc::new(Erc4626Fetcher::new(Arc::clone(&batcher), fns.clone())))
            .with_fetcher(Arc::new(UniswapV2LpFetcher::new(Arc::clone(&batcher), fns)));

        info!(
            config = %cfg,
            fetchers = ?resolver.fetcher_names(),
            "✅ Pricing engine ready"
        );

        Ok(Self {
            cache,
            batcher,
            resolver,
            sweeper,
        })
    }

    pub async fn resolve_prices(
        &self,
        chain_id: u64,
        tokens: &[Token],
        seed: Option<&ResolvedMap>,
    ) -> PricingResult<ResolvedMap> {
        self.resolver.resolve_prices(chain_id, tokens, seed).await
    }

    pub fn resolver(&self) -> &PriceResolver {
        &self.resolver
    }

    pub fn cache(&self) -> &Arc<PriceCache> {
        &self.cache
    }

    pub fn batcher(&self) -> &Arc<CallBatcher> {
        &self.batcher
    }

    pub fn queue_stats(&self, chain_id: u64) -> PricingResult<QueueStats> {
        self.batcher.stats(chain_id)
    }
}

impl Drop for PricingEngine {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}
