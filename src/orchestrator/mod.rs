//! Price Resolver
//!
//! Resolves a token list to USD prices in up to three steps:
//! cache lookup, independent fetchers, then dependent fetchers that use the
//! prices found so far as an oracle. Within a phase fetchers run concurrently
//! and the first one to complete wins any contested address. Nothing a fetcher
//! does can fail the call; only caller mistakes surface as errors.

use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::PriceCache;
use crate::config::ResolverConfig;
use crate::error::PricingResult;
use crate::fetchers::{FetcherKind, PriceFetcher};
use crate::types::{Chain, Price, ResolvedMap, Token};

/// Default outer timeout for a single fetcher invocation
pub const DEFAULT_FETCHER_TIMEOUT: Duration = Duration::from_secs(15);

/// Counters for one `resolve_prices` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveSummary {
    pub requested: usize,
    pub seeded: usize,
    pub cache_hits: usize,
    pub independent: usize,
    pub dependent: usize,
    pub unresolved: usize,
    pub failed_fetchers: Vec<&'static str>,
}

pub struct PriceResolver {
    cache: Arc<PriceCache>,
    independent: Vec<Arc<dyn PriceFetcher>>,
    dependent: Vec<Arc<dyn PriceFetcher>>,
    fetcher_timeout: Duration,
}

impl PriceResolver {
    pub fn new(cache: Arc<PriceCache>) -> Self {
        Self {
            cache,
            independent: Vec::new(),
            dependent: Vec::new(),
            fetcher_timeout: DEFAULT_FETCHER_TIMEOUT,
        }
    }

    pub fn from_config(cache: Arc<PriceCache>, cfg: &ResolverConfig) -> Self {
        Self::new(cache).with_fetcher_timeout(Duration::from_millis(cfg.fetcher_timeout_ms))
    }

    /// Register a fetcher; its `kind()` decides the phase it runs in.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn PriceFetcher>) -> Self {
        match fetcher.kind() {
            FetcherKind::Independent => self.independent.push(fetcher),
            FetcherKind::Dependent => self.dependent.push(fetcher),
        }
        self
    }

    pub fn with_fetcher_timeout(mut self, timeout: Duration) -> Self {
        self.fetcher_timeout = timeout;
        self
    }

    pub fn cache(&self) -> &Arc<PriceCache> {
        &self.cache
    }

    pub fn fetcher_names(&self) -> Vec<&'static str> {
        self.independent
            .iter()
            .chain(self.dependent.iter())
            .map(|f| f.name())
            .collect()
    }

    /// Resolve as many of `tokens` as possible for `chain_id`.
    ///
    /// `seed` prices are taken as already resolved and are never replaced.
    /// Unresolved tokens are simply absent from the returned map.
    pub async fn resolve_prices(
        &self,
        chain_id: u64,
        tokens: &[Token],
        seed: Option<&ResolvedMap>,
    ) -> PricingResult<ResolvedMap> {
        let (map, _) = self.resolve_with_summary(chain_id, tokens, seed).await?;
        Ok(map)
    }

    /// Same as `resolve_prices`, also returning the per-phase counters
    pub async fn resolve_with_summary(
        &self,
        chain_id: u64,
        tokens: &[Token],
        seed: Option<&ResolvedMap>,
    ) -> PricingResult<(ResolvedMap, ResolveSummary)> {
        let chain = Chain::require(chain_id)?;
        let tokens = dedup_for_chain(chain, tokens);

        let mut summary = ResolveSummary {
            requested: tokens.len(),
            ..Default::default()
        };
        let mut resolved = ResolvedMap::new();

        if let Some(seed) = seed {
            for (address, price) in seed {
                resolved.insert(*address, price.clone());
            }
            summary.seeded = tokens
                .iter()
                .filter(|t| resolved.contains_key(&t.address))
                .count();
        }

        let lookups: Vec<_> = missing(&tokens, &resolved).iter().map(|t| t.address).collect();
        let hits = self.cache.get_many(chain_id, &lookups)?;
        summary.cache_hits = hits.len();
        resolved.extend(hits);

        let pending = missing(&tokens, &resolved);
        if !pending.is_empty() {
            let (accepted, failed) = self
                .run_phase(FetcherKind::Independent, chain, &pending, &mut resolved)
                .await;
            summary.independent = accepted;
            summary.failed_fetchers.extend(failed);

            let pending = missing(&tokens, &resolved);
            if !pending.is_empty() {
                let (accepted, failed) = self
                    .run_phase(FetcherKind::Dependent, chain, &pending, &mut resolved)
                    .await;
                summary.dependent = accepted;
                summary.failed_fetchers.extend(failed);
            }
        }

        summary.unresolved = missing(&tokens, &resolved).len();
        info!(
            chain = %chain,
            requested = summary.requested,
            seeded = summary.seeded,
            cache_hits = summary.cache_hits,
            independent = summary.independent,
            dependent = summary.dependent,
            unresolved = summary.unresolved,
            failed = ?summary.failed_fetchers,
            "📥 Prices resolved"
        );

        Ok((resolved, summary))
    }

    /// Run every fetcher of `kind` against `pending` and merge in completion
    /// order. Returns the number of accepted prices and the failed fetchers.
    async fn run_phase(
        &self,
        kind: FetcherKind,
        chain: Chain,
        pending: &[Token],
        resolved: &mut ResolvedMap,
    ) -> (usize, Vec<&'static str>) {
        let fetchers = match kind {
            FetcherKind::Independent => &self.independent,
            FetcherKind::Dependent => &self.dependent,
        };

        // Dependent fetchers read a snapshot taken at phase start
        let oracle = resolved.clone();
        let wanted: HashMap<_, _> = pending
            .iter()
            .map(|t| (t.address, t.symbol.as_str()))
            .collect();

        let mut in_flight: FuturesUnordered<_> = fetchers
            .iter()
            .filter(|f| f.supports_chain(chain))
            .map(|fetcher| {
                let oracle = &oracle;
                async move {
                    let outcome = tokio::time::timeout(
                        self.fetcher_timeout,
                        fetcher.fetch_prices(chain, pending, oracle),
                    )
                    .await;
                    (fetcher.name(), outcome)
                }
            })
            .collect();

        let mut accepted = 0usize;
        let mut failed = Vec::new();

        while let Some((name, outcome)) = in_flight.next().await {
            let prices = match outcome {
                Ok(Ok(prices)) => prices,
                Ok(Err(e)) => {
                    warn!(chain = %chain, fetcher = name, phase = %kind, error = %e, "❌ Fetcher failed");
                    failed.push(name);
                    continue;
                }
                Err(_) => {
                    warn!(
                        chain = %chain,
                        fetcher = name,
                        phase = %kind,
                        timeout_ms = self.fetcher_timeout.as_millis() as u64,
                        "❌ Fetcher timed out"
                    );
                    failed.push(name);
                    continue;
                }
            };

            let mut taken = 0usize;
            for (address, price) in prices {
                let Some(symbol) = wanted.get(&address) else {
                    continue;
                };
                if resolved.contains_key(&address) {
                    continue;
                }
                let price = Price { address, ..price };
                if let Err(e) = self.cache.set(chain.id(), price.clone(), Some(*symbol)) {
                    warn!(chain = %chain, error = %e, "Failed to cache price");
                }
                resolved.insert(address, price);
                taken += 1;
            }
            debug!(chain = %chain, fetcher = name, phase = %kind, accepted = taken, "Fetcher merged");
            accepted += taken;
        }

        (accepted, failed)
    }
}

/// Tokens for `chain` with duplicate addresses removed, in input order
fn dedup_for_chain(chain: Chain, tokens: &[Token]) -> Vec<Token> {
    let mut seen = HashSet::new();
    tokens
        .iter()
        .filter(|t| {
            if t.chain_id != chain.id() {
                warn!(
                    chain = %chain,
                    token_chain = t.chain_id,
                    symbol = %t.symbol,
                    "Skipping token from another chain"
                );
                return false;
            }
            seen.insert(t.address)
        })
        .cloned()
        .collect()
}

fn missing(tokens: &[Token], resolved: &ResolvedMap) -> Vec<Token> {
    tokens
        .iter()
        .filter(|t| !resolved.contains_key(&t.address))
        .cloned()
        .collect()
}
