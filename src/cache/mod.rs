//! Adaptive TTL price cache
//!
//! Prices are keyed by `(chain id, address)` and kept for a duration that
//! depends on the token's volatility class. Stale entries are evicted lazily
//! on read and by a periodic sweep.

mod classify;

pub use classify::{classify_token, ClassifyInput, Classifier, TokenClass};

use ethers::types::Address;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::{PricingError, PricingResult};
use crate::types::{Chain, Price, ResolvedMap};

/// Default TTLs per token class
pub const TTL_STABLECOIN: Duration = Duration::from_secs(5 * 60);
pub const TTL_MAJOR: Duration = Duration::from_secs(60);
pub const TTL_DERIVED: Duration = Duration::from_secs(30);
pub const TTL_OTHER: Duration = Duration::from_secs(2 * 60);

/// Floor for the background sweep period
pub const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Freshness policy, one TTL per class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub stablecoin: Duration,
    pub major: Duration,
    pub derived: Duration,
    pub other: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            stablecoin: TTL_STABLECOIN,
            major: TTL_MAJOR,
            derived: TTL_DERIVED,
            other: TTL_OTHER,
        }
    }
}

impl CacheTtls {
    pub fn for_class(&self, class: TokenClass) -> Duration {
        match class {
            TokenClass::Stablecoin => self.stablecoin,
            TokenClass::Major => self.major,
            TokenClass::Derived => self.derived,
            TokenClass::Other => self.other,
        }
    }

    fn validate(&self) -> PricingResult<()> {
        for (class, ttl) in [
            (TokenClass::Stablecoin, self.stablecoin),
            (TokenClass::Major, self.major),
            (TokenClass::Derived, self.derived),
            (TokenClass::Other, self.other),
        ] {
            if ttl.is_zero() {
                return Err(PricingError::Config(format!("{} TTL must be > 0", class)));
            }
        }
        Ok(())
    }
}

impl From<&CacheConfig> for CacheTtls {
    fn from(cfg: &CacheConfig) -> Self {
        Self {
            stablecoin: Duration::from_secs(cfg.ttl_stablecoin_secs),
            major: Duration::from_secs(cfg.ttl_major_secs),
            derived: Duration::from_secs(cfg.ttl_derived_secs),
            other: Duration::from_secs(cfg.ttl_other_secs),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedPrice {
    price: Price,
    stored_at: Instant,
    ttl: Duration,
    class: TokenClass,
}

impl CachedPrice {
    fn is_fresh_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) <= self.ttl
    }
}

/// Snapshot of one cache entry's bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntryInfo {
    pub class: TokenClass,
    pub ttl: Duration,
    pub age: Duration,
}

type CacheKey = (u64, Address);

/// Process-wide price cache. Share it behind an `Arc`.
pub struct PriceCache {
    entries: RwLock<HashMap<CacheKey, CachedPrice>>,
    ttls: CacheTtls,
    classifier: Classifier,
}

impl PriceCache {
    pub fn new(ttls: CacheTtls) -> PricingResult<Self> {
        ttls.validate()?;
        Ok(Self {
            entries: RwLock::new(HashMap::new()),
            ttls,
            classifier: classify_token,
        })
    }

    pub fn from_config(cfg: &CacheConfig) -> PricingResult<Self> {
        Self::new(CacheTtls::from(cfg))
    }

    /// Replace the classification policy
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn ttls(&self) -> &CacheTtls {
        &self.ttls
    }

    /// Fresh price for one token. A stale entry is removed and reported absent.
    pub fn get(&self, chain_id: u64, address: &Address) -> PricingResult<Option<Price>> {
        Chain::require(chain_id)?;
        let key = (chain_id, *address);
        let now = Instant::now();

        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(&key) {
                None => return Ok(None),
                Some(entry) if entry.is_fresh_at(now) => return Ok(Some(entry.price.clone())),
                Some(_) => {}
            }
        }

        // Re-check under the write lock: the entry may have been refreshed meanwhile.
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get(&key) {
            Some(entry) if entry.is_fresh_at(now) => Ok(Some(entry.price.clone())),
            Some(_) => {
                entries.remove(&key);
                debug!(chain_id, address = ?address, "Evicted stale cache entry");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Fresh prices for the given tokens; misses are simply absent.
    pub fn get_many(&self, chain_id: u64, addresses: &[Address]) -> PricingResult<ResolvedMap> {
        Chain::require(chain_id)?;
        let mut hits = ResolvedMap::with_capacity(addresses.len());
        for address in addresses {
            if let Some(price) = self.get(chain_id, address)? {
                hits.insert(*address, price);
            }
        }
        Ok(hits)
    }

    /// Store a price under its own address. Returns the class that picked the TTL.
    pub fn set(
        &self,
        chain_id: u64,
        price: Price,
        symbol: Option<&str>,
    ) -> PricingResult<TokenClass> {
        Chain::require(chain_id)?;
        let class = (self.classifier)(&ClassifyInput {
            address: &price.address,
            symbol,
            source: &price.source,
        });
        let entry = CachedPrice {
            ttl: self.ttls.for_class(class),
            stored_at: Instant::now(),
            class,
            price,
        };

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert((chain_id, entry.price.address), entry);
        Ok(class)
    }

    /// Store several prices at once, looking symbols up by address.
    pub fn set_many(
        &self,
        chain_id: u64,
        prices: &ResolvedMap,
        symbols: &HashMap<Address, String>,
    ) -> PricingResult<usize> {
        Chain::require(chain_id)?;
        for price in prices.values() {
            let symbol = symbols.get(&price.address).map(String::as_str);
            self.set(chain_id, price.clone(), symbol)?;
        }
        Ok(prices.len())
    }

    /// Bookkeeping for an entry, fresh or not
    pub fn entry_info(&self, chain_id: u64, address: &Address) -> Option<CacheEntryInfo> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(&(chain_id, *address)).map(|entry| CacheEntryInfo {
            class: entry.class,
            ttl: entry.ttl,
            age: Instant::now().saturating_duration_since(entry.stored_at),
        })
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh_at(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `cleanup` every `interval` until the cache is dropped.
    /// Intervals shorter than one second are raised to one second.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = interval.max(MIN_CLEANUP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.cleanup();
                if removed > 0 {
                    debug!(removed, remaining = cache.len(), "Cache sweep");
                }
            }
        })
    }
}
