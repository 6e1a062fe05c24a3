use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::Result;

#[derive(Debug, Clone, Copy)]
struct CachedPrice {
    price: u64,
    fetched_at: Instant,
}

/// Last observed gas price per chain.
///
/// A price older than the TTL is never served without a refresh attempt, but
/// when that refresh fails the stale price is used instead of failing the
/// submission.
pub struct GasPriceCache {
    ttl: Duration,
    prices: RwLock<HashMap<String, CachedPrice>>,
}

impl GasPriceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            prices: RwLock::new(HashMap::new()),
        }
    }

    /// The cached price if it is still within the TTL.
    pub fn fresh(&self, chain: &str) -> Option<u64> {
        self.prices
            .read()
            .get(chain)
            .filter(|cached| cached.fetched_at.elapsed() < self.ttl)
            .map(|cached| cached.price)
    }

    /// The cached price regardless of age.
    pub fn last(&self, chain: &str) -> Option<u64> {
        self.prices.read().get(chain).map(|cached| cached.price)
    }

    pub fn store(&self, chain: &str, price: u64) {
        self.prices.write().insert(
            chain.to_string(),
            CachedPrice {
                price,
                fetched_at: Instant::now(),
            },
        );
    }

    pub async fn resolve<F, Fut>(&self, chain: &str, refresh: F) -> Result<u64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64>>,
    {
        if let Some(price) = self.fresh(chain) {
            return Ok(price);
        }

        match refresh().await {
            Ok(price) => {
                debug!(chain, gas_price = price, "gas price refreshed");
                self.store(chain, price);
                Ok(price)
            }
            Err(err) => match self.last(chain) {
                Some(stale) => {
                    warn!(chain, gas_price = stale, error = %err, "gas price refresh failed, using stale value");
                    Ok(stale)
                }
                None => Err(err),
            },
        }
    }
}
