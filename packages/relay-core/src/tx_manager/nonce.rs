use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Next nonce to use on one chain. `None` until first read from the ledger,
/// and again after a mismatch invalidates it.
#[derive(Debug, Default)]
pub struct NonceCursor {
    next: Option<u64>,
}

impl NonceCursor {
    pub fn next(&self) -> Option<u64> {
        self.next
    }

    pub fn set(&mut self, nonce: u64) {
        self.next = Some(nonce);
    }

    /// Moves past a nonce that was accepted by the ledger.
    pub fn advance(&mut self) {
        if let Some(n) = self.next.as_mut() {
            *n += 1;
        }
    }

    pub fn invalidate(&mut self) {
        self.next = None;
    }
}

/// Per-chain nonce cursors. Each cursor sits behind its own async lock, held
/// for the whole build-sign-broadcast sequence of one submission.
#[derive(Default)]
pub struct NonceManager {
    cursors: Mutex<HashMap<String, Arc<AsyncMutex<NonceCursor>>>>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self, chain: &str) -> Arc<AsyncMutex<NonceCursor>> {
        self.cursors
            .lock()
            .entry(chain.to_string())
            .or_default()
            .clone()
    }

    /// Current cursor value, `None` if unknown or a submission holds the lock.
    pub fn peek(&self, chain: &str) -> Option<u64> {
        let cursor = self.cursors.lock().get(chain).cloned()?;
        let guard = cursor.try_lock().ok()?;
        guard.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cursor_lifecycle() {
        let nonces = NonceManager::new();
        {
            let cursor = nonces.cursor("ethereum");
            let mut cursor = cursor.lock().await;
            assert_eq!(cursor.next(), None);
            cursor.advance();
            assert_eq!(cursor.next(), None);
            cursor.set(7);
            cursor.advance();
        }
        assert_eq!(nonces.peek("ethereum"), Some(8));
        assert_eq!(nonces.peek("base"), None);

        nonces.cursor("ethereum").lock().await.invalidate();
        assert_eq!(nonces.peek("ethereum"), None);
    }

    #[tokio::test]
    async fn test_cursors_are_per_chain() {
        let nonces = NonceManager::new();
        let eth = nonces.cursor("ethereum");
        let _held = eth.lock().await;
        // a held ethereum cursor does not block base
        let base = nonces.cursor("base");
        assert!(base.try_lock().is_ok());
        assert!(Arc::ptr_eq(&eth, &nonces.cursor("ethereum")));
    }
}
