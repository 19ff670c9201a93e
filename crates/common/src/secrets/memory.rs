use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::provider::{ProviderError, ProviderKind, SecretProvider};

/// In-process provider, also the test double for external backends.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    values: RwLock<BTreeMap<String, String>>,
    writes: AtomicUsize,
    fail_after: Option<usize>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `writes` successful writes, then reject every later one
    pub fn failing_after(writes: usize) -> Self {
        Self {
            fail_after: Some(writes),
            ..Self::default()
        }
    }

    pub fn with_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let provider = Self::default();
        {
            let mut map = provider.values.write();
            for (k, v) in values {
                map.insert(k.into(), v.into());
            }
        }
        provider
    }
}

#[async_trait]
impl SecretProvider for MemoryProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Memory
    }

    async fn get_secret(&self, key: &str) -> Result<Option<String>, ProviderError> {
        Ok(self.values.read().get(key).cloned())
    }

    async fn set_secret(&self, key: &str, value: &str) -> Result<(), ProviderError> {
        let done = self.writes.fetch_add(1, Ordering::SeqCst);
        if matches!(self.fail_after, Some(limit) if done >= limit) {
            return Err(ProviderError::Rejected(key.to_string()));
        }
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_secret(&self, key: &str) -> Result<(), ProviderError> {
        self.values.write().remove(key);
        Ok(())
    }

    async fn list_secrets(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.values.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_failing_after_limit() {
        let provider = MemoryProvider::failing_after(1);
        provider.set_secret("A", "1").await.unwrap();
        assert!(provider.set_secret("B", "2").await.is_err());
        assert_eq!(provider.list_secrets().await.unwrap(), vec!["A".to_string()]);
    }
}
