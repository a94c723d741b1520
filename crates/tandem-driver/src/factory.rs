use std::fmt;
use std::sync::Arc;

use tandem_types::StorageKey;
use tracing::debug;

use crate::error::{DriverError, DriverResult};
use crate::traits::{Driver, DriverProvider};

/// Ordered list of driver providers.
///
/// Built explicitly and handed to whatever opens stores; the first provider
/// that supports a key wins.
#[derive(Clone, Default)]
pub struct DriverFactory {
    providers: Vec<Arc<dyn DriverProvider>>,
}

impl DriverFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: Arc<dyn DriverProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn register(&mut self, provider: Arc<dyn DriverProvider>) {
        self.providers.push(provider);
    }

    pub fn will_support(&self, key: &StorageKey) -> bool {
        self.providers.iter().any(|p| p.will_support(key))
    }

    pub async fn get_driver(&self, key: &StorageKey) -> DriverResult<Arc<dyn Driver>> {
        let provider = self
            .providers
            .iter()
            .find(|p| p.will_support(key))
            .ok_or_else(|| DriverError::NoProvider(key.clone()))?;
        debug!(storage_key = %key, "opening driver");
        provider.driver(key).await
    }
}

impl fmt::Debug for DriverFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverFactory")
            .field("providers", &self.providers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volatile::{VolatileDriverProvider, VolatileMemory};

    #[tokio::test]
    async fn first_supporting_provider_wins() {
        let memory = Arc::new(VolatileMemory::new());
        let factory =
            DriverFactory::new().with_provider(Arc::new(VolatileDriverProvider::new(memory)));
        let key = StorageKey::new("volatile", "people");
        assert!(factory.will_support(&key));
        let driver = factory.get_driver(&key).await.unwrap();
        assert_eq!(driver.storage_key(), &key);
    }

    #[tokio::test]
    async fn unknown_protocol_is_an_error() {
        let factory = DriverFactory::new();
        let key = StorageKey::new("firebase", "people");
        assert!(!factory.will_support(&key));
        assert!(matches!(
            factory.get_driver(&key).await,
            Err(DriverError::NoProvider(k)) if k == key
        ));
    }
}
