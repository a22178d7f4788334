//! Device context: platform identifiers attached to every event.
//!
//! Identifier retrieval belongs to the host platform and is injected through
//! [`DeviceContextProvider`]. [`DeviceContext`] layers the caching and
//! parameter-naming policy on top of it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::config::DeviceConfig;
use crate::platform::PlatformAdapter;
use crate::types::EventParameters;

/// Completion of an advertising identifier request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdvertisingId {
    pub id: String,
    pub tracking_enabled: bool,
    pub error: Option<String>,
}

/// Source of platform identifiers.
#[async_trait]
pub trait DeviceContextProvider: Send + Sync {
    /// Request the advertising identifier.
    ///
    /// Resolves when the platform completes the request. Returns `None` when
    /// the platform cannot supply an advertising identifier at all.
    async fn fetch_advertising_id(&self) -> Option<AdvertisingId>;

    /// iOS identifier for vendor
    fn vendor_identifier(&self) -> Option<String> {
        None
    }

    /// Android device unique identifier
    fn device_unique_identifier(&self) -> Option<String> {
        None
    }
}

/// Provider backed by fixed identifiers.
#[derive(Debug, Clone, Default)]
pub struct StaticDeviceProvider {
    vendor_id: Option<String>,
    device_id: Option<String>,
    advertising_id: Option<String>,
    tracking_enabled: bool,
}

impl StaticDeviceProvider {
    pub fn new() -> Self {
        Self {
            tracking_enabled: true,
            ..Default::default()
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            vendor_id: config.vendor_id.clone(),
            device_id: config.device_id.clone(),
            advertising_id: config.advertising_id.clone(),
            tracking_enabled: config.tracking_enabled,
        }
    }

    pub fn with_vendor_id(mut self, id: impl Into<String>) -> Self {
        self.vendor_id = Some(id.into());
        self
    }

    pub fn with_device_id(mut self, id: impl Into<String>) -> Self {
        self.device_id = Some(id.into());
        self
    }

    pub fn with_advertising_id(mut self, id: impl Into<String>) -> Self {
        self.advertising_id = Some(id.into());
        self
    }
}

#[async_trait]
impl DeviceContextProvider for StaticDeviceProvider {
    async fn fetch_advertising_id(&self) -> Option<AdvertisingId> {
        self.advertising_id.as_ref().map(|id| AdvertisingId {
            id: id.clone(),
            tracking_enabled: self.tracking_enabled,
            error: None,
        })
    }

    fn vendor_identifier(&self) -> Option<String> {
        self.vendor_id.clone()
    }

    fn device_unique_identifier(&self) -> Option<String> {
        self.device_id.clone()
    }
}

/// Resolves and caches device identifiers for event enrichment.
///
/// The advertising identifier is cached for the lifetime of this value once a
/// non-empty one is obtained. Empty results are not cached, so the next event
/// asks the provider again.
pub struct DeviceContext {
    provider: Arc<dyn DeviceContextProvider>,
    platform: Arc<dyn PlatformAdapter>,
    advertising_id: OnceCell<String>,
    fetch_timeout: Option<Duration>,
}

impl DeviceContext {
    pub fn new(
        provider: Arc<dyn DeviceContextProvider>,
        platform: Arc<dyn PlatformAdapter>,
    ) -> Self {
        Self {
            provider,
            platform,
            advertising_id: OnceCell::new(),
            fetch_timeout: None,
        }
    }

    /// Bound the wait for the provider's advertising-id completion.
    pub fn with_fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Returns the advertising identifier, fetching it if not yet cached.
    pub async fn advertising_id(&self) -> Option<String> {
        self.advertising_id
            .get_or_try_init(|| self.fetch_advertising_id())
            .await
            .ok()
            .cloned()
    }

    async fn fetch_advertising_id(&self) -> Result<String, ()> {
        let fetch = self.provider.fetch_advertising_id();
        let response = match self.fetch_timeout {
            Some(limit) => match tokio::time::timeout(limit, fetch).await {
                Ok(response) => response,
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = limit.as_millis() as u64,
                        "Advertising ID request timed out"
                    );
                    return Err(());
                }
            },
            None => fetch.await,
        };

        let Some(response) = response else {
            tracing::warn!("Advertising ID is not available");
            return Err(());
        };

        if let Some(error) = &response.error {
            tracing::warn!(error = %error, "Advertising ID request reported an error");
        }
        if !response.tracking_enabled {
            tracing::debug!("Advertising tracking is disabled on this device");
        }

        if response.id.is_empty() {
            Err(())
        } else {
            Ok(response.id)
        }
    }

    /// Add device identifiers to a parameter set.
    ///
    /// The platform device id is added when non-empty; the advertising id is
    /// added only if non-empty once the fetch resolves.
    pub async fn enrich(&self, params: &mut EventParameters) {
        if let Some((key, id)) = self.platform.device_id(self.provider.as_ref()) {
            params.insert(key, id);
        }

        if let Some(ad_id) = self.advertising_id().await {
            params.insert(self.platform.advertising_id_key(), ad_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{AppleAppStore, GooglePlay};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Provider that replays a list of advertising-id responses.
    struct ScriptedProvider {
        responses: Mutex<Vec<Option<AdvertisingId>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(mut responses: Vec<Option<AdvertisingId>>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DeviceContextProvider for ScriptedProvider {
        async fn fetch_advertising_id(&self) -> Option<AdvertisingId> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses.lock().unwrap().pop().flatten()
        }

        fn device_unique_identifier(&self) -> Option<String> {
            Some("android-1".to_string())
        }
    }

    fn ad_id(id: &str) -> Option<AdvertisingId> {
        Some(AdvertisingId {
            id: id.to_string(),
            tracking_enabled: true,
            error: None,
        })
    }

    #[tokio::test]
    async fn test_enrich_adds_device_and_advertising_ids() {
        let provider = StaticDeviceProvider::new()
            .with_vendor_id("idfv-1")
            .with_advertising_id("idfa-1");
        let context = DeviceContext::new(Arc::new(provider), Arc::new(AppleAppStore));

        let mut params = EventParameters::new();
        context.enrich(&mut params).await;

        let pairs: Vec<_> = params.iter().collect();
        assert_eq!(pairs, vec![("ios_idfv", "idfv-1"), ("ios_idfa", "idfa-1")]);
    }

    #[tokio::test]
    async fn test_advertising_id_cached_once_resolved() {
        let provider = Arc::new(ScriptedProvider::new(vec![ad_id("gps-1"), ad_id("gps-2")]));
        let context = DeviceContext::new(provider.clone(), Arc::new(GooglePlay));

        assert_eq!(context.advertising_id().await.as_deref(), Some("gps-1"));
        assert_eq!(context.advertising_id().await.as_deref(), Some("gps-1"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_advertising_id_not_cached() {
        let provider = Arc::new(ScriptedProvider::new(vec![ad_id(""), None, ad_id("gps-3")]));
        let context = DeviceContext::new(provider.clone(), Arc::new(GooglePlay));

        let mut params = EventParameters::new();
        context.enrich(&mut params).await;
        assert_eq!(params.get("android_id"), Some("android-1"));
        assert!(!params.contains_key("android_gps"));

        assert_eq!(context.advertising_id().await, None);
        assert_eq!(context.advertising_id().await.as_deref(), Some("gps-3"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    struct HangingProvider;

    #[async_trait]
    impl DeviceContextProvider for HangingProvider {
        async fn fetch_advertising_id(&self) -> Option<AdvertisingId> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_fetch_timeout_bounds_wait() {
        let context = DeviceContext::new(Arc::new(HangingProvider), Arc::new(AppleAppStore))
            .with_fetch_timeout(Some(Duration::from_millis(20)));

        let mut params = EventParameters::new();
        context.enrich(&mut params).await;
        assert!(params.is_empty());
    }
}
