//! Client facade
//!
//! [`Apptilaus`] is constructed once by the host and shared by handle (it is
//! cheap to clone). It starts `Uninitialized` and becomes `Ready` after
//! [`Apptilaus::setup`] receives non-empty credentials. Operations on an
//! uninitialized client log an error and do nothing else.
//!
//! Every operation runs as a self-contained Tokio task and returns a
//! [`DispatchHandle`]. Awaiting the handle is optional: dropping it detaches
//! the task, which still runs to completion on its own.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::oneshot;

use crate::config::{trim_base_url, ClientConfig};
use crate::device::{DeviceContext, DeviceContextProvider, StaticDeviceProvider};
use crate::dispatch::{
    Dispatcher, HttpRequest, HttpTransport, RequestBuilder, RetryPolicy, Transport,
};
use crate::error::{Error, Result};
use crate::events::EventBuilder;
use crate::platform::PlatformAdapter;
use crate::serialize::{PayloadSerializer, PrettyObjectWriter};
use crate::session::SessionGate;
use crate::store::{MarkerStore, MemoryMarkerStore};
use crate::types::{CustomParams, DispatchStatus, EventKind, EventParameters, Product};

/// Opt-out completion callback: `(success, error_message)`.
pub type CompletionHandler = Box<dyn FnOnce(bool, String) + Send + 'static>;

/// Lifecycle state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Uninitialized,
    Ready,
}

#[derive(Debug, Clone)]
struct Credentials {
    app_id: String,
    app_token: String,
}

/// Handle to a dispatch task.
///
/// Dropping it is safe; the task keeps running until it reaches a terminal state.
#[derive(Debug)]
pub struct DispatchHandle {
    state: HandleState,
}

#[derive(Debug)]
enum HandleState {
    Done(DispatchStatus),
    Pending(oneshot::Receiver<DispatchStatus>),
}

impl DispatchHandle {
    fn done(status: DispatchStatus) -> Self {
        Self {
            state: HandleState::Done(status),
        }
    }

    fn pending(receiver: oneshot::Receiver<DispatchStatus>) -> Self {
        Self {
            state: HandleState::Pending(receiver),
        }
    }

    /// Wait for the terminal status.
    pub async fn wait(self) -> DispatchStatus {
        match self.state {
            HandleState::Done(status) => status,
            HandleState::Pending(receiver) => receiver.await.unwrap_or_else(|_| {
                tracing::error!("Dispatch task ended without a status");
                DispatchStatus::Dropped {
                    attempts: 0,
                    reason: "dispatch task ended without a status".to_string(),
                }
            }),
        }
    }
}

/// Builder for [`Apptilaus`]; every collaborator has a default.
pub struct ApptilausBuilder {
    config: ClientConfig,
    provider: Option<Arc<dyn DeviceContextProvider>>,
    store: Option<Arc<dyn MarkerStore>>,
    transport: Option<Arc<dyn Transport>>,
    serializer: Option<Arc<dyn PayloadSerializer>>,
    platform: Option<Arc<dyn PlatformAdapter>>,
}

impl ApptilausBuilder {
    /// Platform identifier source (default: no identifiers)
    pub fn device_provider(mut self, provider: Arc<dyn DeviceContextProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Session marker persistence (default: in-memory)
    pub fn marker_store(mut self, store: Arc<dyn MarkerStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// HTTP transport (default: reqwest with the configured timeout)
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// POST body serializer (default: [`PrettyObjectWriter`])
    pub fn serializer(mut self, serializer: Arc<dyn PayloadSerializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Platform adapter (default: selected by `config.platform`)
    pub fn platform_adapter(mut self, platform: Arc<dyn PlatformAdapter>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn build(self) -> Result<Apptilaus> {
        self.config.validate()?;
        let config = self.config;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(
                config.timeout_secs.map(Duration::from_secs),
            )?),
        };
        let serializer = self
            .serializer
            .unwrap_or_else(|| Arc::new(PrettyObjectWriter));
        let platform = self.platform.unwrap_or_else(|| config.platform.adapter());
        let provider = self
            .provider
            .unwrap_or_else(|| Arc::new(StaticDeviceProvider::new()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryMarkerStore::new()));

        let device = Arc::new(
            DeviceContext::new(provider, platform.clone())
                .with_fetch_timeout(config.advertising_id_timeout_ms.map(Duration::from_millis)),
        );

        let inner = Inner {
            base_url: RwLock::new(trim_base_url(&config.base_url)),
            session_url: trim_base_url(&config.session_url),
            app_bundle: config.app_bundle.clone(),
            state: RwLock::new(None),
            user_id: RwLock::new(config.user_id.clone()),
            max_retry_count: Arc::new(AtomicU32::new(config.max_retry_count)),
            retry_rebuilds_payload: config.retry_rebuilds_payload,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            session_gate: SessionGate::new(store),
            builder: EventBuilder::new(platform, device, config.sdk_version.clone()),
            dispatcher: Dispatcher::new(transport, serializer),
        };

        Ok(Apptilaus {
            inner: Arc::new(inner),
        })
    }
}

/// Analytics client
#[derive(Clone)]
pub struct Apptilaus {
    inner: Arc<Inner>,
}

struct Inner {
    base_url: RwLock<String>,
    session_url: String,
    app_bundle: String,
    /// `None` until setup succeeds
    state: RwLock<Option<Credentials>>,
    user_id: RwLock<Option<String>>,
    /// Shared with running purchase dispatches
    max_retry_count: Arc<AtomicU32>,
    retry_rebuilds_payload: bool,
    retry_delay: Duration,
    session_gate: SessionGate,
    builder: EventBuilder,
    dispatcher: Dispatcher,
}

impl Apptilaus {
    pub fn builder(config: ClientConfig) -> ApptilausBuilder {
        ApptilausBuilder {
            config,
            provider: None,
            store: None,
            transport: None,
            serializer: None,
            platform: None,
        }
    }

    // ============================================
    // Lifecycle
    // ============================================

    /// Initialize the client with the app credentials issued by Apptilaus.
    ///
    /// Empty credentials abort setup: the error is logged, returned, and the
    /// client stays in its previous state. The `Err` is informational only.
    /// Ignoring it is safe: later operations on the client are logged and
    /// dropped, never raised. With session tracking enabled, install/session
    /// registration starts in the background and its handle is returned.
    ///
    /// Must be called from within a Tokio runtime when session tracking is enabled.
    pub fn setup(
        &self,
        app_id: &str,
        app_token: &str,
        enable_session_tracking: bool,
    ) -> Result<Option<DispatchHandle>> {
        if app_id.is_empty() || app_token.is_empty() {
            tracing::error!("Invalid initializer parameters: app id and app token are required");
            return Err(Error::Config(
                "app_id and app_token must not be empty".to_string(),
            ));
        }

        {
            let mut state = write(&self.inner.state);
            if state.is_some() {
                tracing::warn!(
                    app_id = %app_id,
                    "Client was already set up, replacing credentials"
                );
            }
            *state = Some(Credentials {
                app_id: app_id.to_string(),
                app_token: app_token.to_string(),
            });
        }
        tracing::info!(
            app_id = %app_id,
            session_tracking = enable_session_tracking,
            "Client ready"
        );

        if !enable_session_tracking {
            return Ok(None);
        }
        Ok(Some(self.register_session()))
    }

    pub fn state(&self) -> ClientState {
        if self.inner.credentials().is_some() {
            ClientState::Ready
        } else {
            ClientState::Uninitialized
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ClientState::Ready
    }

    // ============================================
    // Runtime settings
    // ============================================

    pub fn base_url(&self) -> String {
        self.inner.base_url()
    }

    /// Replace the collection endpoint; trailing `/` and `\` are stripped.
    pub fn set_base_url(&self, url: &str) {
        *write(&self.inner.base_url) = trim_base_url(url);
    }

    pub fn user_id(&self) -> Option<String> {
        read(&self.inner.user_id).clone()
    }

    /// Custom user id sent with purchases; `None` or empty to omit it.
    pub fn set_user_id(&self, user_id: Option<String>) {
        *write(&self.inner.user_id) = user_id;
    }

    pub fn max_retry_count(&self) -> u32 {
        self.inner.max_retry_count.load(Ordering::Relaxed)
    }

    /// Retries after a network failure.
    ///
    /// Also applies to purchases that are already retrying: each one checks
    /// the current value after every failed attempt.
    pub fn set_max_retry_count(&self, count: u32) {
        self.inner.max_retry_count.store(count, Ordering::Relaxed);
    }

    /// Timestamp of the last successful install/session registration.
    pub fn last_session_registered(&self) -> Option<i64> {
        self.inner.session_gate.last_registered()
    }

    // ============================================
    // Operations
    // ============================================

    /// Report a completed purchase.
    ///
    /// Network failures are retried up to the max retry count, rebuilding the
    /// parameters on every attempt unless configured otherwise.
    pub fn purchase(&self, product: Product, custom_params: CustomParams) -> DispatchHandle {
        let Some(credentials) = self.inner.credentials() else {
            tracing::error!(event = %EventKind::Purchase, "Client is not set up, dropping event");
            return DispatchHandle::done(DispatchStatus::NotReady);
        };
        if !self
            .inner
            .check_endpoint(EventKind::Purchase, &self.inner.base_url())
        {
            return DispatchHandle::done(DispatchStatus::NotReady);
        }
        if let Err(e) = tokio::runtime::Handle::try_current() {
            return no_runtime(e);
        }

        let request = PurchaseRequest {
            inner: self.inner.clone(),
            credentials,
            product,
            custom_params,
        };
        let receiver = self.inner.dispatcher.send_with_retry(
            EventKind::Purchase,
            self.inner.retry_policy(),
            Arc::new(request),
        );
        DispatchHandle::pending(receiver)
    }

    /// Notify Apptilaus that the user exercised their right to be forgotten.
    ///
    /// Single attempt. Once the client is set up, `completion` is called
    /// exactly once with the outcome. Before setup the call is dropped like
    /// any other operation and `completion` is never called.
    pub fn opt_out(&self, completion: Option<CompletionHandler>) -> DispatchHandle {
        if self.inner.credentials().is_none() {
            tracing::error!(event = %EventKind::OptOut, "Client is not set up, dropping event");
            return DispatchHandle::done(DispatchStatus::NotReady);
        }

        let inner = self.inner.clone();
        spawn(async move {
            let status = inner.process_opt_out().await;
            if let Some(completion) = completion {
                match &status {
                    DispatchStatus::Sent { .. } => completion(true, String::new()),
                    DispatchStatus::Rejected { reason }
                    | DispatchStatus::Dropped { reason, .. } => completion(false, reason.clone()),
                    other => completion(false, format!("{:?}", other)),
                }
            }
            status
        })
    }

    fn register_session(&self) -> DispatchHandle {
        let inner = self.inner.clone();
        spawn(async move { inner.process_session().await })
    }
}

impl Inner {
    fn credentials(&self) -> Option<Credentials> {
        read(&self.state).clone()
    }

    fn base_url(&self) -> String {
        read(&self.base_url).clone()
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_shared_limit(self.max_retry_count.clone())
            .with_rebuild_payload(self.retry_rebuilds_payload)
            .with_initial_delay(self.retry_delay)
    }

    /// Check the configuration needed before any dispatch.
    fn check_endpoint(&self, kind: EventKind, url: &str) -> bool {
        if url.is_empty() {
            tracing::error!(event = %kind, "Base URL is not set");
            return false;
        }
        true
    }

    async fn process_opt_out(&self) -> DispatchStatus {
        let base_url = self.base_url();
        if !self.check_endpoint(EventKind::OptOut, &base_url) {
            return DispatchStatus::NotReady;
        }

        let headers = self.builder.opt_out_headers(&self.app_bundle).await;
        let request = headers.iter().fold(
            HttpRequest::get(format!("{}/v1/optout", base_url)),
            |request, (name, value)| request.header(name, value),
        );

        let status = self.dispatcher.send_once(EventKind::OptOut, request).await;
        if status.is_sent() {
            tracing::info!("Opt-out processed");
        }
        status
    }

    async fn process_session(&self) -> DispatchStatus {
        let Some(credentials) = self.credentials() else {
            tracing::error!(event = %EventKind::Session, "Client is not set up, skipping session");
            return DispatchStatus::NotReady;
        };
        if !self.check_endpoint(EventKind::Session, &self.session_url) {
            return DispatchStatus::NotReady;
        }

        let now = Utc::now().timestamp_millis();
        let decision = self.session_gate.decide(now);
        let Some(event) = self.builder.session_parameters(decision, now).await else {
            tracing::info!("Already registered session today");
            return DispatchStatus::Skipped;
        };

        let url = session_request_url(&self.session_url, &credentials.app_id, &event.params);
        tracing::info!(url = %url, activity = ?event.decision, "Sending session request");

        let status = self
            .dispatcher
            .send_once(EventKind::Session, HttpRequest::get(url))
            .await;

        if status.is_sent() {
            match self.session_gate.record(event.timestamp_millis) {
                Ok(()) => tracing::info!(timestamp = event.timestamp_millis, "Session registered"),
                Err(e) => tracing::warn!(error = %e, "Session registered but marker was not saved"),
            }
        }
        status
    }
}

/// Rebuilds the purchase request for every attempt, so runtime changes to
/// the base URL or user id reach retries.
struct PurchaseRequest {
    inner: Arc<Inner>,
    credentials: Credentials,
    product: Product,
    custom_params: CustomParams,
}

#[async_trait]
impl RequestBuilder for PurchaseRequest {
    async fn build(&self, attempt: u32) -> HttpRequest {
        let inner = &self.inner;
        let user_id = read(&inner.user_id).clone();
        let params = inner
            .builder
            .purchase_parameters(&self.product, &self.custom_params, user_id.as_deref())
            .await;

        let url = format!(
            "{}/v1/unity/{}/",
            inner.base_url(),
            self.credentials.app_id
        );
        tracing::info!(url = %url, attempt, "Sending purchase");
        inner.dispatcher.post_request(
            &url,
            &[
                ("App-Token", self.credentials.app_token.as_str()),
                ("Content-Type", "application/json"),
            ],
            &params,
        )
    }
}

/// `{session_url}/{app_id}/?k1=v1&k2=v2`, percent-encoded, in insertion order
pub fn session_request_url(session_url: &str, app_id: &str, params: &EventParameters) -> String {
    let query: Vec<String> = params
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(value)
            )
        })
        .collect();

    format!(
        "{}/{}/?{}",
        session_url,
        urlencoding::encode(app_id),
        query.join("&")
    )
}

fn spawn<F>(task: F) -> DispatchHandle
where
    F: std::future::Future<Output = DispatchStatus> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            let (reply, receiver) = oneshot::channel();
            runtime.spawn(async move {
                let _ = reply.send(task.await);
            });
            DispatchHandle::pending(receiver)
        }
        Err(e) => no_runtime(e),
    }
}

fn no_runtime(error: tokio::runtime::TryCurrentError) -> DispatchHandle {
    tracing::error!(error = %error, "No Tokio runtime available, dropping event");
    DispatchHandle::done(DispatchStatus::Dropped {
        attempts: 0,
        reason: error.to_string(),
    })
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StaticDeviceProvider;
    use crate::dispatch::{HttpMethod, Outcome};
    use crate::platform::Platform;
    use crate::store::LAST_SESSION_KEY;
    use crate::testing::ScriptedTransport;
    use std::sync::Mutex;

    struct Harness {
        client: Apptilaus,
        transport: Arc<ScriptedTransport>,
        store: Arc<MemoryMarkerStore>,
    }

    fn harness(outcomes: Vec<Outcome>, config: ClientConfig) -> Harness {
        let transport = Arc::new(ScriptedTransport::new(outcomes));
        let store = Arc::new(MemoryMarkerStore::new());
        let provider = StaticDeviceProvider::new()
            .with_device_id("android-1")
            .with_advertising_id("gps-1");

        let client = Apptilaus::builder(config)
            .transport(transport.clone())
            .marker_store(store.clone())
            .device_provider(Arc::new(provider))
            .build()
            .unwrap();

        Harness {
            client,
            transport,
            store,
        }
    }

    fn android_config() -> ClientConfig {
        ClientConfig {
            base_url: "https://api.example.com/".to_string(),
            session_url: "https://device.example.com/v1/device".to_string(),
            platform: Platform::Android,
            app_bundle: "com.example.game".to_string(),
            sdk_version: "1.0.0".to_string(),
            ..Default::default()
        }
    }

    fn product() -> Product {
        Product {
            localized_price: 9.5,
            iso_currency_code: "EUR".to_string(),
            store_specific_id: "gems_100".to_string(),
            transaction_id: "GPA.1".to_string(),
            receipt: None,
        }
    }

    fn ok() -> Outcome {
        Outcome::Success("{}".to_string())
    }

    fn network_error() -> Outcome {
        Outcome::TransientFailure("connection refused".to_string())
    }

    #[tokio::test]
    async fn test_setup_rejects_empty_credentials() {
        let h = harness(vec![ok()], android_config());

        assert!(h.client.setup("", "token", true).is_err());
        assert!(h.client.setup("app", "", true).is_err());
        assert_eq!(h.client.state(), ClientState::Uninitialized);

        let status = h.client.purchase(product(), vec![]).wait().await;
        assert_eq!(status, DispatchStatus::NotReady);

        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let status = h
            .client
            .opt_out(Some(Box::new(move |success, error| {
                sink.lock().unwrap().push((success, error));
            })))
            .wait()
            .await;
        assert_eq!(status, DispatchStatus::NotReady);
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(h.transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_setup_without_tracking_sends_nothing() {
        let h = harness(vec![ok()], android_config());

        let handle = h.client.setup("app", "token", false).unwrap();
        assert!(handle.is_none());
        assert!(h.client.is_ready());
        assert_eq!(h.transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_base_url_trailing_slash_stripped() {
        let h = harness(vec![ok()], android_config());
        assert_eq!(h.client.base_url(), "https://api.example.com");

        h.client.set_base_url("https://other.example.com\\/");
        assert_eq!(h.client.base_url(), "https://other.example.com");
    }

    #[tokio::test]
    async fn test_purchase_request_shape() {
        let h = harness(vec![ok()], android_config());
        h.client.setup("app-1", "token-1", false).unwrap();
        h.client.set_user_id(Some("player-9".to_string()));

        let status = h
            .client
            .purchase(product(), vec![("level".to_string(), "4".to_string())])
            .wait()
            .await;
        assert_eq!(status, DispatchStatus::Sent { attempts: 1 });

        let requests = h.transport.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.url, "https://api.example.com/v1/unity/app-1/");
        assert_eq!(request.header_value("App-Token"), Some("token-1"));
        assert_eq!(request.header_value("Content-Type"), Some("application/json"));

        let body: serde_json::Value =
            serde_json::from_str(request.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["platform"], "GooglePlay");
        assert_eq!(body["price"], "9.50");
        assert_eq!(body["currency"], "EUR");
        assert_eq!(body["user_id"], "player-9");
        assert_eq!(body["dp_level"], "4");
        assert_eq!(body["android_id"], "android-1");
        assert_eq!(body["android_gps"], "gps-1");
        assert_eq!(body["item"], "gems_100");
        assert_eq!(body["transaction_id"], "GPA.1");
    }

    #[tokio::test]
    async fn test_purchase_retry_cap() {
        let h = harness(vec![network_error()], android_config());
        h.client.setup("app", "token", false).unwrap();
        h.client.set_max_retry_count(2);

        let status = h.client.purchase(product(), vec![]).wait().await;

        assert!(matches!(status, DispatchStatus::Dropped { attempts: 3, .. }));
        assert_eq!(h.transport.request_count(), 3);
        assert_eq!(h.store.get_string(LAST_SESSION_KEY, ""), "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lowering_retry_count_stops_running_purchase() {
        let config = ClientConfig {
            retry_delay_ms: 50,
            ..android_config()
        };
        let h = harness(vec![network_error()], config);
        h.client.setup("app", "token", false).unwrap();

        let handle = h.client.purchase(product(), vec![]);
        // Attempts at 0ms and 50ms fail; the third is due at 150ms
        tokio::time::sleep(Duration::from_millis(75)).await;
        h.client.set_max_retry_count(0);

        let status = handle.wait().await;
        assert!(matches!(status, DispatchStatus::Dropped { attempts: 3, .. }));
        assert_eq!(h.transport.request_count(), 3);
    }

    #[tokio::test]
    async fn test_purchase_retry_picks_up_user_id_change() {
        let h = harness(vec![network_error(), ok()], android_config());
        h.client.setup("app", "token", false).unwrap();

        let client = h.client.clone();
        let handle = h.client.purchase(product(), vec![]);
        // The retried payload is rebuilt, so it sees the current user id
        client.set_user_id(Some("late-user".to_string()));
        let status = handle.wait().await;
        assert_eq!(status, DispatchStatus::Sent { attempts: 2 });

        let last = h.transport.requests().pop().unwrap();
        let body: serde_json::Value = serde_json::from_str(last.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["user_id"], "late-user");
    }

    #[tokio::test]
    async fn test_purchase_permanent_failure_not_retried() {
        let h = harness(
            vec![Outcome::PermanentFailure("API error (422)".to_string())],
            android_config(),
        );
        h.client.setup("app", "token", false).unwrap();

        let status = h.client.purchase(product(), vec![]).wait().await;
        assert!(matches!(status, DispatchStatus::Rejected { .. }));
        assert_eq!(h.transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_install_then_skip() {
        let h = harness(vec![ok()], android_config());

        let status = h
            .client
            .setup("app-1", "token", true)
            .unwrap()
            .unwrap()
            .wait()
            .await;
        assert_eq!(status, DispatchStatus::Sent { attempts: 1 });

        let request = &h.transport.requests()[0];
        assert_eq!(request.method, HttpMethod::Get);
        let prefix = "https://device.example.com/v1/device/app-1/?dp_activity=install&dp_install=";
        assert!(request.url.starts_with(prefix));
        assert!(request.url.ends_with("&android_id=android-1&android_gps=gps-1"));

        // Marker equals the timestamp sent in the request
        let marker = h.store.get_string(LAST_SESSION_KEY, "");
        assert!(request.url.contains(&format!("dp_install={}&", marker)));

        let status = h.client.register_session().wait().await;
        assert_eq!(status, DispatchStatus::Skipped);
        assert_eq!(h.transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_session_after_previous_day() {
        let h = harness(vec![ok()], android_config());
        let yesterday = Utc::now().timestamp_millis() - 86_400_000;
        h.store.set_string(LAST_SESSION_KEY, &yesterday.to_string());

        let status = h
            .client
            .setup("app-1", "token", true)
            .unwrap()
            .unwrap()
            .wait()
            .await;
        assert_eq!(status, DispatchStatus::Sent { attempts: 1 });
        assert!(h.transport.requests()[0]
            .url
            .contains("dp_activity=session&dp_session="));
    }

    #[tokio::test]
    async fn test_failed_session_is_single_attempt_and_keeps_marker() {
        let h = harness(vec![network_error()], android_config());

        let status = h
            .client
            .setup("app-1", "token", true)
            .unwrap()
            .unwrap()
            .wait()
            .await;

        assert!(matches!(status, DispatchStatus::Dropped { attempts: 1, .. }));
        assert_eq!(h.transport.request_count(), 1);
        assert_eq!(h.store.get_string(LAST_SESSION_KEY, ""), "");
    }

    #[tokio::test]
    async fn test_concurrent_sessions_leave_valid_marker() {
        let h = harness(vec![ok()], android_config());
        h.client.setup("app-1", "token", false).unwrap();

        let first = h.client.register_session();
        let second = h.client.register_session();
        let first = first.wait().await;
        let second = second.wait().await;
        assert!(first.is_sent() || second.is_sent());

        let marker: i64 = h.store.get_string(LAST_SESSION_KEY, "").parse().unwrap();
        let sent: Vec<String> = h.transport.requests().into_iter().map(|r| r.url).collect();
        assert!(sent
            .iter()
            .any(|url| url.contains(&format!("={}&", marker))));
    }

    #[tokio::test]
    async fn test_opt_out_success_calls_completion_once() {
        let h = harness(vec![ok()], android_config());
        h.client.setup("app", "token", false).unwrap();

        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let status = h
            .client
            .opt_out(Some(Box::new(move |success, error| {
                sink.lock().unwrap().push((success, error));
            })))
            .wait()
            .await;

        assert_eq!(status, DispatchStatus::Sent { attempts: 1 });
        assert_eq!(*calls.lock().unwrap(), vec![(true, String::new())]);

        let request = &h.transport.requests()[0];
        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(request.url, "https://api.example.com/v1/optout");
        assert_eq!(request.header_value("App-Bundle"), Some("com.example.game"));
        assert_eq!(request.header_value("android_id"), Some("android-1"));
    }

    #[tokio::test]
    async fn test_opt_out_failure_is_not_retried() {
        let h = harness(vec![network_error()], android_config());
        h.client.setup("app", "token", false).unwrap();

        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let status = h
            .client
            .opt_out(Some(Box::new(move |success, error| {
                sink.lock().unwrap().push((success, error));
            })))
            .wait()
            .await;

        assert!(matches!(status, DispatchStatus::Dropped { attempts: 1, .. }));
        assert_eq!(h.transport.request_count(), 1);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![(false, "connection refused".to_string())]
        );
    }

    #[test]
    fn test_session_request_url_encodes_values() {
        let params: EventParameters = [("dp_activity", "install"), ("ios_idfv", "A B&C")]
            .into_iter()
            .collect();
        let url = session_request_url("https://device.example.com/v1/device", "app", &params);
        assert_eq!(
            url,
            "https://device.example.com/v1/device/app/?dp_activity=install&ios_idfv=A%20B%26C"
        );
    }

    #[test]
    fn test_no_runtime_drops_instead_of_panicking() {
        let h = harness(vec![ok()], android_config());
        h.client.setup("app", "token", false).unwrap();

        let handle = h.client.purchase(product(), vec![]);
        let status = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(handle.wait());
        assert!(matches!(status, DispatchStatus::Dropped { attempts: 0, .. }));
        assert_eq!(h.transport.request_count(), 0);
    }
}
