//! Event parameter construction
//!
//! Builds the wire parameter sets for purchase, install/session and opt-out
//! events. Every call produces a fresh [`EventParameters`].
//!
//! ## Purchase parameters (wire order)
//!
//! ```text
//! platform, <device id>, <advertising id>, price, currency, sdk_version,
//! [user_id], dp_<custom>..., item, transaction_id, [receipt, purchase_token]
//! ```

use std::sync::Arc;

use crate::device::DeviceContext;
use crate::platform::PlatformAdapter;
use crate::types::{EventParameters, Product, SessionDecision, CUSTOM_PARAM_PREFIX};

/// Parameters for one install or session registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub params: EventParameters,
    pub decision: SessionDecision,
    /// Value written to the timestamp parameter, and to the marker on success
    pub timestamp_millis: i64,
}

impl SessionEvent {
    pub fn is_first_session(&self) -> bool {
        self.decision == SessionDecision::Install
    }
}

/// Builds event parameter sets, merging in device context.
pub struct EventBuilder {
    platform: Arc<dyn PlatformAdapter>,
    device: Arc<DeviceContext>,
    sdk_version: String,
}

impl EventBuilder {
    pub fn new(
        platform: Arc<dyn PlatformAdapter>,
        device: Arc<DeviceContext>,
        sdk_version: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            device,
            sdk_version: sdk_version.into(),
        }
    }

    /// Build purchase parameters.
    ///
    /// Receipt parsing is best-effort: on failure the error is logged and the
    /// receipt fields are left out.
    pub async fn purchase_parameters(
        &self,
        product: &Product,
        custom_params: &[(String, String)],
        user_id: Option<&str>,
    ) -> EventParameters {
        let mut params = EventParameters::new();
        params.insert("platform", self.platform.store_tag());
        self.device.enrich(&mut params).await;

        params.insert("price", format_price(product.localized_price));
        params.insert("currency", product.iso_currency_code.as_str());
        params.insert("sdk_version", self.sdk_version.as_str());
        if let Some(user_id) = user_id.filter(|id| !id.is_empty()) {
            params.insert("user_id", user_id);
        }
        for (key, value) in custom_params {
            params.insert(format!("{}{}", CUSTOM_PARAM_PREFIX, key), value.as_str());
        }
        params.insert("item", product.store_specific_id.as_str());
        params.insert("transaction_id", product.transaction_id.as_str());

        match &product.receipt {
            Some(receipt) => match self.platform.receipt_fields(receipt) {
                Ok(fields) => {
                    for (key, value) in fields {
                        params.insert(key, value);
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, receipt = %receipt, "Couldn't parse receipt json");
                }
            },
            None => tracing::debug!(
                transaction_id = %product.transaction_id,
                "Purchase has no receipt"
            ),
        }

        params
    }

    /// Build install/session parameters for a gate decision.
    ///
    /// Returns `None` for [`SessionDecision::Skip`].
    pub async fn session_parameters(
        &self,
        decision: SessionDecision,
        timestamp_millis: i64,
    ) -> Option<SessionEvent> {
        let activity = decision.activity()?;
        let timestamp_key = decision.timestamp_key()?;

        let mut params = EventParameters::new();
        params.insert("dp_activity", activity);
        params.insert(timestamp_key, timestamp_millis.to_string());
        self.device.enrich(&mut params).await;

        Some(SessionEvent {
            params,
            decision,
            timestamp_millis,
        })
    }

    /// Build opt-out request headers: device context plus the app bundle.
    pub async fn opt_out_headers(&self, app_bundle: &str) -> EventParameters {
        let mut headers = EventParameters::new();
        self.device.enrich(&mut headers).await;
        headers.insert("App-Bundle", app_bundle);
        headers
    }
}

/// Two-decimal price, independent of locale
pub fn format_price(price: f64) -> String {
    format!("{:.2}", price)
}
