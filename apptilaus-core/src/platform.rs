//! Store platform adapters
//!
//! The two supported stores differ in three ways: the platform tag sent with
//! purchases, the device identifier scheme, and the receipt envelope layout.
//! [`PlatformAdapter`] captures those differences; [`Platform`] selects an
//! adapter from configuration.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::device::DeviceContextProvider;
use crate::error::{Error, Result};

/// Platform-specific behavior used by the event builder.
pub trait PlatformAdapter: Send + Sync {
    /// Value of the `platform` purchase parameter
    fn store_tag(&self) -> &'static str;

    /// Parameter name for the advertising identifier
    fn advertising_id_key(&self) -> &'static str;

    /// The platform vendor/device identifier, if the provider has one
    fn device_id(&self, provider: &dyn DeviceContextProvider) -> Option<(&'static str, String)>;

    /// Extract receipt parameters from the store's receipt envelope
    fn receipt_fields(&self, receipt: &str) -> Result<Vec<(&'static str, String)>>;
}

/// Configured store platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Ios,
    Android,
}

impl Platform {
    pub fn adapter(&self) -> Arc<dyn PlatformAdapter> {
        match self {
            Platform::Ios => Arc::new(AppleAppStore),
            Platform::Android => Arc::new(GooglePlay),
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            _ => Err(format!("unknown platform: {}", s)),
        }
    }
}

/// Apple App Store: receipt is the envelope's `Payload` field verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppleAppStore;

impl PlatformAdapter for AppleAppStore {
    fn store_tag(&self) -> &'static str {
        "AppleAppStore"
    }

    fn advertising_id_key(&self) -> &'static str {
        "ios_idfa"
    }

    fn device_id(&self, provider: &dyn DeviceContextProvider) -> Option<(&'static str, String)> {
        provider
            .vendor_identifier()
            .filter(|id| !id.is_empty())
            .map(|id| ("ios_idfv", id))
    }

    fn receipt_fields(&self, receipt: &str) -> Result<Vec<(&'static str, String)>> {
        let envelope = parse_json(receipt)?;
        let payload = string_field(&envelope, "Payload")?;
        Ok(vec![("receipt", payload)])
    }
}

/// Google Play: `Payload` is itself JSON holding `signature` and a nested
/// `json` string that carries the `purchaseToken`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GooglePlay;

impl PlatformAdapter for GooglePlay {
    fn store_tag(&self) -> &'static str {
        "GooglePlay"
    }

    fn advertising_id_key(&self) -> &'static str {
        "android_gps"
    }

    fn device_id(&self, provider: &dyn DeviceContextProvider) -> Option<(&'static str, String)> {
        provider
            .device_unique_identifier()
            .filter(|id| !id.is_empty())
            .map(|id| ("android_id", id))
    }

    fn receipt_fields(&self, receipt: &str) -> Result<Vec<(&'static str, String)>> {
        let envelope = parse_json(receipt)?;
        let payload = parse_json(&string_field(&envelope, "Payload")?)?;
        let signature = string_field(&payload, "signature")?;
        let purchase = parse_json(&string_field(&payload, "json")?)?;
        let token = string_field(&purchase, "purchaseToken")?;

        Ok(vec![("receipt", signature), ("purchase_token", token)])
    }
}

fn parse_json(text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(|e| Error::PayloadParse(e.to_string()))
}

fn string_field(value: &Value, field: &str) -> Result<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::PayloadParse(format!("missing string field '{}'", field)))
}
