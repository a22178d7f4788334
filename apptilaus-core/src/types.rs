//! Core domain types for apptilaus
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Event** | A purchase, install, session, or opt-out signal sent to the collection endpoint |
//! | **Install** | The first session ever registered on this device |
//! | **Session** | The first app open on a calendar day after install |
//! | **Marker** | The persisted timestamp of the last successful install/session registration |
//! | **Device context** | Platform identifiers (advertising ID, vendor/device ID) attached to events |

use serde::{Deserialize, Serialize};

// ============================================
// Event parameters
// ============================================

/// Prefix applied to custom and session parameter keys.
pub const CUSTOM_PARAM_PREFIX: &str = "dp_";

/// Ordered string-to-string parameter set for a single event.
///
/// Insertion order is preserved and is the order used on the wire, both in
/// POST bodies and in session query strings. Keys are unique: the first
/// value written for a key wins.
///
/// Each dispatch builds its own instance, so no instance is ever shared
/// between concurrent sends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventParameters {
    entries: Vec<(String, String)>,
}

impl EventParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter.
    ///
    /// Returns false (and leaves the set unchanged) if the key is already present.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if self.contains_key(&key) {
            tracing::warn!(key = %key, "Duplicate event parameter ignored");
            return false;
        }
        self.entries.push((key, value.into()));
        true
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EventParameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = EventParameters::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

// ============================================
// Purchases
// ============================================

/// A completed store purchase, as reported by the host's store listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// Price in the store's local currency
    pub localized_price: f64,
    /// ISO 4217 currency code
    pub iso_currency_code: String,
    /// Store-specific item identifier (SKU)
    pub store_specific_id: String,
    /// Store transaction identifier
    pub transaction_id: String,
    /// Raw receipt envelope as delivered by the store layer
    #[serde(default)]
    pub receipt: Option<String>,
}

/// Custom key/value pairs attached to a purchase. Keys are sent with a `dp_` prefix.
pub type CustomParams = Vec<(String, String)>;

// ============================================
// Session registration
// ============================================

/// Result of consulting the session gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionDecision {
    /// A session was already registered today
    Skip,
    /// No session was ever registered on this device
    Install,
    /// First session of a new calendar day
    Session,
}

impl SessionDecision {
    /// Value of the `dp_activity` parameter, if an event should be sent.
    pub fn activity(&self) -> Option<&'static str> {
        match self {
            SessionDecision::Skip => None,
            SessionDecision::Install => Some("install"),
            SessionDecision::Session => Some("session"),
        }
    }

    /// Name of the timestamp parameter, if an event should be sent.
    pub fn timestamp_key(&self) -> Option<&'static str> {
        match self {
            SessionDecision::Skip => None,
            SessionDecision::Install => Some("dp_install"),
            SessionDecision::Session => Some("dp_session"),
        }
    }
}

// ============================================
// Dispatch results
// ============================================

/// Event kind, used for logging and retry bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Purchase,
    Session,
    OptOut,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Purchase => "purchase",
            EventKind::Session => "session",
            EventKind::OptOut => "optout",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of a dispatch task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchStatus {
    /// Delivered; `attempts` counts the initial send
    Sent { attempts: u32 },
    /// Nothing to send (session already registered today)
    Skipped,
    /// Server rejected the request
    Rejected { reason: String },
    /// Network kept failing until the retry budget was spent
    Dropped { attempts: u32, reason: String },
    /// Client was not set up with valid credentials
    NotReady,
}

impl DispatchStatus {
    pub fn is_sent(&self) -> bool {
        matches!(self, DispatchStatus::Sent { .. })
    }
}
