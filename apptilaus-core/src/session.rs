//! Install/session registration gate
//!
//! At most one install-or-session event is registered per calendar day. The
//! gate only reads the marker; the dispatcher writes it after a successful
//! send, so a failed registration is attempted again on the next run.
//!
//! Days are whole 24h periods since the Unix epoch (UTC).

use std::sync::Arc;

use crate::store::{MarkerStore, LAST_SESSION_KEY};
use crate::types::SessionDecision;

const MILLIS_PER_DAY: i64 = 86_400_000;

/// Day index of an epoch-milliseconds timestamp
pub fn day_index(epoch_millis: i64) -> i64 {
    epoch_millis.div_euclid(MILLIS_PER_DAY)
}

/// Decides whether an install or session event should be sent.
#[derive(Clone)]
pub struct SessionGate {
    store: Arc<dyn MarkerStore>,
}

impl SessionGate {
    pub fn new(store: Arc<dyn MarkerStore>) -> Self {
        Self { store }
    }

    /// Consult the persisted marker for a registration at `now_millis`.
    pub fn decide(&self, now_millis: i64) -> SessionDecision {
        let Some(last) = self.last_registered() else {
            return SessionDecision::Install;
        };

        if day_index(now_millis) == day_index(last) {
            SessionDecision::Skip
        } else {
            SessionDecision::Session
        }
    }

    /// The persisted registration timestamp, if present and numeric.
    pub fn last_registered(&self) -> Option<i64> {
        let raw = self.store.get_string(LAST_SESSION_KEY, "");
        let parsed = parse_marker(&raw);
        if parsed.is_none() && !raw.is_empty() {
            tracing::warn!(marker = %raw, "Ignoring unparsable session marker");
        }
        parsed
    }

    /// Persist a successful registration at `timestamp_millis`.
    pub fn record(&self, timestamp_millis: i64) -> crate::Result<()> {
        self.store
            .set_string(LAST_SESSION_KEY, &timestamp_millis.to_string());
        self.store.flush()
    }
}

fn parse_marker(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(millis) = raw.parse::<i64>() {
        return Some(millis);
    }
    raw.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .map(|value| value.floor() as i64)
}
