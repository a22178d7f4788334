//! # apptilaus-core
//!
//! Event-dispatch engine for the Apptilaus mobile analytics/attribution service.
//!
//! This library provides:
//! - Purchase, install/session and opt-out event construction
//! - Once-per-day install/session registration gating
//! - Device identifier enrichment through an injected provider
//! - HTTP delivery with bounded retries on network failures
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! ```text
//! Apptilaus (facade) → EventBuilder (+ DeviceContext) → Dispatcher → Transport
//!                    ↘ SessionGate (MarkerStore)
//! ```
//!
//! Delivery is best-effort: failures are logged and reported through the
//! returned [`DispatchHandle`], never raised into the host application.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use apptilaus_core::{Apptilaus, Config, FileMarkerStore, Product};
//!
//! # async fn run() -> apptilaus_core::Result<()> {
//! let config = Config::load()?;
//! let client = Apptilaus::builder(config.client)
//!     .marker_store(Arc::new(FileMarkerStore::open(Config::marker_path())?))
//!     .build()?;
//!
//! // Registers install/session in the background
//! client.setup("app-id", "app-token", true)?;
//!
//! let product = Product {
//!     localized_price: 4.99,
//!     iso_currency_code: "USD".to_string(),
//!     store_specific_id: "com.example.gems".to_string(),
//!     transaction_id: "1000000123".to_string(),
//!     receipt: None,
//! };
//! let status = client.purchase(product, vec![]).wait().await;
//! println!("{:?}", status);
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use client::{Apptilaus, ApptilausBuilder, ClientState, CompletionHandler, DispatchHandle};
pub use config::Config;
pub use device::{AdvertisingId, DeviceContextProvider, StaticDeviceProvider};
pub use dispatch::{HttpTransport, Outcome, Transport};
pub use error::{Error, Result};
pub use platform::{Platform, PlatformAdapter};
pub use serialize::{PayloadSerializer, PrettyObjectWriter};
pub use store::{FileMarkerStore, MarkerStore, MemoryMarkerStore};
pub use types::*;

// Public modules
pub mod client;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod logging;
pub mod platform;
pub mod serialize;
pub mod session;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;
