//! Event delivery
//!
//! Requests go out through a [`Transport`]; each attempt is classified as an
//! [`Outcome`]:
//!
//! - **Success:** 2xx response
//! - **Transient failure:** connectivity, timeout or DNS error. Retried for
//!   purchases, up to the configured retry count.
//! - **Permanent failure:** the server answered with an error. Logged, never retried.
//!
//! Nothing here surfaces errors to the host application; terminal states are
//! reported as a [`crate::DispatchStatus`] and in the logs.

mod dispatcher;
mod transport;

pub use dispatcher::{Dispatcher, RequestBuilder, RetryPolicy};
pub use transport::{HttpMethod, HttpRequest, HttpTransport, Outcome, Transport};
