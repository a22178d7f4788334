//! Send and retry driver
//!
//! A retried dispatch is a chain of short tasks: each attempt runs in its own
//! task and, on a transient failure with retries left, spawns the next one
//! and exits. The terminal status travels along the chain to the receiver.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::serialize::PayloadSerializer;
use crate::types::{DispatchStatus, EventKind, EventParameters};

use super::transport::{HttpRequest, Outcome, Transport};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Retry behavior for one dispatch.
///
/// The retry limit is shared: it is read again after every failed attempt,
/// so lowering it also stops dispatches that are already retrying.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retry_count: Arc<AtomicU32>,
    rebuild_payload: bool,
    initial_delay: Duration,
}

impl RetryPolicy {
    /// Retry up to `max_retry_count` times, immediately, rebuilding each attempt.
    pub fn new(max_retry_count: u32) -> Self {
        Self::with_shared_limit(Arc::new(AtomicU32::new(max_retry_count)))
    }

    /// Retry while the attempt count is below the current value of `limit`.
    pub fn with_shared_limit(limit: Arc<AtomicU32>) -> Self {
        Self {
            max_retry_count: limit,
            rebuild_payload: true,
            initial_delay: Duration::ZERO,
        }
    }

    /// Rebuild the request from its inputs before every attempt (default), or
    /// resend the first request unchanged.
    pub fn with_rebuild_payload(mut self, rebuild: bool) -> Self {
        self.rebuild_payload = rebuild;
        self
    }

    /// Delay before the first retry, doubled per retry (zero = immediate).
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Extra attempts allowed after the first transient failure
    pub fn max_retry_count(&self) -> u32 {
        self.max_retry_count.load(Ordering::Relaxed)
    }

    fn next_delay(&self, attempt: u32, previous: Duration) -> Duration {
        if attempt == 0 {
            self.initial_delay
        } else {
            std::cmp::min(previous * 2, MAX_RETRY_DELAY)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Produces the request for a given zero-based attempt.
#[async_trait]
pub trait RequestBuilder: Send + Sync {
    async fn build(&self, attempt: u32) -> HttpRequest;
}

#[async_trait]
impl<F, Fut> RequestBuilder for F
where
    F: Fn(u32) -> Fut + Send + Sync,
    Fut: Future<Output = HttpRequest> + Send + 'static,
{
    async fn build(&self, attempt: u32) -> HttpRequest {
        self(attempt).await
    }
}

/// Serializes events and drives sends through a [`Transport`].
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn PayloadSerializer>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, serializer: Arc<dyn PayloadSerializer>) -> Self {
        Self {
            transport,
            serializer,
        }
    }

    /// Build a JSON POST carrying `params` as its body.
    pub fn post_request(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        params: &EventParameters,
    ) -> HttpRequest {
        let body = self.serializer.serialize(params);
        tracing::debug!(url = %url, body = %body, "Built POST request");

        headers
            .iter()
            .fold(HttpRequest::post(url, body), |request, (name, value)| {
                request.header(*name, *value)
            })
    }

    /// Send one request.
    pub async fn send(&self, request: HttpRequest) -> Outcome {
        tracing::debug!(method = request.method.as_str(), url = %request.url, "Sending request");
        self.transport.execute(request).await
    }

    /// Send once and report the terminal status.
    pub async fn send_once(&self, kind: EventKind, request: HttpRequest) -> DispatchStatus {
        let outcome = self.send(request).await;
        terminal_status(kind, 1, outcome)
    }

    /// Build and send with retries on transient failures.
    ///
    /// Every attempt, including the first, runs as its own Tokio task, so
    /// nothing is held between attempts. Must be called within a Tokio
    /// runtime. The receiver resolves to the terminal status.
    pub fn send_with_retry(
        &self,
        kind: EventKind,
        policy: RetryPolicy,
        builder: Arc<dyn RequestBuilder>,
    ) -> oneshot::Receiver<DispatchStatus> {
        let (reply, receiver) = oneshot::channel();
        let chain = RetryChain {
            dispatcher: self.clone(),
            kind,
            policy,
            builder,
            first_request: None,
            reply,
        };
        chain.schedule(0, Duration::ZERO);
        receiver
    }
}

/// State carried from one attempt task to the next
struct RetryChain {
    dispatcher: Dispatcher,
    kind: EventKind,
    policy: RetryPolicy,
    builder: Arc<dyn RequestBuilder>,
    /// Reused for every attempt when payloads are not rebuilt
    first_request: Option<HttpRequest>,
    reply: oneshot::Sender<DispatchStatus>,
}

impl RetryChain {
    fn schedule(self, attempt: u32, delay: Duration) {
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.run(attempt, delay).await;
        });
    }

    fn run(mut self, attempt: u32, delay: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let request = match self.first_request.clone() {
                Some(request) if !self.policy.rebuild_payload => request,
                _ => {
                    let request = self.builder.build(attempt).await;
                    if !self.policy.rebuild_payload {
                        self.first_request = Some(request.clone());
                    }
                    request
                }
            };

            let outcome = self.dispatcher.send(request).await;
            let max_retry_count = self.policy.max_retry_count();
            match outcome {
                Outcome::TransientFailure(reason) if attempt < max_retry_count => {
                    tracing::warn!(
                        event = %self.kind,
                        attempt = attempt + 2,
                        max_attempts = max_retry_count + 1,
                        error = %reason,
                        "Transient error, retrying"
                    );
                    let delay = self.policy.next_delay(attempt, delay);
                    self.schedule(attempt + 1, delay);
                }
                outcome => {
                    let status = terminal_status(self.kind, attempt + 1, outcome);
                    // The receiver may have been dropped; the outcome is already logged
                    let _ = self.reply.send(status);
                }
            }
        })
    }
}

fn terminal_status(kind: EventKind, attempts: u32, outcome: Outcome) -> DispatchStatus {
    match outcome {
        Outcome::Success(body) => {
            tracing::info!(event = %kind, attempts, response = %body, "Event delivered");
            DispatchStatus::Sent { attempts }
        }
        Outcome::PermanentFailure(reason) => {
            tracing::error!(event = %kind, error = %reason, "Request rejected, not retrying");
            DispatchStatus::Rejected { reason }
        }
        Outcome::TransientFailure(reason) => {
            if attempts > 1 {
                tracing::error!(
                    event = %kind,
                    attempts,
                    error = %reason,
                    "Retry limit is exceeded, dropping event"
                );
            } else {
                tracing::error!(event = %kind, error = %reason, "Request failed");
            }
            DispatchStatus::Dropped { attempts, reason }
        }
    }
}
