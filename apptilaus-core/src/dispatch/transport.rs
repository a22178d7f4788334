//! HTTP transport for the collection endpoints

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

/// A fully built request, ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: Vec::new(),
            body: Some(body.into()),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Classified result of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// 2xx; carries the response body
    Success(String),
    /// Network-level failure, worth retrying
    TransientFailure(String),
    /// Server/application-level rejection
    PermanentFailure(String),
}

impl From<Result<String>> for Outcome {
    fn from(result: Result<String>) -> Self {
        match result {
            Ok(body) => Outcome::Success(body),
            Err(Error::TransientNetwork(reason)) => Outcome::TransientFailure(reason),
            Err(Error::PermanentRequest(reason)) => Outcome::PermanentFailure(reason),
            Err(other) => Outcome::PermanentFailure(other.to_string()),
        }
    }
}

/// Sends requests and classifies the result.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Outcome;
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http_client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport; without a timeout, reqwest's defaults apply.
    pub fn new(timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let http_client = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }

    async fn send(&self, request: HttpRequest) -> Result<String> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };

        let mut http_request = self.http_client.request(method, &request.url);
        for (name, value) in &request.headers {
            http_request = http_request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            http_request = http_request.body(body);
        }

        let response = http_request
            .send()
            .await
            .map_err(|e| classify_send_error(&e))?;

        let status = response.status();
        if status.is_success() {
            // The server already accepted the event; a lost body must not trigger a resend
            Ok(response.text().await.unwrap_or_else(|e| {
                tracing::warn!(status = %status, error = %e, "Failed to read response body");
                String::new()
            }))
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::PermanentRequest(format!(
                "API error ({}): {}",
                status, error_text
            )))
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: HttpRequest) -> Outcome {
        self.send(request).await.into()
    }
}

/// Malformed requests are permanent; everything else failed on the wire.
fn classify_send_error(error: &reqwest::Error) -> Error {
    if error.is_builder() {
        Error::PermanentRequest(format!("invalid request: {}", error))
    } else if error.is_timeout() {
        Error::TransientNetwork(format!("timeout: {}", error))
    } else if error.is_connect() {
        Error::TransientNetwork(format!("connection failed: {}", error))
    } else {
        Error::TransientNetwork(format!("HTTP request failed: {}", error))
    }
}
