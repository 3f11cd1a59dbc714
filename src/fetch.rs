// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP fetch primitive.
//!
//! The download engine talks to the network exclusively through the
//! [`Fetcher`] trait: a HEAD/GET request with an optional Range, answered
//! by a status code, lowercased headers, and a streaming body. The default
//! implementation is a thin wrapper over `reqwest`. Cancellation happens
//! by dropping the in-flight future; the engine races every fetch against
//! its per-item cancellation token.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt, TryStreamExt};

use crate::error::FetchError;

/// Connection timeout for the default client.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// HTTP method used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Head,
    Get,
}

/// A single request issued by the engine.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: HttpMethod,
    /// Inclusive byte range for chunked transfers.
    pub range: Option<(u64, u64)>,
}

impl FetchRequest {
    pub fn head(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Head,
            range: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Get,
            range: None,
        }
    }

    pub fn get_range(url: impl Into<String>, start: u64, end: u64) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Get,
            range: Some((start, end)),
        }
    }
}

/// Streaming body type returned by fetchers.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, FetchError>> + Send>>;

/// Response surface the engine consumes: status, lowercased headers, and a
/// chunk-at-a-time body.
pub struct HttpResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: Option<ByteStream>,
}

impl HttpResponse {
    /// Build a response with a streaming body.
    pub fn new(status: u16, headers: HashMap<String, String>, body: ByteStream) -> Self {
        Self {
            status,
            headers: lowercase_keys(headers),
            body: Some(body),
        }
    }

    /// Build a bodiless response (HEAD answers, mocks).
    pub fn without_body(status: u16, headers: HashMap<String, String>) -> Self {
        Self {
            status,
            headers: lowercase_keys(headers),
            body: None,
        }
    }

    /// Build a response from an in-memory buffer. Intended for tests and
    /// non-streaming fetch implementations.
    pub fn from_bytes(status: u16, headers: HashMap<String, String>, data: Vec<u8>) -> Self {
        let stream = futures_util::stream::iter(vec![Ok(Bytes::from(data))]);
        Self::new(status, headers, Box::pin(stream))
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Header lookup by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Next body chunk, or `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, FetchError> {
        match self.body.as_mut() {
            Some(stream) => stream.next().await.transpose(),
            None => Ok(None),
        }
    }

    /// Drain the remaining body into one buffer.
    pub async fn bytes(mut self) -> Result<Vec<u8>, FetchError> {
        let mut buffer = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer)
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body.is_some().then_some("<stream>"))
            .finish()
    }
}

fn lowercase_keys(headers: HashMap<String, String>) -> HashMap<String, String> {
    headers
        .into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect()
}

/// The network seam injected into the download engine.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<HttpResponse, FetchError>;
}

/// Default fetcher backed by `reqwest` with streaming bodies.
///
/// Payloads are opaque to the manager, so no transparent decompression is
/// configured; a `Content-Encoding` other than identity simply makes the
/// transfer size unknowable for progress purposes.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| FetchError::InvalidRequest(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Wrap an existing client (custom TLS, proxies, default headers).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<HttpResponse, FetchError> {
        let method = match request.method {
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Get => reqwest::Method::GET,
        };

        let mut builder = self.client.request(method, &request.url);
        if let Some((start, end)) = request.range {
            builder = builder.header(reqwest::header::RANGE, format!("bytes={}-{}", start, end));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }

        let body: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map_err(|e| FetchError::Network(e.to_string())),
        );

        Ok(HttpResponse::new(status, headers, body))
    }
}
