//! Network access as seen by the core.
//!
//! The blocklist refresh, URL install requests and the `GM_xmlhttpRequest`
//! capability all go through a [`Fetcher`]. [`HttpFetcher`] is the reqwest
//! implementation; tests substitute their own.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A failed network request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Fetch of '{url}' failed: {message}")]
pub struct FetchError {
    pub url: String,
    pub message: String,
}

impl FetchError {
    pub fn new(url: impl Into<String>, message: impl ToString) -> Self {
        Self {
            url: url.into(),
            message: message.to_string(),
        }
    }
}

/// HTTP method for requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

/// An outgoing request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpRequest {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl HttpRequest {
    /// A cache-bypassing GET.
    pub fn get(url: impl Into<String>) -> Self {
        let mut headers = HashMap::new();
        headers.insert("Cache-Control".to_string(), "no-cache".to_string());
        Self {
            url: url.into(),
            method: HttpMethod::Get,
            headers,
            body: None,
        }
    }
}

/// Response to an [`HttpRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub type FetchFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, FetchError>> + Send + 'a>>;

/// Network primitive used by the core.
pub trait Fetcher: Send + Sync {
    /// Perform a request and return the full response.
    fn request<'a>(&'a self, request: HttpRequest) -> FetchFuture<'a, HttpResponse>;

    /// GET `url` and return its body; non-2xx statuses are errors.
    fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a, String> {
        Box::pin(async move {
            let response = self.request(HttpRequest::get(url)).await?;
            if !response.is_success() {
                return Err(FetchError::new(url, format!("HTTP {}", response.status)));
            }
            Ok(response.body)
        })
    }
}

/// [`Fetcher`] backed by reqwest.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Fetcher for HttpFetcher {
    fn request<'a>(&'a self, request: HttpRequest) -> FetchFuture<'a, HttpResponse> {
        Box::pin(async move {
            let url = request.url.clone();
            let fail = |e: reqwest::Error| FetchError::new(url.as_str(), e);

            let mut builder = match request.method {
                HttpMethod::Get => self.client.get(&request.url),
                HttpMethod::Post => self.client.post(&request.url),
                HttpMethod::Put => self.client.put(&request.url),
                HttpMethod::Delete => self.client.delete(&request.url),
                HttpMethod::Patch => self.client.patch(&request.url),
                HttpMethod::Head => self.client.head(&request.url),
                HttpMethod::Options => self
                    .client
                    .request(reqwest::Method::OPTIONS, &request.url),
            };

            for (key, value) in &request.headers {
                builder = builder.header(key.as_str(), value.as_str());
            }

            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(fail)?;
            let status = response.status().as_u16();

            let headers: HashMap<String, String> = response
                .headers()
                .iter()
                .filter_map(|(k, v)| {
                    v.to_str()
                        .ok()
                        .map(|val| (k.as_str().to_string(), val.to_string()))
                })
                .collect();

            let body = response.text().await.map_err(fail)?;

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        })
    }
}
