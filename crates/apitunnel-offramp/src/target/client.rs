//! HTTP client for the target service.

use std::time::Duration;

use apitunnel_proto::{RequestHead, is_hop_by_hop};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Response};
use tracing::debug;

use super::config::TargetConfig;
use crate::error::TargetError;

/// Sends tunnelled requests to the configured target.
#[derive(Clone)]
pub struct TargetClient {
    http: reqwest::Client,
    base_url: String,
    response_timeout: Duration,
}

impl TargetClient {
    pub fn new(config: &TargetConfig) -> Result<Self, TargetError> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| TargetError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.base_url(),
            response_timeout: config.response_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issue `head` against the target and wait for the response headers.
    /// The response body is left for the caller to stream.
    pub async fn send(
        &self,
        head: &RequestHead,
        body: Option<reqwest::Body>,
    ) -> Result<Response, TargetError> {
        let method = Method::from_bytes(head.method.as_bytes())
            .map_err(|_| TargetError::InvalidRequest(format!("method {:?}", head.method)))?;
        if !head.uri.starts_with('/') {
            return Err(TargetError::InvalidRequest(format!(
                "request target {:?} is not origin-form",
                head.uri
            )));
        }
        let url = format!("{}{}", self.base_url, head.uri);

        let mut request = self.http.request(method, &url).headers(target_headers(head));
        if let Some(body) = body {
            request = request.body(body);
        }

        debug!(method = %head.method, %url, "Sending request to target");
        match tokio::time::timeout(self.response_timeout, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(TargetError::from_reqwest(&e, self.response_timeout)),
            Err(_) => Err(TargetError::Timeout(self.response_timeout)),
        }
    }
}

fn target_headers(head: &RequestHead) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(head.headers.len());
    for (name, value) in &head.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => debug!(header = %name, "Dropping invalid request header"),
        }
    }
    headers
}

/// End-to-end response headers in wire order.
pub fn response_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}
