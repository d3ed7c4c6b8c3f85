//! Network access for the worker.

use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderName, HeaderValue};
use std::future::Future;
use std::time::Duration;
use url::{Origin, Url};

use crate::http::{Request, Response, ResponseType};

/// Performs network fetches on behalf of the router.
///
/// A rejected fetch (DNS failure, refused connection, timeout) is an `Err`.
/// Any HTTP status, including 4xx and 5xx, is an `Ok` response.
pub trait Fetcher: Send + Sync + 'static {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

/// Fetcher backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct ReqwestFetcher {
  client: reqwest::Client,
  /// Responses from this origin that were not redirected are `basic`
  origin: Origin,
}

impl ReqwestFetcher {
  pub fn new(origin: &Url, timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("wbs-sw/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      origin: origin.origin(),
    })
  }

  fn response_type(&self, request_url: &Url, final_url: &Url) -> ResponseType {
    if final_url.origin() == self.origin && final_url == request_url {
      ResponseType::Basic
    } else {
      ResponseType::Cors
    }
  }
}

impl Fetcher for ReqwestFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| eyre!("Invalid header name '{}': {}", name, e))?;
      let value = HeaderValue::from_str(value)
        .map_err(|e| eyre!("Invalid value for header {}: {}", name, e))?;
      builder = builder.header(name, value);
    }

    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
    let kind = self.response_type(&request.url, response.url());
    let headers = response
      .headers()
      .iter()
      .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      headers,
      body: body.to_vec(),
      kind,
    })
  }
}
