//! The network seam and its reqwest-backed implementation.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use tracing::{debug, info, trace};

use crate::{NetError, Request, Response};

/// Future returned by [`Fetcher::fetch`].
///
/// Boxed and `'static` so callers can move an in-flight fetch onto a
/// background task.
pub type FetchFuture = BoxFuture<'static, Result<Response, NetError>>;

/// Something that can perform a network round trip.
///
/// An `Err` means the network could not be reached at all. Error statuses
/// come back as `Ok` responses with a non-2xx status.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch(&self, request: Request) -> FetchFuture;
}

impl<F: Fetcher + ?Sized> Fetcher for Arc<F> {
    fn fetch(&self, request: Request) -> FetchFuture {
        (**self).fetch(request)
    }
}

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Client-wide timeout. `None` leaves slow requests pending.
    pub default_timeout: Option<Duration>,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Enable cookies.
    pub cookies_enabled: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("FieldKit-SW/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "en-US,en;q=0.9".to_string(),
            default_timeout: None,
            max_redirects: 10,
            cookies_enabled: false,
        }
    }
}

/// [`Fetcher`] over a live HTTP connection.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_store(config.cookies_enabled);
        if let Some(timeout) = config.default_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self { client, config })
    }

    /// The configuration this fetcher was built with.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, request: Request) -> FetchFuture {
        let client = self.client.clone();
        let accept_language = self.config.accept_language.clone();

        Box::pin(async move {
            debug!(url = %request.url, method = %request.method, "Fetching resource");

            let mut req_builder = client.request(request.method.clone(), request.url.clone());
            for (name, value) in request.headers.iter() {
                req_builder = req_builder.header(name, value);
            }
            req_builder = req_builder.header("Accept-Language", accept_language);
            if let Some(body) = request.body {
                req_builder = req_builder.body(body);
            }

            let response = req_builder.send().await?;

            let status = response.status();
            let headers = response.headers().clone();
            let url = response.url().clone();
            let body = response.bytes().await?;

            trace!(
                url = %url,
                status = %status,
                body_len = body.len(),
                "Response received"
            );

            Ok(Response {
                url,
                status,
                headers,
                body,
            })
        })
    }
}
