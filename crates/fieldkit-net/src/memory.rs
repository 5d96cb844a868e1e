//! An in-memory origin.
//!
//! Serves fixed responses by URL, can be switched offline, can slow chosen
//! URLs down, and can leave chosen URLs hanging forever. Every call is recorded so callers can assert
//! whether the network was touched at all.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use tracing::trace;
use url::Url;

use crate::fetcher::{FetchFuture, Fetcher};
use crate::{NetError, Request, Response};

#[derive(Debug, Default)]
struct Origin {
    routes: HashMap<String, (StatusCode, Bytes)>,
    hanging: HashSet<String>,
    delays: HashMap<String, Duration>,
    offline: bool,
    calls: Vec<String>,
}

/// Cloneable handle to a shared in-memory origin.
#[derive(Debug, Clone, Default)]
pub struct MemoryFetcher {
    origin: Arc<Mutex<Origin>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Origin> {
        self.origin.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Serve `body` with `status` for `url`.
    pub fn route(&self, url: &str, status: StatusCode, body: impl Into<Bytes>) -> &Self {
        self.lock()
            .routes
            .insert(normalize(url), (status, body.into()));
        self
    }

    /// Serve `body` with `200 OK` for `url`.
    pub fn serve(&self, url: &str, body: impl Into<Bytes>) -> &Self {
        self.route(url, StatusCode::OK, body)
    }

    /// Stop serving `url`; it falls back to `404`.
    pub fn unroute(&self, url: &str) {
        self.lock().routes.remove(&normalize(url));
    }

    /// Never settle requests for `url`.
    pub fn hang(&self, url: &str) {
        self.lock().hanging.insert(normalize(url));
    }

    /// Answer requests for `url` only after `delay`.
    pub fn delay(&self, url: &str, delay: Duration) {
        self.lock().delays.insert(normalize(url), delay);
    }

    /// Fail every request as unreachable while `offline` is set.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// URLs requested so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of requests issued for `url`.
    pub fn call_count(&self, url: &str) -> usize {
        let url = normalize(url);
        self.lock().calls.iter().filter(|c| **c == url).count()
    }

    /// Number of requests issued for any URL.
    pub fn total_calls(&self) -> usize {
        self.lock().calls.len()
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch(&self, request: Request) -> FetchFuture {
        let key = normalize(request.url.as_str());
        let (hang, delay, offline, route) = {
            let mut origin = self.lock();
            origin.calls.push(key.clone());
            (
                origin.hanging.contains(&key),
                origin.delays.get(&key).copied(),
                origin.offline,
                origin.routes.get(&key).cloned(),
            )
        };
        trace!(url = %key, hang, ?delay, offline, "Memory origin request");

        Box::pin(async move {
            if hang {
                return futures::future::pending().await;
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if offline {
                return Err(NetError::Offline(key));
            }
            let (status, body) = route.unwrap_or((StatusCode::NOT_FOUND, Bytes::new()));
            Ok(Response::new(request.url, status, body))
        })
    }
}

fn normalize(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}
