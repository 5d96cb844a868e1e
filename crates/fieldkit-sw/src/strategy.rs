//! Fetch strategies.
//!
//! | Class                | Strategy                         |
//! |----------------------|----------------------------------|
//! | `CrossOriginAllowed` | cache-first                      |
//! | `Navigation`         | network-first with shell fallback|
//! | `StaticAsset`        | cache-first                      |
//! | `Dynamic`            | stale-while-revalidate           |
//!
//! A failed cache write in cache-first is handled like a failed fetch and
//! takes the offline branch. Navigations always return a fresh page, stored
//! or not.

use std::sync::Arc;
use std::time::Duration;

use fieldkit_common::{maybe_timeout, CommonError};
use fieldkit_net::{Destination, Fetcher, NetError, Request, Response};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::classify::RequestClass;
use crate::config::WorkerConfig;
use crate::scope::ScopeResolver;
use crate::store::{GenerationName, RequestKey, VersionedCacheStore};
use crate::{SwError, SwResult};

/// The three caching strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
}

impl Strategy {
    /// Dispatch table from request class to strategy.
    pub fn for_class(class: RequestClass) -> Self {
        match class {
            RequestClass::CrossOriginAllowed => Strategy::CacheFirst,
            RequestClass::Navigation => Strategy::NetworkFirst,
            RequestClass::StaticAsset => Strategy::CacheFirst,
            RequestClass::Dynamic => Strategy::StaleWhileRevalidate,
        }
    }
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Fresh from the network.
    Network,
    /// Exact match in a cache generation.
    Cache,
    /// A cached entry document standing in for the requested page.
    Fallback,
    /// Synthesized while offline (empty image or 503).
    Placeholder,
}

/// A response plus its provenance.
#[derive(Debug, Clone)]
pub struct ServedResponse {
    pub response: Response,
    pub source: ResponseSource,
}

impl ServedResponse {
    fn new(response: Response, source: ResponseSource) -> Self {
        Self { response, source }
    }
}

/// Offline fallback documents for navigations.
#[derive(Debug, Clone)]
struct NavigationFallback {
    root: RequestKey,
    /// (absolute path prefix ending in `/`, entry document key)
    sub_apps: Vec<(String, RequestKey)>,
}

impl NavigationFallback {
    fn new(config: &WorkerConfig, resolver: &ScopeResolver) -> SwResult<Self> {
        let root = RequestKey::for_url(&resolver.resolve_url(&config.root_entry)?);
        let sub_apps = config
            .sub_apps
            .iter()
            .map(|app| {
                let prefix = resolver.to_absolute(&format!("{}/", app.prefix));
                let entry = RequestKey::for_url(&resolver.resolve_url(&app.entry)?);
                Ok((prefix, entry))
            })
            .collect::<SwResult<Vec<_>>>()?;
        Ok(Self { root, sub_apps })
    }

    /// Candidates in order: the owning sub-app's entry, then the root entry.
    fn chain(&self, path: &str) -> Vec<&RequestKey> {
        let owner = self.sub_apps.iter().find(|(prefix, _)| {
            path.starts_with(prefix.as_str()) || path == prefix.trim_end_matches('/')
        });
        match owner {
            Some((_, entry)) => vec![entry, &self.root],
            None => vec![&self.root],
        }
    }
}

/// Runs the caching strategies against the shared store.
pub struct CacheStrategyEngine {
    store: VersionedCacheStore,
    fetcher: Arc<dyn Fetcher>,
    static_generation: GenerationName,
    runtime_generation: GenerationName,
    fallback: NavigationFallback,
    fetch_timeout: Option<Duration>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheStrategyEngine {
    pub fn new(
        store: VersionedCacheStore,
        fetcher: Arc<dyn Fetcher>,
        config: &WorkerConfig,
        resolver: &ScopeResolver,
    ) -> SwResult<Self> {
        Ok(Self {
            store,
            fetcher,
            static_generation: GenerationName::static_for(&config.version),
            runtime_generation: GenerationName::runtime_for(&config.version),
            fallback: NavigationFallback::new(config, resolver)?,
            fetch_timeout: config.fetch_timeout(),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Serve a classified request with the strategy its class maps to.
    pub async fn respond(&self, class: RequestClass, request: Request) -> SwResult<ServedResponse> {
        let strategy = Strategy::for_class(class);
        debug!(url = %request.url, ?class, ?strategy, "Dispatching request");
        match strategy {
            Strategy::CacheFirst => self.cache_first(request).await,
            Strategy::NetworkFirst => self.network_first(request).await,
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
        }
    }

    /// Any generation, then network into the runtime generation.
    ///
    /// Never fails once the request has a cache key: offline images become an
    /// empty `200`, everything else a `503`.
    pub async fn cache_first(&self, request: Request) -> SwResult<ServedResponse> {
        let key = cache_key(&request)?;
        if let Some(entry) = self.store.match_any(&key).await {
            debug!(key = %key, "Cache hit");
            return Ok(ServedResponse::new(entry.to_response(), ResponseSource::Cache));
        }

        let url = request.url.clone();
        let is_image = request.destination == Destination::Image;

        let failure = match fetch_with_deadline(&self.fetcher, request, self.fetch_timeout).await {
            Ok(response) if !response.ok() => {
                return Ok(ServedResponse::new(response, ResponseSource::Network));
            }
            Ok(response) => {
                match self.store.put(&self.runtime_generation, key, &response).await {
                    Ok(()) => return Ok(ServedResponse::new(response, ResponseSource::Network)),
                    Err(e) => e.to_string(),
                }
            }
            Err(e) => e.to_string(),
        };

        warn!(url = %url, reason = %failure, is_image, "Cache-first miss while offline");
        let placeholder = if is_image {
            Response::empty_ok(url)
        } else {
            Response::offline(url)
        };
        Ok(ServedResponse::new(placeholder, ResponseSource::Placeholder))
    }

    /// Network into the static generation, else the cached shell.
    pub async fn network_first(&self, request: Request) -> SwResult<ServedResponse> {
        let key = cache_key(&request)?;
        let url = request.url.clone();

        match fetch_with_deadline(&self.fetcher, request, self.fetch_timeout).await {
            Ok(response) if !response.ok() => {
                return Ok(ServedResponse::new(response, ResponseSource::Network));
            }
            Ok(response) => {
                if let Err(e) = self.store.put(&self.static_generation, key, &response).await {
                    warn!(url = %url, error = %e, "Navigation not stored");
                }
                return Ok(ServedResponse::new(response, ResponseSource::Network));
            }
            Err(e) => warn!(url = %url, error = %e, "Navigation fetch failed; using offline copy"),
        }

        if let Some(entry) = self.store.match_in(&self.static_generation, &key).await {
            return Ok(ServedResponse::new(entry.to_response(), ResponseSource::Cache));
        }

        for candidate in self.fallback.chain(url.path()) {
            if let Some(entry) = self.store.match_in(&self.static_generation, candidate).await {
                debug!(url = %url, fallback = %candidate, "Serving fallback document");
                return Ok(ServedResponse::new(entry.to_response(), ResponseSource::Fallback));
            }
        }

        Err(SwError::NavigationUnavailable(url.to_string()))
    }

    /// Runtime generation now, refresh in the background.
    ///
    /// With nothing cached the caller waits for the network; if that fails
    /// too the request ends in [`SwError::NoContentAvailable`].
    pub async fn stale_while_revalidate(&self, request: Request) -> SwResult<ServedResponse> {
        let key = cache_key(&request)?;
        let url = request.url.clone();
        let cached = self.store.match_in(&self.runtime_generation, &key).await;

        let refresh = revalidate(
            self.store.clone(),
            Arc::clone(&self.fetcher),
            self.runtime_generation.clone(),
            key,
            request,
            self.fetch_timeout,
        );

        match cached {
            Some(entry) => {
                let handle = tokio::spawn(async move {
                    if let Err(e) = refresh.await {
                        debug!(url = %url, error = %e, "Background refresh failed");
                    }
                });
                let mut background = self.background.lock().await;
                background.retain(|h| !h.is_finished());
                background.push(handle);
                Ok(ServedResponse::new(entry.to_response(), ResponseSource::Cache))
            }
            None => match refresh.await {
                Ok(response) => Ok(ServedResponse::new(response, ResponseSource::Network)),
                Err(e) => {
                    warn!(url = %url, error = %e, "No cached copy and network failed");
                    Err(SwError::NoContentAvailable(url.to_string()))
                }
            },
        }
    }

    /// Wait for every background refresh started so far.
    pub async fn wait_until_idle(&self) {
        loop {
            let pending = std::mem::take(&mut *self.background.lock().await);
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Background refresh task failed");
                }
            }
        }
    }

    /// Background refreshes still running.
    pub async fn pending_refreshes(&self) -> usize {
        self.background
            .lock()
            .await
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }
}

fn cache_key(request: &Request) -> SwResult<RequestKey> {
    RequestKey::for_request(request).ok_or_else(|| {
        SwError::Cache(format!(
            "{} {} has no cache identity",
            request.method, request.url
        ))
    })
}

pub(crate) async fn fetch_with_deadline(
    fetcher: &Arc<dyn Fetcher>,
    request: Request,
    deadline: Option<Duration>,
) -> Result<Response, NetError> {
    match maybe_timeout(deadline, fetcher.fetch(request)).await {
        Ok(result) => result,
        Err(CommonError::Timeout(limit)) => Err(NetError::Timeout(limit)),
        Err(other) => Err(NetError::RequestFailed(other.to_string())),
    }
}

/// Fetch and, on success, overwrite the runtime entry. Concurrent refreshes
/// of one key are last-write-wins.
async fn revalidate(
    store: VersionedCacheStore,
    fetcher: Arc<dyn Fetcher>,
    generation: GenerationName,
    key: RequestKey,
    request: Request,
    deadline: Option<Duration>,
) -> Result<Response, NetError> {
    let response = fetch_with_deadline(&fetcher, request, deadline).await?;
    if response.ok() {
        if let Err(e) = store.put(&generation, key.clone(), &response).await {
            warn!(key = %key, error = %e, "Refreshed response not stored");
        } else {
            debug!(key = %key, "Runtime entry refreshed");
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use fieldkit_net::MemoryFetcher;
    use http::StatusCode;
    use url::Url;

    const SCOPE: &str = "https://kits.test/repo/";

    fn setup() -> (CacheStrategyEngine, VersionedCacheStore, MemoryFetcher) {
        let store = VersionedCacheStore::new();
        let origin = MemoryFetcher::new();
        let resolver = ScopeResolver::new(&Url::parse(SCOPE).unwrap()).unwrap();
        let config = WorkerConfig::default().with_version("v2");
        let engine =
            CacheStrategyEngine::new(store.clone(), Arc::new(origin.clone()), &config, &resolver)
                .unwrap();
        (engine, store, origin)
    }

    fn url(path: &str) -> Url {
        Url::parse(SCOPE).unwrap().join(path).unwrap()
    }

    async fn seed(store: &VersionedCacheStore, generation: &str, path: &str, body: &'static str) {
        let u = url(path);
        store
            .put(
                &GenerationName::parse(generation).unwrap(),
                RequestKey::for_url(&u),
                &Response::new(u, StatusCode::OK, body),
            )
            .await
            .unwrap();
    }

    #[test]
    fn test_dispatch_table() {
        assert_eq!(Strategy::for_class(RequestClass::CrossOriginAllowed), Strategy::CacheFirst);
        assert_eq!(Strategy::for_class(RequestClass::StaticAsset), Strategy::CacheFirst);
        assert_eq!(Strategy::for_class(RequestClass::Navigation), Strategy::NetworkFirst);
        assert_eq!(
            Strategy::for_class(RequestClass::Dynamic),
            Strategy::StaleWhileRevalidate
        );
    }

    #[tokio::test]
    async fn test_cache_first_hit_skips_network() {
        let (engine, store, origin) = setup();
        seed(&store, "static-v1", "app.js", "cached").await;

        let served = engine.cache_first(Request::get(url("app.js"))).await.unwrap();
        assert_eq!(served.source, ResponseSource::Cache);
        assert_eq!(&served.response.body[..], b"cached");
        assert_eq!(origin.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_cache_first_miss_stores_in_runtime() {
        let (engine, store, origin) = setup();
        origin.serve(url("app.js").as_str(), "fresh");

        let served = engine.cache_first(Request::get(url("app.js"))).await.unwrap();
        assert_eq!(served.source, ResponseSource::Network);
        assert_eq!(store.cached_urls("runtime-v2").await, vec![url("app.js").to_string()]);
    }

    #[tokio::test]
    async fn test_cache_first_offline_placeholders() {
        let (engine, _store, origin) = setup();
        origin.set_offline(true);

        let image = Request::get(url("assets/hero.jpg")).destination(Destination::Image);
        let served = engine.cache_first(image).await.unwrap();
        assert_eq!(served.source, ResponseSource::Placeholder);
        assert_eq!(served.response.status, StatusCode::OK);
        assert!(served.response.body.is_empty());

        let script = Request::get(url("app.js")).destination(Destination::Script);
        let served = engine.cache_first(script).await.unwrap();
        assert_eq!(served.response.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_cache_first_store_failure_takes_offline_branch() {
        let store = VersionedCacheStore::with_quota(8);
        let origin = MemoryFetcher::new();
        origin.serve(url("big.css").as_str(), "a rule set far larger than eight bytes");
        let resolver = ScopeResolver::new(&Url::parse(SCOPE).unwrap()).unwrap();
        let config = WorkerConfig::default().with_version("v2");
        let engine =
            CacheStrategyEngine::new(store, Arc::new(origin), &config, &resolver).unwrap();

        let served = engine.cache_first(Request::get(url("big.css"))).await.unwrap();
        assert_eq!(served.source, ResponseSource::Placeholder);
        assert_eq!(served.response.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_network_first_caches_success_in_static() {
        let (engine, store, origin) = setup();
        origin.serve(url("toolkit-a/").as_str(), "<html>a</html>");

        let served = engine
            .network_first(Request::navigate(url("toolkit-a/")))
            .await
            .unwrap();
        assert_eq!(served.source, ResponseSource::Network);
        assert_eq!(store.entry_count("static-v2").await, Some(1));
    }

    #[tokio::test]
    async fn test_network_first_returns_page_when_store_is_full() {
        let store = VersionedCacheStore::with_quota(4);
        let origin = MemoryFetcher::new();
        origin.serve(url("page.html").as_str(), "<html>page</html>");
        let resolver = ScopeResolver::new(&Url::parse(SCOPE).unwrap()).unwrap();
        let config = WorkerConfig::default().with_version("v2");
        let engine =
            CacheStrategyEngine::new(store.clone(), Arc::new(origin), &config, &resolver).unwrap();

        let served = engine
            .network_first(Request::navigate(url("page.html")))
            .await
            .unwrap();
        assert_eq!(served.source, ResponseSource::Network);
        assert_eq!(&served.response.body[..], b"<html>page</html>");
        assert_eq!(store.total_bytes().await, 0);
    }

    #[tokio::test]
    async fn test_failed_background_refresh_keeps_cached_copy() {
        let (engine, store, origin) = setup();
        seed(&store, "runtime-v2", "data/sites.json", "old").await;
        origin.set_offline(true);

        let served = engine
            .stale_while_revalidate(Request::get(url("data/sites.json")))
            .await
            .unwrap();
        assert_eq!(&served.response.body[..], b"old");
        engine.wait_until_idle().await;
        assert_eq!(engine.pending_refreshes().await, 0);
        assert_eq!(store.entry_count("runtime-v2").await, Some(1));
    }

    #[tokio::test]
    async fn test_network_first_error_status_not_cached() {
        let (engine, store, origin) = setup();
        origin.route(url("gone.html").as_str(), StatusCode::NOT_FOUND, "missing");

        let served = engine
            .network_first(Request::navigate(url("gone.html")))
            .await
            .unwrap();
        assert_eq!(served.response.status, StatusCode::NOT_FOUND);
        assert_eq!(store.entry_count("static-v2").await, None);
    }

    #[tokio::test]
    async fn test_network_first_exact_match_before_fallback() {
        let (engine, store, origin) = setup();
        seed(&store, "static-v2", "toolkit-b/report.html", "report").await;
        seed(&store, "static-v2", "toolkit-b/index.html", "toolkit-b").await;
        origin.set_offline(true);

        let served = engine
            .network_first(Request::navigate(url("toolkit-b/report.html")))
            .await
            .unwrap();
        assert_eq!(served.source, ResponseSource::Cache);
        assert_eq!(&served.response.body[..], b"report");
    }

    #[tokio::test]
    async fn test_network_first_outside_sub_app_uses_root() {
        let (engine, store, origin) = setup();
        seed(&store, "static-v2", "index.html", "root").await;
        seed(&store, "static-v2", "toolkit-a/index.html", "toolkit-a").await;
        origin.set_offline(true);

        let served = engine
            .network_first(Request::navigate(url("about/")))
            .await
            .unwrap();
        assert_eq!(served.source, ResponseSource::Fallback);
        assert_eq!(&served.response.body[..], b"root");
    }

    #[tokio::test]
    async fn test_network_first_cold_start_fails() {
        let (engine, _store, origin) = setup();
        origin.set_offline(true);

        let result = engine.network_first(Request::navigate(url(""))).await;
        assert!(matches!(result, Err(SwError::NavigationUnavailable(_))));
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_refreshes_in_background() {
        let (engine, store, origin) = setup();
        seed(&store, "runtime-v2", "data/sites.json", "old").await;
        origin.serve(url("data/sites.json").as_str(), "new");

        let served = engine
            .stale_while_revalidate(Request::get(url("data/sites.json")))
            .await
            .unwrap();
        assert_eq!(&served.response.body[..], b"old");

        engine.wait_until_idle().await;
        let refreshed = engine
            .stale_while_revalidate(Request::get(url("data/sites.json")))
            .await
            .unwrap();
        assert_eq!(&refreshed.response.body[..], b"new");
        engine.wait_until_idle().await;
        assert_eq!(origin.call_count(url("data/sites.json").as_str()), 2);
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_miss_waits_for_network() {
        let (engine, store, origin) = setup();
        origin.serve(url("data/sites.json").as_str(), "first");

        let served = engine
            .stale_while_revalidate(Request::get(url("data/sites.json")))
            .await
            .unwrap();
        assert_eq!(served.source, ResponseSource::Network);
        assert_eq!(store.entry_count("runtime-v2").await, Some(1));
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_offline_without_copy() {
        let (engine, _store, origin) = setup();
        origin.set_offline(true);

        let result = engine
            .stale_while_revalidate(Request::get(url("data/sites.json")))
            .await;
        assert!(matches!(result, Err(SwError::NoContentAvailable(_))));
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_error_status_keeps_old_entry() {
        let (engine, store, origin) = setup();
        seed(&store, "runtime-v2", "data/sites.json", "old").await;
        origin.route(url("data/sites.json").as_str(), StatusCode::BAD_GATEWAY, "");

        engine
            .stale_while_revalidate(Request::get(url("data/sites.json")))
            .await
            .unwrap();
        engine.wait_until_idle().await;

        let entry = store
            .match_in(
                &GenerationName::runtime_for("v2"),
                &RequestKey::for_url(&url("data/sites.json")),
            )
            .await
            .unwrap();
        assert_eq!(&entry.body[..], b"old");
    }

    #[tokio::test]
    async fn test_fetch_timeout_counts_as_offline() {
        let store = VersionedCacheStore::new();
        let origin = MemoryFetcher::new();
        origin.hang(url("slow.js").as_str());
        let resolver = ScopeResolver::new(&Url::parse(SCOPE).unwrap()).unwrap();
        let mut config = WorkerConfig::default().with_version("v2");
        config.fetch_timeout_ms = Some(10);
        let engine =
            CacheStrategyEngine::new(store, Arc::new(origin), &config, &resolver).unwrap();

        let served = engine.cache_first(Request::get(url("slow.js"))).await.unwrap();
        assert_eq!(served.source, ResponseSource::Placeholder);
    }

    #[tokio::test]
    async fn test_post_has_no_cache_identity() {
        let (engine, _store, _origin) = setup();
        let post = Request::post(url("api"), Bytes::new());
        assert!(matches!(engine.cache_first(post).await, Err(SwError::Cache(_))));
    }
}
