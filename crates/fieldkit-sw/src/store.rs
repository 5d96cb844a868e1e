//! Versioned cache generations.
//!
//! A generation is a named bucket of request/response snapshots such as
//! `static-kits-v1.3.1`. Only the controlling worker writes to the store.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use fieldkit_net::{Request, Response};
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::{SwError, SwResult};

// ==================== Generation names ====================

/// What a generation holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePurpose {
    /// Precached app shell plus navigations.
    Static,
    /// Anything cached while serving requests.
    Runtime,
}

impl CachePurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            CachePurpose::Static => "static",
            CachePurpose::Runtime => "runtime",
        }
    }
}

impl fmt::Display for CachePurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `<purpose>-<tag>`, e.g. `runtime-kits-v1.3.1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenerationName {
    purpose: CachePurpose,
    tag: String,
}

impl GenerationName {
    pub fn new(purpose: CachePurpose, tag: impl Into<String>) -> Self {
        Self {
            purpose,
            tag: tag.into(),
        }
    }

    pub fn static_for(tag: &str) -> Self {
        Self::new(CachePurpose::Static, tag)
    }

    pub fn runtime_for(tag: &str) -> Self {
        Self::new(CachePurpose::Runtime, tag)
    }

    /// Parse a stored generation name. Names this worker never wrote return
    /// `None`.
    pub fn parse(name: &str) -> Option<Self> {
        let (purpose, tag) = name.split_once('-')?;
        let purpose = match purpose {
            "static" => CachePurpose::Static,
            "runtime" => CachePurpose::Runtime,
            _ => return None,
        };
        if tag.is_empty() {
            return None;
        }
        Some(Self::new(purpose, tag))
    }

    pub fn purpose(&self) -> CachePurpose {
        self.purpose
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl fmt::Display for GenerationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.purpose, self.tag)
    }
}

// ==================== Keys and entries ====================

/// Normalized request identity: GET plus the absolute URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    method: Method,
    url: String,
}

impl RequestKey {
    /// Key for a request. Only retrieval requests have one.
    pub fn for_request(request: &Request) -> Option<Self> {
        if !request.is_get() {
            return None;
        }
        Some(Self::for_url(&request.url))
    }

    pub fn for_url(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: Method::GET,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A cached response snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// URL the response was served from.
    pub url: Url,

    /// Response status.
    pub status: u16,

    /// Response headers, in arrival order.
    pub headers: Vec<(String, String)>,

    /// Response body.
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,

    /// Store-wide write counter; later writes have larger values.
    pub sequence: u64,
}

impl CacheEntry {
    fn from_response(response: &Response, sequence: u64) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: response.url.clone(),
            status: response.status.as_u16(),
            headers,
            body: response.body.clone(),
            cached_at: now_millis(),
            sequence,
        }
    }

    /// Rebuild a response from the snapshot.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(n, v);
            }
        }
        Response {
            url: self.url.clone(),
            status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            headers,
            body: self.body.clone(),
        }
    }

    /// Approximate storage footprint.
    pub fn size_bytes(&self) -> u64 {
        let header_bytes: usize = self.headers.iter().map(|(n, v)| n.len() + v.len()).sum();
        (self.body.len() + header_bytes + self.url.as_str().len()) as u64
    }
}

// ==================== Cache ====================

/// One generation.
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    entries: HashMap<RequestKey, CacheEntry>,
}

impl Cache {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    pub fn match_request(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    fn put(&mut self, key: RequestKey, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    pub fn delete(&mut self, key: &RequestKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Cached URLs.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|k| k.url()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size_bytes(&self) -> u64 {
        self.entries.values().map(CacheEntry::size_bytes).sum()
    }
}

// ==================== Cache Storage ====================

/// All generations, in creation order.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
    order: Vec<String>,
    quota_bytes: Option<u64>,
    next_sequence: u64,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that refuses writes past `quota_bytes`.
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    /// Open a generation, creating it if needed.
    pub fn open(&mut self, name: &str) -> &mut Cache {
        if !self.caches.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    pub fn delete(&mut self, name: &str) -> bool {
        self.order.retain(|n| n != name);
        self.caches.remove(name).is_some()
    }

    /// Generation names, oldest first.
    pub fn keys(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    /// First match across generations, oldest generation first.
    pub fn match_request(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.order
            .iter()
            .filter_map(|name| self.caches.get(name))
            .find_map(|cache| cache.match_request(key))
    }

    pub fn match_in(&self, name: &str, key: &RequestKey) -> Option<&CacheEntry> {
        self.caches.get(name)?.match_request(key)
    }

    pub fn total_bytes(&self) -> u64 {
        self.caches.values().map(Cache::size_bytes).sum()
    }

    /// Store a successful response. Error statuses are rejected.
    pub fn put(&mut self, name: &str, key: RequestKey, response: &Response) -> SwResult<()> {
        if !response.ok() {
            return Err(SwError::Cache(format!(
                "refusing to cache {} response for {}",
                response.status, key
            )));
        }

        let entry = CacheEntry::from_response(response, self.next_sequence);
        let replaced = self
            .match_in(name, &key)
            .map(CacheEntry::size_bytes)
            .unwrap_or(0);
        self.check_quota(entry.size_bytes(), replaced)?;

        self.next_sequence += 1;
        trace!(cache = name, key = %key, sequence = entry.sequence, "Cache put");
        self.open(name).put(key, entry);
        Ok(())
    }

    /// Swap in a complete generation in one step. Either every entry lands
    /// or the store is left as it was.
    pub fn replace(&mut self, name: &str, entries: Vec<(RequestKey, Response)>) -> SwResult<()> {
        let mut staged = Cache::new(name);
        for (key, response) in entries {
            if !response.ok() {
                return Err(SwError::Cache(format!(
                    "refusing to cache {} response for {}",
                    response.status, key
                )));
            }
            let entry = CacheEntry::from_response(&response, self.next_sequence + staged.len() as u64);
            staged.put(key, entry);
        }

        let replaced = self.caches.get(name).map(Cache::size_bytes).unwrap_or(0);
        self.check_quota(staged.size_bytes(), replaced)?;

        self.next_sequence += staged.len() as u64;
        debug!(cache = name, entries = staged.len(), "Generation replaced");
        if !self.caches.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.caches.insert(name.to_string(), staged);
        Ok(())
    }

    fn check_quota(&self, incoming: u64, freed: u64) -> SwResult<()> {
        let Some(quota) = self.quota_bytes else {
            return Ok(());
        };
        let current = self.total_bytes().saturating_sub(freed);
        if current + incoming > quota {
            return Err(SwError::QuotaExceeded {
                needed: incoming,
                available: quota.saturating_sub(current),
            });
        }
        Ok(())
    }
}

// ==================== Shared handle ====================

/// Async handle to the shared [`CacheStorage`].
///
/// The lock is taken per operation and never held across a network await.
#[derive(Debug, Clone, Default)]
pub struct VersionedCacheStore {
    inner: Arc<RwLock<CacheStorage>>,
}

impl VersionedCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CacheStorage::with_quota(quota_bytes))),
        }
    }

    /// Match in any generation.
    pub async fn match_any(&self, key: &RequestKey) -> Option<CacheEntry> {
        self.inner.read().await.match_request(key).cloned()
    }

    /// Match in one generation.
    pub async fn match_in(&self, name: &GenerationName, key: &RequestKey) -> Option<CacheEntry> {
        self.inner
            .read()
            .await
            .match_in(&name.to_string(), key)
            .cloned()
    }

    pub async fn put(
        &self,
        name: &GenerationName,
        key: RequestKey,
        response: &Response,
    ) -> SwResult<()> {
        self.inner
            .write()
            .await
            .put(&name.to_string(), key, response)
    }

    pub async fn replace_generation(
        &self,
        name: &GenerationName,
        entries: Vec<(RequestKey, Response)>,
    ) -> SwResult<()> {
        self.inner
            .write()
            .await
            .replace(&name.to_string(), entries)
    }

    pub async fn delete_generation(&self, name: &str) -> bool {
        self.inner.write().await.delete(name)
    }

    pub async fn generation_names(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .keys()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Number of entries in a generation, `None` if it does not exist.
    pub async fn entry_count(&self, name: &str) -> Option<usize> {
        self.inner.read().await.get(name).map(Cache::len)
    }

    /// Cached URLs in a generation, sorted.
    pub async fn cached_urls(&self, name: &str) -> Vec<String> {
        let storage = self.inner.read().await;
        let mut urls: Vec<String> = storage
            .get(name)
            .map(|c| c.keys().into_iter().map(str::to_string).collect())
            .unwrap_or_default();
        urls.sort();
        urls
    }

    pub async fn total_bytes(&self) -> u64 {
        self.inner.read().await.total_bytes()
    }

    /// Create an empty generation; used to seed stores in tools and tests.
    pub async fn open(&self, name: &str) {
        self.inner.write().await.open(name);
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn ok(s: &str, body: &'static str) -> Response {
        Response::new(url(s), StatusCode::OK, body)
    }

    #[test]
    fn test_generation_name_round_trip() {
        let name = GenerationName::static_for("kits-v1.3.1");
        assert_eq!(name.to_string(), "static-kits-v1.3.1");

        let parsed = GenerationName::parse("runtime-kits-v1.3.1").unwrap();
        assert_eq!(parsed.purpose(), CachePurpose::Runtime);
        assert_eq!(parsed.tag(), "kits-v1.3.1");

        assert!(GenerationName::parse("images").is_none());
        assert!(GenerationName::parse("static-").is_none());
        assert!(GenerationName::parse("other-v1").is_none());
    }

    #[test]
    fn test_request_key_strips_fragment_and_rejects_post() {
        let a = RequestKey::for_url(&url("https://kits.test/app.js#x"));
        let b = RequestKey::for_url(&url("https://kits.test/app.js"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "GET https://kits.test/app.js");

        let post = Request::post(url("https://kits.test/api"), Bytes::new());
        assert!(RequestKey::for_request(&post).is_none());
    }

    #[test]
    fn test_cache_storage_open_and_delete() {
        let mut storage = CacheStorage::new();
        assert!(!storage.has("static-v1"));

        storage.open("static-v1");
        storage.open("runtime-v1");
        assert_eq!(storage.keys(), vec!["static-v1", "runtime-v1"]);

        assert!(storage.delete("static-v1"));
        assert!(!storage.delete("static-v1"));
        assert_eq!(storage.keys(), vec!["runtime-v1"]);
    }

    #[test]
    fn test_put_rejects_error_status() {
        let mut storage = CacheStorage::new();
        let u = url("https://kits.test/missing.css");
        let response = Response::new(u.clone(), StatusCode::NOT_FOUND, "nope");

        let result = storage.put("runtime-v1", RequestKey::for_url(&u), &response);
        assert!(matches!(result, Err(SwError::Cache(_))));
        assert!(storage.match_request(&RequestKey::for_url(&u)).is_none());
    }

    #[test]
    fn test_match_across_generations_prefers_oldest() {
        let mut storage = CacheStorage::new();
        let u = url("https://kits.test/app.js");
        let key = RequestKey::for_url(&u);
        storage.put("static-v1", key.clone(), &ok(u.as_str(), "old")).unwrap();
        storage.put("runtime-v1", key.clone(), &ok(u.as_str(), "new")).unwrap();

        let hit = storage.match_request(&key).unwrap();
        assert_eq!(&hit.body[..], b"old");
        assert_eq!(&storage.match_in("runtime-v1", &key).unwrap().body[..], b"new");
    }

    #[test]
    fn test_sequence_increases() {
        let mut storage = CacheStorage::new();
        let a = url("https://kits.test/a");
        let b = url("https://kits.test/b");
        storage.put("runtime-v1", RequestKey::for_url(&a), &ok(a.as_str(), "a")).unwrap();
        storage.put("runtime-v1", RequestKey::for_url(&b), &ok(b.as_str(), "b")).unwrap();

        let first = storage.match_in("runtime-v1", &RequestKey::for_url(&a)).unwrap();
        let second = storage.match_in("runtime-v1", &RequestKey::for_url(&b)).unwrap();
        assert!(second.sequence > first.sequence);
    }

    #[test]
    fn test_quota_rejects_oversized_write() {
        let mut storage = CacheStorage::with_quota(64);
        let u = url("https://kits.test/big");
        let big = Response::new(u.clone(), StatusCode::OK, vec![0u8; 128]);

        let result = storage.put("runtime-v1", RequestKey::for_url(&u), &big);
        assert!(matches!(result, Err(SwError::QuotaExceeded { .. })));
        assert_eq!(storage.total_bytes(), 0);
    }

    #[test]
    fn test_replace_is_all_or_nothing() {
        let mut storage = CacheStorage::new();
        let a = url("https://kits.test/a");
        let b = url("https://kits.test/b");
        storage.put("static-v1", RequestKey::for_url(&a), &ok(a.as_str(), "kept")).unwrap();

        let bad = vec![
            (RequestKey::for_url(&a), ok(a.as_str(), "new")),
            (
                RequestKey::for_url(&b),
                Response::new(b.clone(), StatusCode::INTERNAL_SERVER_ERROR, ""),
            ),
        ];
        assert!(storage.replace("static-v1", bad).is_err());
        let kept = storage.match_in("static-v1", &RequestKey::for_url(&a)).unwrap();
        assert_eq!(&kept.body[..], b"kept");

        let good = vec![(RequestKey::for_url(&b), ok(b.as_str(), "b"))];
        storage.replace("static-v1", good).unwrap();
        assert!(storage.match_in("static-v1", &RequestKey::for_url(&a)).is_none());
        assert_eq!(storage.get("static-v1").unwrap().len(), 1);
    }

    #[test]
    fn test_entry_to_response_keeps_headers() {
        let u = url("https://kits.test/style.css");
        let mut response = ok(u.as_str(), "body{}");
        response
            .headers
            .insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/css"));

        let mut storage = CacheStorage::new();
        storage.put("runtime-v1", RequestKey::for_url(&u), &response).unwrap();
        let restored = storage
            .match_request(&RequestKey::for_url(&u))
            .unwrap()
            .to_response();

        assert_eq!(restored.status, StatusCode::OK);
        assert_eq!(restored.headers.get("content-type").unwrap(), "text/css");
        assert_eq!(&restored.body[..], b"body{}");
    }

    #[tokio::test]
    async fn test_shared_store_generation_names() {
        let store = VersionedCacheStore::new();
        store.open("static-v1").await;
        store.open("runtime-v1").await;
        assert_eq!(store.generation_names().await, vec!["static-v1", "runtime-v1"]);
        assert!(store.delete_generation("static-v1").await);
        assert_eq!(store.entry_count("runtime-v1").await, Some(0));
        assert_eq!(store.entry_count("static-v1").await, None);
    }
}
