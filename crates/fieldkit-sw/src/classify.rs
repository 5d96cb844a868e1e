//! Request classification.
//!
//! Each intercepted request maps to exactly one [`RequestClass`], or to
//! `None` when the worker must leave it alone.

use fieldkit_net::{Destination, Request, RequestMode};
use tracing::trace;
use url::{Origin, Url};

/// How an intercepted request is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
    /// Cross-origin request to an allow-listed asset host.
    CrossOriginAllowed,
    /// Document navigation.
    Navigation,
    /// Same-origin style, script, image, or font.
    StaticAsset,
    /// Everything else same-origin.
    Dynamic,
}

/// Hosts whose assets may be cached cross-origin.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    hosts: Vec<String>,
}

impl AllowList {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(|h| h.as_ref().trim_matches('.').to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    /// Exact host or any subdomain of a listed host.
    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.hosts.iter().any(|allowed| {
            host == *allowed
                || host
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

/// Classifies requests against the worker's own origin.
#[derive(Debug, Clone)]
pub struct RequestClassifier {
    origin: Origin,
    allow_list: AllowList,
}

impl RequestClassifier {
    pub fn new(app_origin: &Url, allow_list: AllowList) -> Self {
        Self {
            origin: app_origin.origin(),
            allow_list,
        }
    }

    /// Classify a request. `None` means bypass the cache layer entirely.
    ///
    /// Checks run in priority order: method, origin, navigation, static
    /// asset. A navigation to `/logo.png` is still a navigation.
    pub fn classify(&self, request: &Request) -> Option<RequestClass> {
        if !request.is_get() {
            trace!(url = %request.url, method = %request.method, "Bypass: not a GET");
            return None;
        }

        if request.url.origin() != self.origin {
            let allowed = request
                .url
                .host_str()
                .is_some_and(|host| self.allow_list.matches(host));
            if !allowed {
                trace!(url = %request.url, "Bypass: cross-origin host not allow-listed");
                return None;
            }
            return Some(RequestClass::CrossOriginAllowed);
        }

        if is_navigation(request) {
            return Some(RequestClass::Navigation);
        }

        if is_static_asset(request) {
            return Some(RequestClass::StaticAsset);
        }

        Some(RequestClass::Dynamic)
    }
}

fn is_navigation(request: &Request) -> bool {
    request.mode == RequestMode::Navigate || request.accepts("text/html")
}

fn is_static_asset(request: &Request) -> bool {
    matches!(
        request.destination,
        Destination::Style | Destination::Script | Destination::Image | Destination::Font
    ) || has_static_extension(request.url.path())
}

/// Extensions served cache-first regardless of destination.
const STATIC_EXTENSIONS: [&str; 10] = [
    "css", "js", "mjs", "png", "jpg", "jpeg", "gif", "webp", "ico", "svg",
];

fn has_static_extension(path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => STATIC_EXTENSIONS
            .iter()
            .any(|known| ext.eq_ignore_ascii_case(known)),
        _ => false,
    }
}
