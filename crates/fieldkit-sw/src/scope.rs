//! Deployment scope and asset path resolution.
//!
//! The app may be hosted under a sub-path (`/<user>/<repo>/`), so every
//! precache and fallback path is built from the registration scope rather
//! than assumed to live at `/`.

use std::fmt;

use url::Url;

use crate::{SwError, SwResult};

/// Scope path: leading and trailing `/`, no repeated separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopePath(String);

impl ScopePath {
    /// Normalize a raw path. `"/app//"` and `"/app"` both become `"/app/"`.
    pub fn parse(raw: &str) -> Self {
        let mut path = collapse_separators(&format!("/{raw}"));
        if !path.ends_with('/') {
            path.push('/');
        }
        Self(path)
    }

    /// The path component of a registration scope URL.
    pub fn from_registration(scope: &Url) -> Self {
        Self::parse(scope.path())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `scope + relative` with duplicate separators collapsed.
    pub fn to_absolute(&self, relative: &str) -> String {
        collapse_separators(&format!("{}{}", self.0, relative))
    }

    /// Whether `path` lies under this scope.
    pub fn contains(&self, path: &str) -> bool {
        collapse_separators(path).starts_with(&self.0)
    }
}

impl fmt::Display for ScopePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn collapse_separators(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut previous_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !previous_slash {
                out.push(c);
            }
            previous_slash = true;
        } else {
            out.push(c);
            previous_slash = false;
        }
    }
    out
}

/// Resolves scope-relative asset names into request targets.
///
/// Computed once when a worker starts and fixed for its lifetime.
#[derive(Debug, Clone)]
pub struct ScopeResolver {
    origin: Url,
    scope: ScopePath,
}

impl ScopeResolver {
    /// Build from the registration scope URL.
    pub fn new(registration_scope: &Url) -> SwResult<Self> {
        if registration_scope.cannot_be_a_base() {
            return Err(SwError::Config(format!(
                "scope {registration_scope} cannot be a base URL"
            )));
        }
        let mut origin = registration_scope.clone();
        origin.set_path("/");
        origin.set_query(None);
        origin.set_fragment(None);

        Ok(Self {
            origin,
            scope: ScopePath::from_registration(registration_scope),
        })
    }

    pub fn resolve_scope(&self) -> ScopePath {
        self.scope.clone()
    }

    /// Origin root, e.g. `https://kits.test/`.
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn to_absolute(&self, relative: &str) -> String {
        self.scope.to_absolute(relative)
    }

    /// Absolute URL for a scope-relative path.
    pub fn resolve_url(&self, relative: &str) -> SwResult<Url> {
        let path = self.to_absolute(relative);
        self.origin
            .join(&path)
            .map_err(|e| SwError::Config(format!("cannot resolve '{relative}': {e}")))
    }

    /// Whether `url` is served from this scope.
    pub fn in_scope(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin() && self.scope.contains(url.path())
    }
}
