//! Worker configuration

use std::path::Path;
use std::time::Duration;

use fieldkit_common::CommonError;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{SwError, SwResult};

/// A bundled toolkit with its own entry document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubApp {
    /// Path prefix under the scope, without slashes (e.g. `toolkit-a`)
    pub prefix: String,

    /// Entry document relative to the scope
    pub entry: String,
}

impl SubApp {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            entry: format!("{prefix}/index.html"),
        }
    }
}

/// Everything a worker instance needs besides its scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Release tag; must change on every deploy
    pub version: String,

    /// Scope-relative paths fetched on install
    pub precache: Vec<String>,

    /// Root entry document, the last navigation fallback
    pub root_entry: String,

    /// Toolkits with their own fallback documents
    pub sub_apps: Vec<SubApp>,

    /// Cross-origin hosts eligible for cache-first
    pub cross_origin_allow_list: Vec<String>,

    /// Per-request network deadline; `None` waits indefinitely
    pub fetch_timeout_ms: Option<u64>,

    /// Background sync tag this worker answers
    pub sync_tag: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            version: "kits-v1.3.1".to_string(),
            precache: [
                "index.html",
                "app.js",
                "manifest.json",
                "sw.js",
                "assets/uhas.jpg",
                "assets/hpi.png",
                "assets/kits-icon.svg",
                "assets/cpmr.png",
                "assets/ghs.jpg",
                "assets/hero.jpg",
                "toolkit-a/index.html",
                "toolkit-b/index.html",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            root_entry: "index.html".to_string(),
            sub_apps: vec![SubApp::new("toolkit-a"), SubApp::new("toolkit-b")],
            cross_origin_allow_list: [
                "cdnjs.cloudflare.com",
                "fonts.googleapis.com",
                "fonts.gstatic.com",
                "bootstrapcdn.com",
                "cdn.jsdelivr.net",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            fetch_timeout_ms: None,
            sync_tag: "background-sync".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json(json: &str) -> SwResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CommonError::config_with_source("invalid worker config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a JSON file.
    pub fn load(path: &Path) -> SwResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            CommonError::config_with_source(format!("reading {}", path.display()), e)
        })?;
        Self::from_json(&json)
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }

    /// Reject configurations that could never serve an offline shell.
    pub fn validate(&self) -> SwResult<()> {
        if self.version.trim().is_empty() {
            return Err(SwError::Config("version tag must not be empty".to_string()));
        }
        if self.version.contains('/') {
            return Err(SwError::Config(format!(
                "version tag '{}' must not contain '/'",
                self.version
            )));
        }
        if !self.precache.iter().any(|p| same_path(p, &self.root_entry)) {
            return Err(SwError::Config(format!(
                "root entry '{}' is not in the precache manifest",
                self.root_entry
            )));
        }
        for app in &self.sub_apps {
            if app.prefix.is_empty() || app.prefix.contains('/') {
                return Err(SwError::Config(format!(
                    "sub-app prefix '{}' must be a single path segment",
                    app.prefix
                )));
            }
            if !self.precache.iter().any(|p| same_path(p, &app.entry)) {
                warn!(
                    prefix = %app.prefix,
                    entry = %app.entry,
                    "Sub-app entry is not precached; offline navigations will use the root entry"
                );
            }
        }
        Ok(())
    }
}

fn same_path(a: &str, b: &str) -> bool {
    a.trim_start_matches('/') == b.trim_start_matches('/')
}
