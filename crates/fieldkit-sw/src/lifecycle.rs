//! Install and activate.
//!
//! ```text
//! Parsed ─► Installing ─► Installed ─► Activating ─► Activated ─► Superseded
//!               │
//!               └─► Redundant (precache failed)
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fieldkit_net::{Fetcher, Request, Response};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::WorkerConfig;
use crate::notify::UpdateNotifier;
use crate::scope::ScopeResolver;
use crate::store::{GenerationName, RequestKey, VersionedCacheStore};
use crate::strategy::fetch_with_deadline;
use crate::worker::WorkerId;
use crate::{SwError, SwResult};

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WorkerState {
    /// Constructed, nothing run yet.
    #[default]
    Parsed,
    /// Precaching.
    Installing,
    /// Precache complete, waiting to activate.
    Installed,
    /// Purging stale generations and claiming pages.
    Activating,
    /// Serving fetches.
    Activated,
    /// Replaced by a newer version.
    Superseded,
    /// Install failed; never served anything.
    Redundant,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Superseded | WorkerState::Redundant)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Parsed => "parsed",
            WorkerState::Installing => "installing",
            WorkerState::Installed => "installed",
            WorkerState::Activating => "activating",
            WorkerState::Activated => "activated",
            WorkerState::Superseded => "superseded",
            WorkerState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

/// Scope-relative paths fetched on install.
#[derive(Debug, Clone, Default)]
pub struct PrecacheManifest {
    entries: Vec<String>,
}

impl PrecacheManifest {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    /// Absolute URLs in manifest order, duplicates dropped.
    pub fn resolve(&self, resolver: &ScopeResolver) -> SwResult<Vec<Url>> {
        let mut urls: Vec<Url> = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let url = resolver.resolve_url(entry)?;
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        Ok(urls)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of a successful install.
#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub version: String,
    pub precached: usize,
    /// Take over without waiting for old pages to close.
    pub skip_waiting: bool,
}

/// Outcome of a successful activation.
#[derive(Debug, Clone, Serialize)]
pub struct ActivationReport {
    pub version: String,
    /// Generations removed, in store order.
    pub deleted: Vec<String>,
    pub claimed: usize,
    pub notified: usize,
}

/// Drives one worker instance through install and activate.
pub struct LifecycleController {
    worker: WorkerId,
    version: String,
    static_generation: GenerationName,
    store: VersionedCacheStore,
    fetcher: Arc<dyn Fetcher>,
    resolver: ScopeResolver,
    manifest: PrecacheManifest,
    fetch_timeout: Option<Duration>,
    state: watch::Sender<WorkerState>,
}

impl LifecycleController {
    pub fn new(
        worker: WorkerId,
        config: &WorkerConfig,
        resolver: ScopeResolver,
        store: VersionedCacheStore,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Parsed);
        Self {
            worker,
            version: config.version.clone(),
            static_generation: GenerationName::static_for(&config.version),
            store,
            fetcher,
            resolver,
            manifest: PrecacheManifest::new(config.precache.iter().cloned()),
            fetch_timeout: config.fetch_timeout(),
            state,
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    fn transition(&self, allowed_from: &[WorkerState], to: WorkerState) -> SwResult<()> {
        let current = self.state();
        if !allowed_from.contains(&current) {
            return Err(SwError::State(format!(
                "worker {} cannot move from {current} to {to}",
                self.version
            )));
        }
        debug!(version = %self.version, from = %current, %to, "Worker state change");
        self.state.send_replace(to);
        Ok(())
    }

    /// Precache every manifest entry into the static generation.
    ///
    /// All-or-nothing: one failed fetch or error status fails the install and
    /// leaves the store untouched.
    pub async fn install(&self) -> SwResult<InstallReport> {
        self.transition(&[WorkerState::Parsed], WorkerState::Installing)?;
        info!(version = %self.version, entries = self.manifest.len(), "Installing");

        match self.precache().await {
            Ok(precached) => {
                self.transition(&[WorkerState::Installing], WorkerState::Installed)?;
                info!(version = %self.version, precached, "Installed");
                Ok(InstallReport {
                    version: self.version.clone(),
                    precached,
                    skip_waiting: true,
                })
            }
            Err(e) => {
                warn!(version = %self.version, error = %e, "Install failed");
                self.state.send_replace(WorkerState::Redundant);
                Err(e)
            }
        }
    }

    async fn precache(&self) -> SwResult<usize> {
        let urls = self.manifest.resolve(&self.resolver)?;
        let fetches = urls.into_iter().map(|url| self.precache_one(url));
        let entries = try_join_all(fetches).await?;
        let count = entries.len();
        self.store
            .replace_generation(&self.static_generation, entries)
            .await?;
        Ok(count)
    }

    async fn precache_one(&self, url: Url) -> SwResult<(RequestKey, Response)> {
        let key = RequestKey::for_url(&url);
        let response = fetch_with_deadline(&self.fetcher, Request::get(url.clone()), self.fetch_timeout)
            .await
            .map_err(|e| SwError::PrecacheFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        if !response.ok() {
            return Err(SwError::PrecacheFailed {
                url: url.to_string(),
                reason: format!("status {}", response.status),
            });
        }
        Ok((key, response))
    }

    /// Purge stale generations, claim pages, then notify them. In that order.
    pub async fn activate(&self, notifier: &UpdateNotifier) -> SwResult<ActivationReport> {
        self.transition(&[WorkerState::Installed], WorkerState::Activating)?;

        let mut deleted = Vec::new();
        for name in self.store.generation_names().await {
            let current = GenerationName::parse(&name).is_some_and(|g| g.tag() == self.version);
            if !current && self.store.delete_generation(&name).await {
                deleted.push(name);
            }
        }
        if !deleted.is_empty() {
            info!(version = %self.version, ?deleted, "Stale generations purged");
        }

        let claimed = notifier.clients().claim(&self.resolver, self.worker).await;
        self.transition(&[WorkerState::Activating], WorkerState::Activated)?;
        info!(version = %self.version, claimed, "Activated");

        let notified = notifier.notify_clients(&self.resolver, &self.version).await;

        Ok(ActivationReport {
            version: self.version.clone(),
            deleted,
            claimed,
            notified,
        })
    }

    /// Mark this instance as replaced by a newer version.
    pub fn supersede(&self) {
        if self.state() == WorkerState::Activated {
            self.state.send_replace(WorkerState::Superseded);
            info!(version = %self.version, "Superseded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ClientRegistry;
    use fieldkit_net::MemoryFetcher;
    use http::StatusCode;

    const SCOPE: &str = "https://kits.test/repo/";

    fn config(version: &str) -> WorkerConfig {
        WorkerConfig {
            precache: vec!["index.html".into(), "app.js".into(), "toolkit-a/index.html".into()],
            sub_apps: vec![],
            ..WorkerConfig::default().with_version(version)
        }
    }

    fn serve_all(origin: &MemoryFetcher) {
        for path in ["index.html", "app.js", "toolkit-a/index.html"] {
            origin.serve(&format!("{SCOPE}{path}"), path.to_string());
        }
    }

    fn controller(
        version: &str,
        store: &VersionedCacheStore,
        origin: &MemoryFetcher,
    ) -> LifecycleController {
        let resolver = ScopeResolver::new(&Url::parse(SCOPE).unwrap()).unwrap();
        LifecycleController::new(
            WorkerId::next(),
            &config(version),
            resolver,
            store.clone(),
            Arc::new(origin.clone()),
        )
    }

    #[test]
    fn test_manifest_resolution_is_idempotent() {
        let resolver = ScopeResolver::new(&Url::parse("https://kits.test/repo//").unwrap()).unwrap();
        let manifest = PrecacheManifest::new(["index.html", "/app.js", "index.html"]);
        let first = manifest.resolve(&resolver).unwrap();
        let second = manifest.resolve(&resolver).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].as_str(), "https://kits.test/repo/app.js");
    }

    #[tokio::test]
    async fn test_install_precaches_everything() {
        let store = VersionedCacheStore::new();
        let origin = MemoryFetcher::new();
        serve_all(&origin);

        let lifecycle = controller("v1", &store, &origin);
        let report = lifecycle.install().await.unwrap();

        assert_eq!(report.precached, 3);
        assert!(report.skip_waiting);
        assert_eq!(lifecycle.state(), WorkerState::Installed);
        assert_eq!(store.entry_count("static-v1").await, Some(3));
    }

    #[tokio::test]
    async fn test_install_is_atomic() {
        let store = VersionedCacheStore::new();
        let origin = MemoryFetcher::new();
        serve_all(&origin);
        origin.route(&format!("{SCOPE}app.js"), StatusCode::INTERNAL_SERVER_ERROR, "");

        let lifecycle = controller("v1", &store, &origin);
        let err = lifecycle.install().await.unwrap_err();

        assert!(matches!(err, SwError::PrecacheFailed { .. }));
        assert_eq!(lifecycle.state(), WorkerState::Redundant);
        assert_eq!(store.entry_count("static-v1").await, None);
    }

    #[tokio::test]
    async fn test_install_offline_fails() {
        let store = VersionedCacheStore::new();
        let origin = MemoryFetcher::new();
        origin.set_offline(true);

        let lifecycle = controller("v1", &store, &origin);
        assert!(lifecycle.install().await.is_err());
        assert!(lifecycle.state().is_terminal());
    }

    #[tokio::test]
    async fn test_activate_requires_install() {
        let store = VersionedCacheStore::new();
        let origin = MemoryFetcher::new();
        let lifecycle = controller("v1", &store, &origin);
        let notifier = UpdateNotifier::new(ClientRegistry::new());

        assert!(matches!(
            lifecycle.activate(&notifier).await,
            Err(SwError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_activate_purges_claims_notifies() {
        let store = VersionedCacheStore::new();
        for name in ["static-v1", "runtime-v1", "runtime-v2", "static-v10", "thumbnails"] {
            store.open(name).await;
        }
        let origin = MemoryFetcher::new();
        serve_all(&origin);
        let clients = ClientRegistry::new();
        let (page, mut inbox) = clients
            .open_window(Url::parse(SCOPE).unwrap(), None)
            .await;
        let notifier = UpdateNotifier::new(clients.clone());

        let lifecycle = controller("v2", &store, &origin);
        let mut states = lifecycle.subscribe();
        lifecycle.install().await.unwrap();
        let report = lifecycle.activate(&notifier).await.unwrap();

        assert_eq!(
            report.deleted,
            vec!["static-v1", "runtime-v1", "static-v10", "thumbnails"]
        );
        assert_eq!(store.generation_names().await, vec!["runtime-v2", "static-v2"]);
        assert_eq!(report.claimed, 1);
        assert!(clients.get(page).await.unwrap().controller.is_some());
        assert_eq!(inbox.try_recv().unwrap().version(), "v2");
        assert_eq!(*states.borrow_and_update(), WorkerState::Activated);
    }

    #[tokio::test]
    async fn test_supersede_only_from_activated() {
        let store = VersionedCacheStore::new();
        let origin = MemoryFetcher::new();
        let lifecycle = controller("v1", &store, &origin);

        lifecycle.supersede();
        assert_eq!(lifecycle.state(), WorkerState::Parsed);
    }
}
