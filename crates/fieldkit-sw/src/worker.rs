//! A single worker version.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fieldkit_net::{Fetcher, Request};
use tokio::sync::watch;
use tracing::{debug, info};
use url::Url;

use crate::classify::{AllowList, RequestClassifier};
use crate::config::WorkerConfig;
use crate::lifecycle::{ActivationReport, InstallReport, LifecycleController, WorkerState};
use crate::notify::UpdateNotifier;
use crate::scope::ScopeResolver;
use crate::store::VersionedCacheStore;
use crate::strategy::{CacheStrategyEngine, ServedResponse};
use crate::SwResult;

/// Unique identifier for a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// What the worker did with an intercepted request.
#[derive(Debug, Clone)]
pub enum FetchDisposition {
    /// Not ours; the page goes to the network directly.
    Passthrough,
    /// Answered by a caching strategy.
    Respond(ServedResponse),
}

impl FetchDisposition {
    pub fn served(&self) -> Option<&ServedResponse> {
        match self {
            FetchDisposition::Respond(served) => Some(served),
            FetchDisposition::Passthrough => None,
        }
    }
}

/// Result of a background sync event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Handled,
    Ignored,
}

/// One version of the service worker, bound to a registration scope.
pub struct ServiceWorker {
    id: WorkerId,
    config: WorkerConfig,
    resolver: ScopeResolver,
    classifier: RequestClassifier,
    engine: CacheStrategyEngine,
    lifecycle: LifecycleController,
}

impl ServiceWorker {
    /// Build a worker for `scope`. The configuration is validated first.
    pub fn new(
        config: WorkerConfig,
        scope: &Url,
        store: VersionedCacheStore,
        fetcher: Arc<dyn Fetcher>,
    ) -> SwResult<Self> {
        config.validate()?;
        let id = WorkerId::next();
        let resolver = ScopeResolver::new(scope)?;
        let classifier = RequestClassifier::new(
            resolver.origin(),
            AllowList::new(&config.cross_origin_allow_list),
        );
        let engine =
            CacheStrategyEngine::new(store.clone(), Arc::clone(&fetcher), &config, &resolver)?;
        let lifecycle = LifecycleController::new(id, &config, resolver.clone(), store, fetcher);

        debug!(%id, version = %config.version, scope = %resolver.resolve_scope(), "Worker created");
        Ok(Self {
            id,
            config,
            resolver,
            classifier,
            engine,
            lifecycle,
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn scope(&self) -> &ScopeResolver {
        &self.resolver
    }

    pub fn state(&self) -> WorkerState {
        self.lifecycle.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.lifecycle.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.state() == WorkerState::Activated
    }

    pub async fn install(&self) -> SwResult<InstallReport> {
        self.lifecycle.install().await
    }

    pub async fn activate(&self, notifier: &UpdateNotifier) -> SwResult<ActivationReport> {
        self.lifecycle.activate(notifier).await
    }

    pub fn supersede(&self) {
        self.lifecycle.supersede();
    }

    /// Handle an intercepted request.
    ///
    /// Only an activated worker answers; anything unclassified passes through.
    pub async fn handle_fetch(&self, request: Request) -> SwResult<FetchDisposition> {
        if !self.is_active() {
            debug!(id = %self.id, state = %self.state(), url = %request.url, "Not active; passing through");
            return Ok(FetchDisposition::Passthrough);
        }
        match self.classifier.classify(&request) {
            Some(class) => {
                let served = self.engine.respond(class, request).await?;
                Ok(FetchDisposition::Respond(served))
            }
            None => Ok(FetchDisposition::Passthrough),
        }
    }

    /// Background sync hook. Only the configured tag is handled.
    pub fn handle_sync(&self, tag: &str) -> SyncOutcome {
        if tag == self.config.sync_tag {
            info!(id = %self.id, tag, "Background sync");
            SyncOutcome::Handled
        } else {
            debug!(id = %self.id, tag, "Ignoring sync tag");
            SyncOutcome::Ignored
        }
    }

    /// Wait for background refreshes started by this worker.
    pub async fn wait_until_idle(&self) {
        self.engine.wait_until_idle().await;
    }
}

impl fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("version", &self.config.version)
            .field("scope", &self.resolver.resolve_scope())
            .field("state", &self.state())
            .finish()
    }
}
