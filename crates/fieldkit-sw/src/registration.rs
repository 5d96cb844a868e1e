//! Registrations and the page-side container.

use std::fmt;
use std::sync::Arc;

use fieldkit_net::{Fetcher, Request, RequestMode};
use hashbrown::HashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::banner::ClientPage;
use crate::config::WorkerConfig;
use crate::lifecycle::WorkerState;
use crate::notify::{ClientId, ClientRegistry, UpdateNotifier};
use crate::store::VersionedCacheStore;
use crate::worker::{FetchDisposition, ServiceWorker, WorkerId};
use crate::{SwError, SwResult};

/// Worker scripts from before the toolkits shared one registration.
pub const LEGACY_SCRIPT_SUFFIXES: [&str; 2] = ["toolkit-a/sw.js", "toolkit-b/sw.js"];

// ==================== Update watchers ====================

/// Payload for update callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReady {
    pub scope: Url,
    /// Version controlling pages when the update arrived.
    pub previous: String,
    /// Version that just installed.
    pub incoming: String,
}

/// Callback fired when a genuine update finishes installing.
pub type UpdateCallback = Arc<dyn Fn(&UpdateReady) + Send + Sync>;

// ==================== Registration Options ====================

/// Options for service worker registration.
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Scope URL, absolute or relative to the script. Defaults to the
    /// script's directory.
    pub scope: Option<String>,
}

impl RegistrationOptions {
    pub fn with_scope(scope: impl Into<String>) -> Self {
        Self {
            scope: Some(scope.into()),
        }
    }
}

// ==================== Registration ====================

/// A service worker registration.
pub struct ServiceWorkerRegistration {
    pub scope: Url,

    /// Script the current workers came from.
    pub script_url: Option<Url>,

    pub installing: Option<Arc<ServiceWorker>>,

    /// Installed but not yet in control.
    pub waiting: Option<Arc<ServiceWorker>>,

    pub active: Option<Arc<ServiceWorker>>,

    update_watchers: Vec<UpdateCallback>,
}

impl ServiceWorkerRegistration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            script_url: None,
            installing: None,
            waiting: None,
            active: None,
            update_watchers: Vec::new(),
        }
    }

    pub fn get_active(&self) -> Option<&Arc<ServiceWorker>> {
        self.active.as_ref()
    }

    pub fn add_update_watcher(&mut self, callback: UpdateCallback) {
        self.update_watchers.push(callback);
    }

    pub fn update_watcher_count(&self) -> usize {
        self.update_watchers.len()
    }

    /// Drop every worker. The active one, if any, is superseded.
    pub fn unregister(&mut self) {
        if let Some(worker) = self.active.take() {
            worker.supersede();
        }
        self.waiting = None;
        self.installing = None;
    }
}

impl fmt::Debug for ServiceWorkerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorkerRegistration")
            .field("scope", &self.scope.as_str())
            .field("script_url", &self.script_url.as_ref().map(Url::as_str))
            .field("installing", &self.installing)
            .field("waiting", &self.waiting)
            .field("active", &self.active)
            .field("update_watchers", &self.update_watchers.len())
            .finish()
    }
}

// ==================== Service Worker Container ====================

/// Container events.
#[derive(Debug, Clone)]
pub enum ContainerEvent {
    /// A new worker started installing.
    UpdateFound { scope: String, version: String },
    /// A worker changed state.
    StateChange {
        scope: String,
        worker: WorkerId,
        state: WorkerState,
    },
    /// A registration was removed.
    Unregistered { scope: String },
}

/// Registrations, open pages, and the shared cache store for one origin.
pub struct ServiceWorkerContainer {
    /// Registrations by scope.
    registrations: Arc<RwLock<HashMap<String, ServiceWorkerRegistration>>>,

    /// One lifecycle job at a time per scope, in call order.
    jobs: Mutex<HashMap<String, Arc<Mutex<()>>>>,

    store: VersionedCacheStore,
    notifier: UpdateNotifier,
    fetcher: Arc<dyn Fetcher>,

    /// Event sender for state changes.
    event_tx: mpsc::UnboundedSender<ContainerEvent>,
}

impl ServiceWorkerContainer {
    pub fn new(
        store: VersionedCacheStore,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ContainerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let container = Self {
            registrations: Arc::new(RwLock::new(HashMap::new())),
            jobs: Mutex::new(HashMap::new()),
            store,
            notifier: UpdateNotifier::new(ClientRegistry::new()),
            fetcher,
            event_tx,
        };
        (container, event_rx)
    }

    pub fn store(&self) -> &VersionedCacheStore {
        &self.store
    }

    pub fn clients(&self) -> &ClientRegistry {
        self.notifier.clients()
    }

    pub fn notifier(&self) -> &UpdateNotifier {
        &self.notifier
    }

    fn emit(&self, event: ContainerEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn scope_job(&self, scope: &str) -> Arc<Mutex<()>> {
        let mut jobs = self.jobs.lock().await;
        Arc::clone(jobs.entry(scope.to_string()).or_default())
    }

    /// Register a worker script and run it through install and activate.
    ///
    /// Registering the version that is already active is a no-op. A failed
    /// install leaves the active worker in control. Registrations for one
    /// scope run one after another, so the last call ends in control.
    pub async fn register(
        &self,
        script_url: &str,
        options: RegistrationOptions,
        config: WorkerConfig,
    ) -> SwResult<Arc<ServiceWorker>> {
        let script_url =
            Url::parse(script_url).map_err(|e| SwError::RegistrationFailed(e.to_string()))?;
        let scope = resolve_registration_scope(&script_url, options.scope.as_deref())?;
        let scope_key = scope.to_string();

        let job = self.scope_job(&scope_key).await;
        let _job = job.lock().await;

        let worker = Arc::new(ServiceWorker::new(
            config,
            &scope,
            self.store.clone(),
            Arc::clone(&self.fetcher),
        )?);

        let previous = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .entry(scope_key.clone())
                .or_insert_with(|| ServiceWorkerRegistration::new(scope.clone()));

            if let Some(active) = &registration.active {
                if active.version() == worker.version() {
                    debug!(scope = %scope_key, version = %active.version(), "Already current");
                    return Ok(Arc::clone(active));
                }
            }
            registration.script_url = Some(script_url.clone());
            registration.installing = Some(Arc::clone(&worker));
            registration.active.clone()
        };

        info!(scope = %scope_key, version = %worker.version(), "Update found");
        self.emit(ContainerEvent::UpdateFound {
            scope: scope_key.clone(),
            version: worker.version().to_string(),
        });

        let installed = worker.install().await;
        let watchers = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations.get_mut(&scope_key).ok_or_else(|| {
                SwError::RegistrationFailed(format!("{scope_key} was unregistered during install"))
            })?;
            registration.installing = None;
            if let Err(e) = installed {
                warn!(scope = %scope_key, version = %worker.version(), error = %e, "Install failed; keeping current worker");
                self.emit(ContainerEvent::StateChange {
                    scope: scope_key.clone(),
                    worker: worker.id(),
                    state: WorkerState::Redundant,
                });
                return Err(e);
            }
            registration.waiting = Some(Arc::clone(&worker));
            registration.update_watchers.clone()
        };
        self.emit(ContainerEvent::StateChange {
            scope: scope_key.clone(),
            worker: worker.id(),
            state: WorkerState::Installed,
        });

        // Only an install that replaces a version some page is running counts.
        let genuine_update = match &previous {
            Some(old) => self.clients().controlled_by(old.id()).await > 0,
            None => false,
        };
        if let (true, Some(old)) = (genuine_update, &previous) {
            let ready = UpdateReady {
                scope: scope.clone(),
                previous: old.version().to_string(),
                incoming: worker.version().to_string(),
            };
            for watcher in &watchers {
                watcher(&ready);
            }
        }

        // Old per-toolkit workers go before activation deletes their caches.
        if !is_legacy_script(&script_url) {
            self.unregister_legacy().await;
        }

        // Skip waiting: take over immediately.
        let report = worker.activate(&self.notifier).await?;
        {
            let mut registrations = self.registrations.write().await;
            if let Some(registration) = registrations.get_mut(&scope_key) {
                registration.waiting = None;
                registration.active = Some(Arc::clone(&worker));
            }
        }
        if let Some(old) = previous {
            old.supersede();
        }
        info!(
            scope = %scope_key,
            version = %report.version,
            deleted = report.deleted.len(),
            claimed = report.claimed,
            notified = report.notified,
            "Worker in control"
        );
        self.emit(ContainerEvent::StateChange {
            scope: scope_key,
            worker: worker.id(),
            state: WorkerState::Activated,
        });

        Ok(worker)
    }

    /// Subscribe to genuine updates for a scope. The registration is created
    /// if it does not exist yet.
    pub async fn on_update_ready<F>(&self, scope: &str, callback: F) -> SwResult<()>
    where
        F: Fn(&UpdateReady) + Send + Sync + 'static,
    {
        let scope = Url::parse(scope).map_err(|e| SwError::RegistrationFailed(e.to_string()))?;
        let mut registrations = self.registrations.write().await;
        let registration = registrations
            .entry(scope.to_string())
            .or_insert_with(|| ServiceWorkerRegistration::new(scope));
        self.notifier.on_installing(registration, Arc::new(callback));
        Ok(())
    }

    /// Remove registrations left behind by the per-toolkit workers.
    /// Returns the removed scopes.
    pub async fn unregister_legacy(&self) -> Vec<String> {
        let legacy: Vec<String> = {
            let registrations = self.registrations.read().await;
            registrations
                .iter()
                .filter(|(_, r)| r.script_url.as_ref().is_some_and(is_legacy_script))
                .map(|(scope, _)| scope.clone())
                .collect()
        };

        let mut removed = Vec::new();
        for scope in legacy {
            if self.unregister(&scope).await {
                info!(scope = %scope, "Legacy worker unregistered");
                removed.push(scope);
            }
        }
        removed
    }

    /// Unregister the worker for a scope.
    pub async fn unregister(&self, scope: &str) -> bool {
        let removed = self.registrations.write().await.remove(scope);
        match removed {
            Some(mut registration) => {
                registration.unregister();
                self.emit(ContainerEvent::Unregistered {
                    scope: scope.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Scope of the registration covering `url`, the longest match winning.
    pub async fn get_registration(&self, url: &str) -> Option<String> {
        let url = Url::parse(url).ok()?;
        let registrations = self.registrations.read().await;
        registrations
            .values()
            .filter(|r| covers(&r.scope, &url))
            .max_by_key(|r| r.scope.path().len())
            .map(|r| r.scope.to_string())
    }

    pub async fn get_registrations(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.registrations.read().await.keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// Active worker of the registration covering `url`.
    pub async fn controller_for(&self, url: &Url) -> Option<Arc<ServiceWorker>> {
        let registrations = self.registrations.read().await;
        registrations
            .values()
            .filter(|r| covers(&r.scope, url))
            .max_by_key(|r| r.scope.path().len())
            .and_then(|r| r.active.clone())
    }

    async fn worker_by_id(&self, id: WorkerId) -> Option<Arc<ServiceWorker>> {
        self.registrations
            .read()
            .await
            .values()
            .filter_map(|r| r.active.as_ref())
            .find(|w| w.id() == id)
            .cloned()
    }

    /// Open a page. It is controlled straight away when an active worker
    /// covers its URL.
    pub async fn open_page(&self, url: &str) -> SwResult<ClientPage> {
        let url = Url::parse(url).map_err(|e| SwError::Config(format!("invalid page URL: {e}")))?;
        let controller = self.controller_for(&url).await.map(|w| w.id());
        let (id, inbox) = self.clients().open_window(url, controller).await;
        Ok(ClientPage::new(id, inbox))
    }

    /// Route a request from a page.
    ///
    /// Navigations go to the worker whose scope covers the target; other
    /// requests go to the page's controller. No worker means passthrough.
    pub async fn handle_fetch(
        &self,
        client: Option<ClientId>,
        request: Request,
    ) -> SwResult<FetchDisposition> {
        let worker = if request.mode == RequestMode::Navigate {
            self.controller_for(&request.url).await
        } else {
            match client {
                Some(id) => match self.clients().get(id).await.and_then(|c| c.controller) {
                    Some(controller) => self.worker_by_id(controller).await,
                    None => None,
                },
                None => None,
            }
        };

        match worker {
            Some(worker) => worker.handle_fetch(request).await,
            None => Ok(FetchDisposition::Passthrough),
        }
    }
}

/// Scope for a registration: the explicit option resolved against the
/// script, or the script's directory.
fn resolve_registration_scope(script_url: &Url, scope: Option<&str>) -> SwResult<Url> {
    let scope = match scope {
        Some(s) => script_url
            .join(s)
            .map_err(|e| SwError::RegistrationFailed(e.to_string()))?,
        None => {
            let mut scope = script_url.clone();
            let dir = script_url
                .path()
                .rsplit_once('/')
                .map(|(dir, _)| format!("{dir}/"))
                .unwrap_or_else(|| "/".to_string());
            scope.set_path(&dir);
            scope.set_query(None);
            scope.set_fragment(None);
            scope
        }
    };
    if scope.origin() != script_url.origin() {
        return Err(SwError::RegistrationFailed(format!(
            "scope {scope} is not on the script's origin"
        )));
    }
    Ok(scope)
}

fn is_legacy_script(script_url: &Url) -> bool {
    LEGACY_SCRIPT_SUFFIXES
        .iter()
        .any(|suffix| script_url.path().ends_with(suffix))
}

fn covers(scope: &Url, url: &Url) -> bool {
    scope.origin() == url.origin() && url.path().starts_with(scope.path())
}
