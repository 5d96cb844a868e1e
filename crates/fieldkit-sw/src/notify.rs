//! Clients and update broadcasts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use url::Url;

use crate::registration::{ServiceWorkerRegistration, UpdateCallback};
use crate::scope::ScopeResolver;
use crate::worker::WorkerId;
use crate::{SwError, SwResult};

// ==================== Update signal ====================

/// Message posted to pages. Serializes as `{"kind":"updated","version":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum UpdateSignal {
    Updated { version: String },
}

impl UpdateSignal {
    pub fn updated(version: impl Into<String>) -> Self {
        Self::Updated {
            version: version.into(),
        }
    }

    pub fn version(&self) -> &str {
        match self {
            UpdateSignal::Updated { version } => version,
        }
    }

    pub fn to_json(&self) -> SwResult<String> {
        serde_json::to_string(self).map_err(|e| SwError::State(e.to_string()))
    }

    pub fn from_json(json: &str) -> SwResult<Self> {
        serde_json::from_str(json).map_err(|e| SwError::State(e.to_string()))
    }
}

// ==================== Client ====================

/// Identifier of an open page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// An open page.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,

    /// Page URL.
    pub url: Url,

    /// Worker currently serving this page's requests.
    pub controller: Option<WorkerId>,

    sender: mpsc::UnboundedSender<UpdateSignal>,
}

impl Client {
    /// Post a message to the page.
    pub fn post_message(&self, signal: UpdateSignal) -> SwResult<()> {
        self.sender
            .send(signal)
            .map_err(|_| SwError::NotFound(format!("client {:?} is closed", self.id)))
    }
}

// ==================== Clients ====================

/// Open pages, shared between the container and its workers.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<RwLock<HashMap<ClientId, Client>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a page. The receiver is the page's message inbox.
    pub async fn open_window(
        &self,
        url: Url,
        controller: Option<WorkerId>,
    ) -> (ClientId, mpsc::UnboundedReceiver<UpdateSignal>) {
        let (sender, inbox) = mpsc::unbounded_channel();
        let id = ClientId::new();
        let client = Client {
            id,
            url,
            controller,
            sender,
        };
        self.clients.write().await.insert(id, client);
        (id, inbox)
    }

    pub async fn close(&self, id: ClientId) -> bool {
        self.clients.write().await.remove(&id).is_some()
    }

    pub async fn get(&self, id: ClientId) -> Option<Client> {
        self.clients.read().await.get(&id).cloned()
    }

    /// Pages under the scope, optionally only those with a controller.
    pub async fn match_all(&self, scope: &ScopeResolver, include_uncontrolled: bool) -> Vec<Client> {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| scope.in_scope(&c.url))
            .filter(|c| include_uncontrolled || c.controller.is_some())
            .cloned()
            .collect()
    }

    /// Make `worker` the controller of every page under the scope.
    pub async fn claim(&self, scope: &ScopeResolver, worker: WorkerId) -> usize {
        let mut clients = self.clients.write().await;
        let mut claimed = 0;
        for client in clients.values_mut().filter(|c| scope.in_scope(&c.url)) {
            client.controller = Some(worker);
            claimed += 1;
        }
        claimed
    }

    /// Pages currently controlled by `worker`.
    pub async fn controlled_by(&self, worker: WorkerId) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| c.controller == Some(worker))
            .count()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }
}

// ==================== Notifier ====================

/// Tells open pages that a new version took over.
#[derive(Debug, Clone)]
pub struct UpdateNotifier {
    clients: ClientRegistry,
}

impl UpdateNotifier {
    pub fn new(clients: ClientRegistry) -> Self {
        Self { clients }
    }

    /// Deliver the update signal to every page under the scope. Closed
    /// pages are skipped. Returns the number of deliveries.
    pub async fn notify_clients(&self, scope: &ScopeResolver, version: &str) -> usize {
        let mut delivered = 0;
        for client in self.clients.match_all(scope, true).await {
            match client.post_message(UpdateSignal::updated(version)) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(client = ?client.id, error = %e, "Update signal dropped"),
            }
        }
        info!(version, delivered, "Clients notified of update");
        delivered
    }

    /// Fire `callback` once per genuine update: a new worker finishing its
    /// install while an older one still controls at least one page.
    pub fn on_installing(&self, registration: &mut ServiceWorkerRegistration, callback: UpdateCallback) {
        registration.add_update_watcher(callback);
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> ScopeResolver {
        ScopeResolver::new(&Url::parse("https://kits.test/repo/").unwrap()).unwrap()
    }

    fn page(path: &str) -> Url {
        Url::parse("https://kits.test/").unwrap().join(path).unwrap()
    }

    #[test]
    fn test_signal_wire_shape() {
        let signal = UpdateSignal::updated("kits-v1.3.1");
        assert_eq!(
            signal.to_json().unwrap(),
            r#"{"kind":"updated","version":"kits-v1.3.1"}"#
        );
        assert_eq!(
            UpdateSignal::from_json(r#"{"kind":"updated","version":"v2"}"#).unwrap(),
            UpdateSignal::updated("v2")
        );
        assert!(UpdateSignal::from_json(r#"{"kind":"other"}"#).is_err());
    }

    #[tokio::test]
    async fn test_claim_only_in_scope() {
        let clients = ClientRegistry::new();
        let (inside, _rx1) = clients.open_window(page("/repo/toolkit-a/"), None).await;
        let (outside, _rx2) = clients.open_window(page("/elsewhere/"), None).await;
        let worker = WorkerId::next();

        assert_eq!(clients.claim(&resolver(), worker).await, 1);
        assert_eq!(clients.get(inside).await.unwrap().controller, Some(worker));
        assert_eq!(clients.get(outside).await.unwrap().controller, None);
        assert_eq!(clients.controlled_by(worker).await, 1);
    }

    #[tokio::test]
    async fn test_match_all_uncontrolled_filter() {
        let clients = ClientRegistry::new();
        let (_a, _rx1) = clients.open_window(page("/repo/"), None).await;
        let (_b, _rx2) = clients.open_window(page("/repo/x"), Some(WorkerId::next())).await;

        assert_eq!(clients.match_all(&resolver(), true).await.len(), 2);
        assert_eq!(clients.match_all(&resolver(), false).await.len(), 1);
    }

    #[tokio::test]
    async fn test_notify_skips_closed_pages() {
        let clients = ClientRegistry::new();
        let (_open, mut inbox) = clients.open_window(page("/repo/"), None).await;
        let (_gone, closed_inbox) = clients.open_window(page("/repo/toolkit-b/"), None).await;
        drop(closed_inbox);

        let notifier = UpdateNotifier::new(clients);
        let delivered = notifier.notify_clients(&resolver(), "v3").await;

        assert_eq!(delivered, 1);
        assert_eq!(inbox.try_recv().unwrap(), UpdateSignal::updated("v3"));
    }

    #[tokio::test]
    async fn test_close_client() {
        let clients = ClientRegistry::new();
        let (id, _rx) = clients.open_window(page("/repo/"), None).await;
        assert!(clients.close(id).await);
        assert!(!clients.close(id).await);
        assert_eq!(clients.len().await, 0);
    }
}
