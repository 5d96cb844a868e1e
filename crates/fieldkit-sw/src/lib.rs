//! # FieldKit Service Worker
//!
//! The offline cache layer behind the FieldKit portal and its two bundled
//! toolkits.
//!
//! ## Features
//!
//! - **Versioned generations**: `static-<tag>` and `runtime-<tag>` buckets,
//!   garbage-collected on activation
//! - **Classification**: every request maps to one caching strategy or passes
//!   straight through
//! - **Strategies**: cache-first, network-first with app-shell fallback,
//!   stale-while-revalidate
//! - **Lifecycle**: atomic precache on install, GC, claim, then notify on
//!   activate
//! - **Update notification**: broadcast to open pages plus a dismissible
//!   banner model on the page side
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     │
//!     ├── ServiceWorkerRegistration (per scope)
//!     │       ├── installing / waiting / active (ServiceWorker)
//!     │       └── update watchers
//!     │
//!     └── ClientRegistry ──► UpdateNotifier ──► ClientPage + UpdateBanner
//!
//! ServiceWorker
//!     ├── RequestClassifier ──► CacheStrategyEngine ──► VersionedCacheStore
//!     └── LifecycleController ─────────────────────────┘
//! ```

use fieldkit_common::CommonError;
use fieldkit_net::NetError;
use thiserror::Error;

pub mod banner;
pub mod classify;
pub mod config;
pub mod lifecycle;
pub mod notify;
pub mod registration;
pub mod scope;
pub mod store;
pub mod strategy;
pub mod worker;

pub use banner::{BannerAction, BannerState, ClientPage, UpdateBanner};
pub use classify::{AllowList, RequestClass, RequestClassifier};
pub use config::{SubApp, WorkerConfig};
pub use lifecycle::{
    ActivationReport, InstallReport, LifecycleController, PrecacheManifest, WorkerState,
};
pub use notify::{ClientId, ClientRegistry, UpdateNotifier, UpdateSignal};
pub use registration::{
    ContainerEvent, RegistrationOptions, ServiceWorkerContainer, ServiceWorkerRegistration,
    UpdateCallback, UpdateReady, LEGACY_SCRIPT_SUFFIXES,
};
pub use scope::{ScopePath, ScopeResolver};
pub use store::{CacheEntry, CachePurpose, GenerationName, RequestKey, VersionedCacheStore};
pub use strategy::{CacheStrategyEngine, ResponseSource, ServedResponse, Strategy};
pub use worker::{FetchDisposition, ServiceWorker, SyncOutcome, WorkerId};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum SwError {
    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Storage quota exceeded: {needed} bytes needed, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },

    #[error("Precache failed for {url}: {reason}")]
    PrecacheFailed { url: String, reason: String },

    #[error("No cached page available for navigation to {0}")]
    NavigationUnavailable(String),

    #[error("No content available for {0}")]
    NoContentAvailable(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Common(#[from] CommonError),

    #[error(transparent)]
    Net(#[from] NetError),
}

/// Result type alias for service worker operations.
pub type SwResult<T> = Result<T, SwError>;
