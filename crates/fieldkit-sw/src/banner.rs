//! Page-side update banner.
//!
//! The page never reloads on its own. It shows a banner and waits for the
//! user to refresh or dismiss.

use tokio::sync::mpsc;
use tracing::debug;

use crate::notify::{ClientId, UpdateSignal};

/// What the page should do after user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BannerAction {
    Reload,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BannerState {
    #[default]
    Hidden,
    Shown { version: String },
}

/// The "app updated" banner.
#[derive(Debug, Clone, Default)]
pub struct UpdateBanner {
    state: BannerState,
}

impl UpdateBanner {
    pub const MESSAGE: &'static str = "App updated! Refresh to get the latest version.";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &BannerState {
        &self.state
    }

    pub fn is_visible(&self) -> bool {
        matches!(self.state, BannerState::Shown { .. })
    }

    /// Text to render, if the banner is up.
    pub fn message(&self) -> Option<&'static str> {
        self.is_visible().then_some(Self::MESSAGE)
    }

    /// Show the banner for `signal`. Returns `false` if it was already up;
    /// repeated signals never stack a second banner.
    pub fn on_signal(&mut self, signal: &UpdateSignal) -> bool {
        match &mut self.state {
            BannerState::Shown { version } => {
                *version = signal.version().to_string();
                false
            }
            BannerState::Hidden => {
                debug!(version = signal.version(), "Showing update banner");
                self.state = BannerState::Shown {
                    version: signal.version().to_string(),
                };
                true
            }
        }
    }

    /// User chose to refresh.
    pub fn refresh(&mut self) -> Option<BannerAction> {
        if !self.is_visible() {
            return None;
        }
        self.state = BannerState::Hidden;
        Some(BannerAction::Reload)
    }

    /// User closed the banner.
    pub fn dismiss(&mut self) -> bool {
        let was_visible = self.is_visible();
        self.state = BannerState::Hidden;
        was_visible
    }
}

/// An open page: its inbox plus its banner.
#[derive(Debug)]
pub struct ClientPage {
    id: ClientId,
    inbox: mpsc::UnboundedReceiver<UpdateSignal>,
    banner: UpdateBanner,
}

impl ClientPage {
    pub fn new(id: ClientId, inbox: mpsc::UnboundedReceiver<UpdateSignal>) -> Self {
        Self {
            id,
            inbox,
            banner: UpdateBanner::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn banner(&self) -> &UpdateBanner {
        &self.banner
    }

    pub fn banner_mut(&mut self) -> &mut UpdateBanner {
        &mut self.banner
    }

    /// Drain pending messages into the banner. Returns how many arrived.
    pub fn pump(&mut self) -> usize {
        let mut received = 0;
        while let Ok(signal) = self.inbox.try_recv() {
            self.banner.on_signal(&signal);
            received += 1;
        }
        received
    }
}
