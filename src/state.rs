//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the store behind its trait object plus the two live services:
//! the room hub and the presence tracker. The tracker carries its own
//! handle to the same store for presence write-through.

use std::sync::Arc;

use crate::services::hub::Hub;
use crate::services::presence::PresenceTracker;
use crate::store::Store;

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum — all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub hub: Hub,
    pub presence: PresenceTracker,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        let presence = PresenceTracker::new(Arc::clone(&store));
        Self { store, hub: Hub::new(), presence }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
