//! Domain services used by the websocket session layer.
//!
//! ARCHITECTURE
//! ============
//! Service modules own fan-out, presence, and message lifecycle logic so
//! the session handler can stay focused on protocol translation and
//! connection plumbing.

pub mod hub;
pub mod message;
pub mod presence;
