//! Streaming coordinator
//!
//! Drives one chat from prompt to completion: replays history, appends the
//! prompt, races the upstream HTTP trigger against the bus token stream,
//! filters tokens through the thinking parser, and closes the stream on
//! completion, quiescence, timeout, error, or stop.

mod coordinator;
mod stop;
mod sync;

pub use coordinator::{start_chat, ChatParams};
pub use stop::{stop_chat, StopOutcome, StopReason};
pub use sync::sync_session_index;

use crate::bus::BusError;

/// Errors surfaced to the chat endpoints.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("no user is bound; log in first")]
    Unauthenticated,

    #[error("session {session_id} reached its prompt limit ({limit})")]
    LimitReached { session_id: String, limit: usize },

    #[error("bus unavailable: {0}")]
    Unavailable(#[from] BusError),

    #[error("upstream call failed: {0}")]
    Upstream(String),

    #[error("{0}")]
    Validation(String),
}

impl ChatError {
    /// Stable code for client-side handling.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::LimitReached { .. } => "LIMIT_REACHED",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Upstream(_) => "UPSTREAM",
            Self::Validation(_) => "VALIDATION",
        }
    }
}
