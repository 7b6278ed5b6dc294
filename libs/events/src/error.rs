//! Parse errors for the event vocabulary.

use thiserror::Error;

/// A wire name did not map to any known variant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("unknown slot state: {0}")]
    UnknownState(String),

    #[error("unknown app mode: {0}")]
    UnknownMode(String),
}
