//! # berth-events
//!
//! Lifecycle event vocabulary emitted by the berth scheduler.
//!
//! ## Design Principles
//!
//! - One event per slot state transition and per health-flag change
//! - Events are self-contained: listeners (DNS, load balancers, API caches)
//!   never need to query the scheduler to interpret one
//! - Slot states form a closed enum so every consumer matches exhaustively
//!
//! ## Event Types
//!
//! - Slot state events (`task_state_*`), one per [`SlotState`]
//! - Health events (`task_healthy`, `task_unhealthy`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
