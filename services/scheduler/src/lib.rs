//! berth scheduler
//!
//! Offer-based cluster scheduler. Apps are split into numbered slots; each
//! slot waits for a resource offer, reserves part of it, launches a task and
//! follows the task's status updates. Abnormal exits are restarted with
//! backoff, updates roll one slot at a time, and every state change is
//! persisted and published as a lifecycle event.
//!
//! ## Layout
//!
//! - [`state`]: slots, apps, offers, tasks and restart policy
//! - [`store`]: durable state over a key-value backend
//! - [`connector`]: the resource-manager seam plus mock and channel backends
//! - [`scheduler`]: the event loop, handler pipeline and user handle
//! - [`bus`]: lifecycle event fan-out

pub mod bus;
pub mod config;
pub mod connector;
pub mod error;
pub mod scheduler;
pub mod state;
pub mod store;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
pub use store::StateStore;
