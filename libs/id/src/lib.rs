//! # berth-id
//!
//! Typed identifiers, parsing, and validation for the berth scheduler.
//!
//! ## Design Principles
//!
//! - Every identifier has a canonical string form with strict parsing
//! - Identifiers roundtrip through serde as plain strings
//! - Types keep apps, slots, tasks and resource-manager handles apart
//!
//! ## Identifier Families
//!
//! - **Generated** (`define_id!`): `{prefix}_{ulid}`, e.g. `ver_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - **Named** (`define_name_id!`): operator-chosen DNS labels, e.g. `web-frontend`
//! - **External** (`define_external_id!`): opaque handles minted by the
//!   resource manager (offers, agents, framework registrations)
//! - **Composite**: [`SlotId`] (`{index}-{app}`) and [`TaskId`]
//!   (`{index}-{app}.{ulid}`), which embed their owner so a status update
//!   can be routed back to its slot without a lookup table

mod composite;
mod error;
mod macros;
mod types;

pub use composite::{SlotId, TaskId};
pub use error::IdError;
pub use macros::validate_label;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
