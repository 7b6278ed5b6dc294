//! Typed identifier definitions for scheduler resources.

use crate::{define_external_id, define_id, define_name_id};

// =============================================================================
// Workloads
// =============================================================================

define_name_id!(AppId, 63);
define_id!(VersionId, "ver");

// =============================================================================
// Resource Manager Handles
// =============================================================================

define_external_id!(OfferId);
define_external_id!(AgentId);
define_external_id!(FrameworkId);

// =============================================================================
// Tests
// =============================================================================
