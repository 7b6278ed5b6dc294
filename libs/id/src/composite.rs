//! Composite identifiers that embed their owner.
//!
//! A [`SlotId`] is `{index}-{app}` and a [`TaskId`] is `{slot}.{ulid}`.
//! Because app names cannot contain `.`, the last `.` always separates the
//! attempt ULID from the slot, and the first `-` always follows the index.

use std::fmt;
use std::str::FromStr;

use crate::{AppId, IdError, Ulid};

// =============================================================================
// SlotId
// =============================================================================

/// Stable identity of one instance index of an app.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId {
    app_id: AppId,
    index: u32,
}

impl SlotId {
    #[must_use]
    pub fn new(app_id: AppId, index: u32) -> Self {
        Self { app_id, index }
    }

    #[must_use]
    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Parses `{index}-{app}`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let Some((index, app)) = s.split_once('-') else {
            return Err(IdError::MissingSeparator('-'));
        };
        let index = index
            .parse::<u32>()
            .map_err(|_| IdError::InvalidIndex(index.to_string()))?;
        Ok(Self::new(AppId::parse(app)?, index))
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.index, self.app_id)
    }
}

impl FromStr for SlotId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// =============================================================================
// TaskId
// =============================================================================

/// Identity of one placement attempt for a slot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    slot_id: SlotId,
    attempt: Ulid,
}

impl TaskId {
    /// Mints a fresh attempt for `slot_id`.
    #[must_use]
    pub fn new(slot_id: SlotId) -> Self {
        Self {
            slot_id,
            attempt: Ulid::new(),
        }
    }

    #[must_use]
    pub fn slot_id(&self) -> &SlotId {
        &self.slot_id
    }

    #[must_use]
    pub fn attempt(&self) -> Ulid {
        self.attempt
    }

    /// Parses `{index}-{app}.{ulid}`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let Some((slot, attempt)) = s.rsplit_once('.') else {
            return Err(IdError::MissingSeparator('.'));
        };
        let attempt = attempt
            .parse::<Ulid>()
            .map_err(|e| IdError::InvalidUlid(e.to_string()))?;
        Ok(Self {
            slot_id: SlotId::parse(slot)?,
            attempt,
        })
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot_id, self.attempt)
    }
}

impl FromStr for TaskId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

crate::__string_serde!(SlotId);
crate::__string_serde!(TaskId);
