//! Scheduler errors.

use berth_id::{AppId, VersionId};
use thiserror::Error;

use crate::connector::ConnectorError;
use crate::state::{AppStatus, ValidationError};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("invalid app: {0}")]
    Validation(#[from] ValidationError),

    #[error("app not found: {0}")]
    AppNotFound(AppId),

    #[error("app already exists: {0}")]
    AppExists(AppId),

    #[error("app {app_id} is busy ({status})")]
    AppBusy { app_id: AppId, status: AppStatus },

    #[error("app {0} has no update in progress")]
    NoUpdateInProgress(AppId),

    #[error("version {0} is already current")]
    VersionUnchanged(VersionId),

    #[error("scheduler is not running")]
    Stopped,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
