use uuid::Uuid;

use crate::error::AdapterError;
use crate::model::ExternalStatus;

/// Source of delivery observations from the external messaging system.
///
/// Implementations return every observation known for the reference, in the
/// order the external system reports them. The poller treats the last entry as
/// the current one.
#[async_trait::async_trait]
pub trait StatusAdapter: Send + Sync {
    async fn fetch_status(&self, external_ref_id: Uuid)
        -> Result<Vec<ExternalStatus>, AdapterError>;
}

/// Pick the observation the poller acts on.
///
/// An empty list is reported as [`AdapterError::NoStatusReturned`].
pub fn latest_status(
    external_ref_id: Uuid,
    statuses: &[ExternalStatus],
) -> Result<ExternalStatus, AdapterError> {
    statuses
        .last()
        .copied()
        .ok_or(AdapterError::NoStatusReturned { external_ref_id })
}
