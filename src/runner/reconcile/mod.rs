pub(crate) mod compare;
mod sync;

pub(crate) use self::sync::SyncPass;

use crate::error::Error;
use crate::mapper::MapperError;
use crate::resource::ObjectId;
use crate::store::StoreError;
use crate::syncer::Side;

use std::fmt::{self, Display};

/// Why a sync pass failed. Transient errors are retried with backoff, everything else is logged
/// and the key is dropped until something changes.
#[derive(Debug)]
pub enum SyncError {
    Store { side: Side, error: StoreError },
    /// `translate_to_host` or `translate_to_virtual` returned an error
    Translate(Error),
    Mapper(MapperError),
    /// The virtual object maps onto a host object that this virtual cluster does not own
    RefuseAdopt { virtual_id: ObjectId, host_id: ObjectId },
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Store { error, .. } => error.is_transient(),
            SyncError::Translate(_) => true,
            SyncError::Mapper(MapperError::NotFound(_)) => true,
            SyncError::Mapper(_) => false,
            SyncError::RefuseAdopt { .. } => false,
        }
    }

    /// Reason of the Warning event recorded for this error
    pub fn reason(&self) -> &'static str {
        match self {
            SyncError::RefuseAdopt { .. } => "RefusedAdoption",
            SyncError::Mapper(MapperError::MultipleMatches { .. }) => "MultipleMatches",
            _ => "SyncError",
        }
    }

    fn store(side: Side) -> impl FnOnce(StoreError) -> SyncError {
        move |error| SyncError::Store { side, error }
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyncError::Store { side, error } => write!(f, "{} store error: {}", side, error),
            SyncError::Translate(e) => write!(f, "translation failed: {}", e),
            SyncError::Mapper(e) => write!(f, "{}", e),
            SyncError::RefuseAdopt {
                virtual_id,
                host_id,
            } => write!(
                f,
                "refusing to adopt host object {} for {}, since it is not managed by this virtual cluster",
                host_id, virtual_id
            ),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Store { error, .. } => Some(error),
            SyncError::Mapper(e) => Some(e),
            _ => None,
        }
    }
}
