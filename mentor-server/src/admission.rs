//! Admission control for concurrent generations.
//!
//! A counting semaphore caps in-flight provider streams process-wide, keeping
//! the service inside its provider connection budget. Admission never blocks:
//! when every slot is busy the caller hears "busy" immediately and can tell
//! the client to retry, instead of queueing work on a connection the client
//! is already holding open.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Process-wide generation gate. Cloning shares the same slot pool.
#[derive(Clone)]
pub struct AdmissionController {
    slots: Arc<Semaphore>,
    capacity: usize,
}

/// One unit of generation capacity.
///
/// The slot is returned when the token drops, and only then. Tokens cannot be
/// cloned or constructed outside [`AdmissionController::try_admit`], so a
/// turn can neither release twice nor forget to release.
#[derive(Debug)]
pub struct AdmissionToken {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Claim a generation slot without waiting. `None` means all slots are
    /// in use right now.
    pub fn try_admit(&self) -> Option<AdmissionToken> {
        match self.slots.clone().try_acquire_owned() {
            Ok(permit) => Some(AdmissionToken { _permit: permit }),
            Err(TryAcquireError::NoPermits) => None,
            // The semaphore is never closed; treat it as saturated if it is.
            Err(TryAcquireError::Closed) => None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

// ============================================================================
// Tests
// ============================================================================
