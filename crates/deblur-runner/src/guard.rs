use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Admits one batch at a time per runner.
#[derive(Clone, Debug)]
pub struct BatchGuard {
    semaphore: Arc<Semaphore>,
}

impl Default for BatchGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchGuard {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// `None` while another batch holds the permit. The permit is released on drop.
    pub fn try_enter(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_entry_is_refused_until_release() {
        let guard = BatchGuard::new();
        let permit = guard.try_enter().expect("first entry");
        assert!(guard.is_busy());
        assert!(guard.clone().try_enter().is_none());
        drop(permit);
        assert!(!guard.is_busy());
        assert!(guard.try_enter().is_some());
    }
}
