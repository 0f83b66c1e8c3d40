//! Shared health signal: the Stream Processor flips this when a flush loop
//! sees repeated consecutive failures (§4.2), and the Gateway's `/health`
//! endpoint reads it so the degraded state is observable to an operator
//! rather than living only in logs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cheap to clone (wraps an `Arc`); one instance shared between the Stream
/// Processor's consumer loops and the Gateway's router.
#[derive(Clone, Default)]
pub struct HealthState {
    degraded: Arc<AtomicBool>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Relaxed);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }
}
