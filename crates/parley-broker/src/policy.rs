//! Candidate gathering policy.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared slow-gathering flag
///
/// Starts cleared. Once set, by NAT detection or by a negotiation that saw
/// slow gathering, it stays set for the life of the process context and every
/// later negotiation streams candidates instead of waiting for the full set.
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct GatheringPolicy {
    slow: Arc<AtomicBool>,
}

impl GatheringPolicy {
    /// Create a cleared policy
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a policy that already streams candidates
    #[must_use]
    pub fn tickle() -> Self {
        let policy = Self::new();
        policy.mark_slow();
        policy
    }

    /// Whether slow candidate gathering was detected
    #[must_use]
    pub fn slow_ice_detected(&self) -> bool {
        self.slow.load(Ordering::Acquire)
    }

    /// Record slow gathering. Idempotent.
    pub fn mark_slow(&self) {
        if !self.slow.swap(true, Ordering::AcqRel) {
            tracing::info!("Slow ICE gathering detected, candidates will be streamed");
        }
    }

    /// Whether a negotiation should wait for gathering to complete
    /// before sending its description
    #[must_use]
    pub fn should_wait_for_gathering(&self, can_trickle: Option<bool>) -> bool {
        can_trickle == Some(false) || !self.slow_ice_detected()
    }
}
