//! Convergence tracking across reconciliation passes.

/// Declares convergence only after a number of consecutive passes took no
/// corrective action, so a quick flap is not mistaken for stability.
#[derive(Debug, Clone)]
pub struct SteadyState {
    required: u32,
    consecutive: u32,
}

impl SteadyState {
    pub fn new(required: u32) -> Self {
        Self {
            required: required.max(1),
            consecutive: 0,
        }
    }

    /// Record a pass that took `actions` corrective actions; returns whether converged
    pub fn observe(&mut self, actions: usize) -> bool {
        if actions == 0 {
            self.consecutive = self.consecutive.saturating_add(1);
        } else {
            self.consecutive = 0;
        }
        self.is_converged()
    }

    pub fn is_converged(&self) -> bool {
        self.consecutive >= self.required
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}
