//! Adaptive step budget: a step cap that grows with observed progress but
//! never exceeds a hard ceiling.
//!
//! The budget starts at `base_cap` steps. Each step that makes progress
//! (see [`crate::loop_detector::LoopDetector`]'s notion of progress) may
//! extend the live cap by `extension_increment`, but never past
//! `hard_ceiling` — that ceiling is absolute and unconditional.

use crate::error::LoopError;

#[derive(Clone, Copy, Debug)]
pub struct BudgetConfig {
    pub base_cap: u32,
    pub hard_ceiling: u32,
    pub extension_increment: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            base_cap: 25,
            hard_ceiling: 25,
            extension_increment: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AdaptiveBudget {
    config: BudgetConfig,
    live_cap: u32,
    steps_taken: u32,
}

impl AdaptiveBudget {
    pub fn new(config: BudgetConfig) -> Self {
        let live_cap = config.base_cap.min(config.hard_ceiling);
        Self {
            config,
            live_cap,
            steps_taken: 0,
        }
    }

    pub fn steps_taken(&self) -> u32 {
        self.steps_taken
    }

    pub fn live_cap(&self) -> u32 {
        self.live_cap
    }

    pub fn remaining(&self) -> u32 {
        self.live_cap.saturating_sub(self.steps_taken)
    }

    /// Records one executed step. Returns `Err(LoopError::AbsoluteCapExceeded)`
    /// once `steps_taken` would exceed the hard ceiling; the caller is
    /// expected to force an `escalated` transition on that error, not abort.
    pub fn record_step(&mut self, made_progress: bool) -> Result<(), LoopError> {
        self.steps_taken += 1;

        if made_progress && self.live_cap < self.config.hard_ceiling {
            self.live_cap = (self.live_cap + self.config.extension_increment).min(self.config.hard_ceiling);
        }

        if self.steps_taken > self.config.hard_ceiling {
            return Err(LoopError::AbsoluteCapExceeded {
                step: self.steps_taken,
                cap: self.config.hard_ceiling,
            });
        }
        Ok(())
    }

    pub fn is_exhausted(&self) -> bool {
        self.steps_taken >= self.live_cap
    }
}
