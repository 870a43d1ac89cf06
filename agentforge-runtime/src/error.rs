use thiserror::Error;

/// Errors raised by the Loop Detector / Adaptive Budget (C4).
#[derive(Error, Debug)]
pub enum LoopError {
    #[error("absolute step cap {cap} exceeded at step {step}")]
    AbsoluteCapExceeded { step: u32, cap: u32 },
}

impl agentforge_core::Severity for LoopError {
    fn is_fatal(&self) -> bool {
        // Cap overrun is recoverable at the taxonomy level: the executor
        // reacts by escalating the task, it does not need to abort the
        // process.
        false
    }
}
