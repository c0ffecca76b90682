//! Scoped engine-state diversion
//!
//! `CheckpointGuard` saves the engine's state, swaps in another one, and puts
//! the saved state back when it goes out of scope. The restore runs on every
//! exit path, including the enclosing future being dropped mid-generation.

use crate::error::Result;
use crate::llm::{EngineState, InferenceEngine};

pub struct CheckpointGuard<'a, E: InferenceEngine> {
    engine: &'a mut E,
    saved: EngineState,
    restored: bool,
}

impl<'a, E: InferenceEngine> CheckpointGuard<'a, E> {
    /// Save the current state and load `scratch` in its place
    pub fn divert(engine: &'a mut E, scratch: &EngineState) -> Result<Self> {
        let saved = engine.save_state();
        let guard = Self {
            engine,
            saved,
            restored: false,
        };
        guard.engine.load_state(scratch)?;
        Ok(guard)
    }

    pub fn engine(&mut self) -> &mut E {
        self.engine
    }

    /// Restore now and report failure instead of only logging it
    pub fn restore(mut self) -> Result<()> {
        self.restored = true;
        self.engine.load_state(&self.saved)
    }
}

impl<E: InferenceEngine> Drop for CheckpointGuard<'_, E> {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if let Err(e) = self.engine.load_state(&self.saved) {
            tracing::error!("Failed to restore engine state: {}", e);
        }
    }
}
