//! Simulated step failure draws
//!
//! The engine asks a [`FailureSource`] once per fallible step. Production
//! runs use [`RandomFailures`]; [`SeededFailures`] makes every run's draws
//! reproducible from its id; tests use [`ScriptedFailures`] or [`NeverFail`].

use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;

use crate::task::FailureMode;

pub trait FailureSource: Send + Sync {
    /// Whether step `step_index` (0-based plan position) of `run_id` fails
    fn should_fail(&self, run_id: &str, step_index: usize, probability: f64) -> bool;
}

/// Independent trials from the thread RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomFailures;

impl FailureSource for RandomFailures {
    fn should_fail(&self, _run_id: &str, _step_index: usize, probability: f64) -> bool {
        rand::thread_rng().gen_bool(probability.clamp(0.0, 1.0))
    }
}

/// Draws derived from SHA-256 of (seed, run id, step index)
#[derive(Debug, Clone, Copy)]
pub struct SeededFailures {
    seed: u64,
}

impl SeededFailures {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Uniform value in [0, 1) for one trial
    fn draw(&self, run_id: &str, step_index: usize) -> f64 {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.to_le_bytes());
        hasher.update(run_id.as_bytes());
        hasher.update((step_index as u64).to_le_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        // top 53 bits -> [0, 1)
        (u64::from_le_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
    }
}

impl FailureSource for SeededFailures {
    fn should_fail(&self, run_id: &str, step_index: usize, probability: f64) -> bool {
        self.draw(run_id, step_index) < probability
    }
}

/// Never fails
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverFail;

impl FailureSource for NeverFail {
    fn should_fail(&self, _run_id: &str, _step_index: usize, _probability: f64) -> bool {
        false
    }
}

/// Fails exactly at the given plan positions, for every run
#[derive(Debug, Default, Clone)]
pub struct ScriptedFailures {
    steps: HashSet<usize>,
}

impl ScriptedFailures {
    pub fn at(steps: impl IntoIterator<Item = usize>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
        }
    }
}

impl FailureSource for ScriptedFailures {
    fn should_fail(&self, _run_id: &str, step_index: usize, _probability: f64) -> bool {
        self.steps.contains(&step_index)
    }
}

/// Build the failure source a config asks for
pub fn from_mode(mode: &FailureMode) -> Arc<dyn FailureSource> {
    match mode {
        FailureMode::Random => Arc::new(RandomFailures),
        FailureMode::Seeded { seed } => Arc::new(SeededFailures::new(*seed)),
        FailureMode::Disabled => Arc::new(NeverFail),
    }
}
