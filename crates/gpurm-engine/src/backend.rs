use std::sync::atomic::{AtomicU64, Ordering};

use crate::{EngineKind, Token};

/// Identity of the engine a submission is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineInfo {
    pub token: Token,
    pub index: usize,
    pub kind: EngineKind,
}

/// What a backend did with a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The words were consumed and the fence is complete.
    Retired,
    /// Still in flight; completion arrives later through
    /// [`EngineManager::signal_completed`](crate::EngineManager::signal_completed).
    Pending,
}

/// Hardware-facing side of the engine manager.
///
/// `execute` is called with the engine's slot lock held. Implementations must not call back into
/// the [`EngineManager`](crate::EngineManager) for the same engine from inside `execute`.
pub trait ExecutionBackend: Send + Sync {
    fn execute(&self, engine: &EngineInfo, words: &[u32], fence: u64) -> Completion;
}

/// Retires every submission immediately.
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    words_executed: AtomicU64,
    submissions: AtomicU64,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn words_executed(&self) -> u64 {
        self.words_executed.load(Ordering::Relaxed)
    }

    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }
}

impl ExecutionBackend for SimulatedBackend {
    fn execute(&self, engine: &EngineInfo, words: &[u32], fence: u64) -> Completion {
        self.words_executed
            .fetch_add(words.len() as u64, Ordering::Relaxed);
        self.submissions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            token = engine.token,
            kind = ?engine.kind,
            words = words.len(),
            fence,
            "simulated execution"
        );
        Completion::Retired
    }
}

/// Never retires anything; fences only advance through `signal_completed`.
#[derive(Debug, Default)]
pub struct ManualBackend;

impl ExecutionBackend for ManualBackend {
    fn execute(&self, _engine: &EngineInfo, _words: &[u32], _fence: u64) -> Completion {
        Completion::Pending
    }
}
