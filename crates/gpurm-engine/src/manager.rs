use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use gpurm_ring::{Ring, RingError};

use crate::backend::{Completion, EngineInfo, ExecutionBackend};
use crate::{EngineError, Result};

/// Caller-opaque identifier of an acquired engine slot.
pub type Token = u64;

/// Identity of whoever holds a slot (a server session id, a thread id, ...).
pub type OwnerId = u64;

/// Token of the first slot; slot `i` is `TOKEN_BASE + i`.
pub const TOKEN_BASE: Token = 0x1000;

pub const MAX_ENGINES: usize = 8;

/// Upper bound on a single blocking wait before state is re-checked.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Gfx,
    Dma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSpec {
    pub kind: EngineKind,
    pub ring_words: usize,
}

impl EngineSpec {
    pub fn new(kind: EngineKind, ring_words: usize) -> Self {
        Self { kind, ring_words }
    }

    /// Ring sized in KiB, restricted to the range hardware rings accept.
    pub fn with_ring_kib(kind: EngineKind, kib: u32) -> std::result::Result<Self, RingError> {
        let ring_words = Ring::with_size_kib(kib)?.capacity();
        Ok(Self { kind, ring_words })
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub engines: Vec<EngineSpec>,
    pub poll_interval: Duration,
}

impl EngineConfig {
    /// `count` identical engines.
    pub fn uniform(count: usize, kind: EngineKind, ring_words: usize) -> Self {
        Self {
            engines: vec![EngineSpec::new(kind, ring_words); count],
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Point-in-time view of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub token: Token,
    pub kind: EngineKind,
    pub owner: Option<OwnerId>,
    pub last_submitted: u64,
    pub completed: u64,
    pub ring_write: usize,
    pub ring_read: usize,
}

struct Slot {
    info: EngineInfo,
    state: Mutex<SlotState>,
    completed_cv: Condvar,
}

struct SlotState {
    owner: Option<OwnerId>,
    last_submitted: u64,
    completed: u64,
    ring: Ring,
}

impl SlotState {
    fn is_idle(&self) -> bool {
        self.completed == self.last_submitted
    }
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed pool of engine slots.
///
/// Each slot has its own lock (which also guards its ring) and a condition variable for fence
/// completion. Waiting for a free slot uses a separate release generation counter so a release
/// that races with a scan is never missed.
pub struct EngineManager {
    slots: Box<[Slot]>,
    backend: Arc<dyn ExecutionBackend>,
    poll_interval: Duration,
    release_generation: Mutex<u64>,
    released_cv: Condvar,
}

impl EngineManager {
    pub fn new(config: EngineConfig, backend: Arc<dyn ExecutionBackend>) -> Result<Self> {
        if config.engines.len() > MAX_ENGINES {
            return Err(EngineError::TooManyEngines {
                count: config.engines.len(),
            });
        }

        let slots = config
            .engines
            .iter()
            .enumerate()
            .map(|(index, spec)| -> Result<Slot> {
                Ok(Slot {
                    info: EngineInfo {
                        token: TOKEN_BASE + index as Token,
                        index,
                        kind: spec.kind,
                    },
                    state: Mutex::new(SlotState {
                        owner: None,
                        last_submitted: 0,
                        completed: 0,
                        ring: Ring::new(spec.ring_words)?,
                    }),
                    completed_cv: Condvar::new(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(engines = slots.len(), "engine manager initialized");

        Ok(Self {
            slots: slots.into_boxed_slice(),
            backend,
            poll_interval: config.poll_interval,
            release_generation: Mutex::new(0),
            released_cv: Condvar::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn tokens(&self) -> impl Iterator<Item = Token> + '_ {
        self.slots.iter().map(|slot| slot.info.token)
    }

    pub fn held_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.lock().owner.is_some())
            .count()
    }

    fn slot(&self, token: Token) -> Result<&Slot> {
        token
            .checked_sub(TOKEN_BASE)
            .and_then(|index| usize::try_from(index).ok())
            .and_then(|index| self.slots.get(index))
            .ok_or(EngineError::InvalidToken(token))
    }

    fn generation(&self) -> MutexGuard<'_, u64> {
        self.release_generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the first free slot for `owner`.
    ///
    /// `capabilities` is advisory: all engines are treated as interchangeable and the mask does
    /// not filter candidates. If every slot is held, waits up to `timeout` for a release.
    pub fn acquire(&self, owner: OwnerId, capabilities: u64, timeout: Duration) -> Result<Token> {
        if self.slots.is_empty() {
            return Err(EngineError::NoEngine);
        }

        let deadline = Instant::now().checked_add(timeout);
        loop {
            let seen = *self.generation();
            if let Some(token) = self.try_claim(owner) {
                tracing::debug!(token, owner, capabilities, "engine acquired");
                return Ok(token);
            }

            let Some(wait) = next_wait(deadline, self.poll_interval) else {
                tracing::debug!(owner, ?timeout, "engine acquire timed out");
                return Err(EngineError::Timeout);
            };
            let generation = self.generation();
            if *generation == seen {
                let _ = self
                    .released_cv
                    .wait_timeout(generation, wait)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }

    fn try_claim(&self, owner: OwnerId) -> Option<Token> {
        self.slots.iter().find_map(|slot| {
            let mut state = slot.lock();
            if state.owner.is_some() {
                return None;
            }
            state.owner = Some(owner);
            if state.is_idle() {
                state.ring.reset();
                state.last_submitted = 0;
                state.completed = 0;
            }
            Some(slot.info.token)
        })
    }

    /// Return a held slot to the pool.
    pub fn release(&self, token: Token) -> Result<()> {
        self.release_checked(token, None)
    }

    /// Like [`EngineManager::release`], but only if `owner` is the current holder.
    pub fn release_owned(&self, owner: OwnerId, token: Token) -> Result<()> {
        self.release_checked(token, Some(owner))
    }

    fn release_checked(&self, token: Token, expected: Option<OwnerId>) -> Result<()> {
        let slot = self.slot(token)?;
        {
            let mut state = slot.lock();
            match (state.owner, expected) {
                (None, _) => return Err(EngineError::NotHeld(token)),
                (Some(owner), Some(expected)) if owner != expected => {
                    return Err(EngineError::NotHeld(token))
                }
                _ => {}
            }
            state.owner = None;
        }

        *self.generation() += 1;
        self.released_cv.notify_all();
        tracing::debug!(token, "engine released");
        Ok(())
    }

    /// Reserve the next fence on `token`, write `commands` into its ring and hand them to the
    /// backend, all under the slot lock.
    ///
    /// Either every step happens or none does: the capacity check runs before the fence is
    /// reserved, so a rejected submission leaves the fence counter untouched.
    pub fn submit_work(&self, token: Token, commands: &[u32]) -> Result<u64> {
        let slot = self.slot(token)?;
        let mut state = slot.lock();
        if state.owner.is_none() {
            return Err(EngineError::NotHeld(token));
        }
        state.ring.check_write(commands.len())?;

        let fence = state.ring.alloc_fence();
        let span = state.ring.write(commands)?;
        state.last_submitted = fence;

        let completion = match state.ring.words(span) {
            Some(words) => self.backend.execute(&slot.info, words, fence),
            None => Completion::Pending,
        };
        if completion == Completion::Retired {
            Self::retire(slot, &mut state, fence);
        }

        tracing::debug!(token, fence, words = commands.len(), ?completion, "work submitted");
        Ok(fence)
    }

    /// Advance the completed fence of `token`. Called by whatever drives the hardware.
    ///
    /// Values at or below the current completed fence are ignored.
    pub fn signal_completed(&self, token: Token, value: u64) -> Result<()> {
        let slot = self.slot(token)?;
        let mut state = slot.lock();
        if value > state.last_submitted {
            return Err(EngineError::BadFence {
                token,
                fence: value,
                submitted: state.last_submitted,
            });
        }
        if value > state.completed {
            Self::retire(slot, &mut state, value);
        }
        Ok(())
    }

    fn retire(slot: &Slot, state: &mut SlotState, value: u64) {
        state.completed = value;
        if state.is_idle() {
            let write = state.ring.write_offset();
            // `write` comes from the ring itself and is always in range.
            let _ = state.ring.set_read_offset(write);
        }
        slot.completed_cv.notify_all();
    }

    /// Block until `token`'s completed fence reaches `value`, or `timeout` passes.
    ///
    /// Returns no later than `timeout` plus one poll interval.
    pub fn wait_fence(&self, token: Token, value: u64, timeout: Duration) -> Result<()> {
        let slot = self.slot(token)?;
        let deadline = Instant::now().checked_add(timeout);
        let mut state = slot.lock();
        if value > state.last_submitted {
            return Err(EngineError::BadFence {
                token,
                fence: value,
                submitted: state.last_submitted,
            });
        }

        loop {
            if state.completed >= value {
                return Ok(());
            }
            let Some(wait) = next_wait(deadline, self.poll_interval) else {
                tracing::debug!(token, value, completed = state.completed, "fence wait timed out");
                return Err(EngineError::Timeout);
            };
            state = slot
                .completed_cv
                .wait_timeout(state, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn completed_fence(&self, token: Token) -> Result<u64> {
        Ok(self.slot(token)?.lock().completed)
    }

    pub fn status(&self, token: Token) -> Result<EngineStatus> {
        let slot = self.slot(token)?;
        let state = slot.lock();
        Ok(EngineStatus {
            token,
            kind: slot.info.kind,
            owner: state.owner,
            last_submitted: state.last_submitted,
            completed: state.completed,
            ring_write: state.ring.write_offset(),
            ring_read: state.ring.read_offset(),
        })
    }
}

/// Length of the next blocking slice, or `None` once `deadline` has passed.
///
/// A `None` deadline (the timeout did not fit in an `Instant`) never expires.
fn next_wait(deadline: Option<Instant>, poll_interval: Duration) -> Option<Duration> {
    match deadline {
        None => Some(poll_interval),
        Some(deadline) => deadline
            .checked_duration_since(Instant::now())
            .filter(|left| !left.is_zero())
            .map(|left| left.min(poll_interval)),
    }
}

impl std::fmt::Debug for EngineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineManager")
            .field("engines", &self.slots.len())
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
