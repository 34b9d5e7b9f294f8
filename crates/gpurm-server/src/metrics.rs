use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Process-wide counters, cheap to clone into every session thread.
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    next_session_id: AtomicU64,

    sessions_active: AtomicU64,
    sessions_total: AtomicU64,

    requests_total: AtomicU64,
    requests_failed_total: AtomicU64,
    protocol_errors_total: AtomicU64,

    fences_submitted_total: AtomicU64,
}

/// Snapshot of [`Metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sessions_active: u64,
    pub sessions_total: u64,
    pub requests_total: u64,
    pub requests_failed_total: u64,
    pub protocol_errors_total: u64,
    pub fences_submitted_total: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_session_id(&self) -> u64 {
        self.inner.next_session_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn session_opened(&self) {
        self.inner.sessions_total.fetch_add(1, Ordering::Relaxed);
        self.inner.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.inner.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn request(&self, ok: bool) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.inner
                .requests_failed_total
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn protocol_error(&self) {
        self.inner
            .protocol_errors_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn fence_submitted(&self) {
        self.inner
            .fences_submitted_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_active: self.inner.sessions_active.load(Ordering::Relaxed),
            sessions_total: self.inner.sessions_total.load(Ordering::Relaxed),
            requests_total: self.inner.requests_total.load(Ordering::Relaxed),
            requests_failed_total: self.inner.requests_failed_total.load(Ordering::Relaxed),
            protocol_errors_total: self.inner.protocol_errors_total.load(Ordering::Relaxed),
            fences_submitted_total: self.inner.fences_submitted_total.load(Ordering::Relaxed),
        }
    }
}
