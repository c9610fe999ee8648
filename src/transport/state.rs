//! Shared engine state for status tracking and reconnection coordination.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

use super::status::IotHubConnectionStatus;

/// Connection status plus retry progress, shared across pumps, listener
/// callbacks, and the reconnect loop.
///
/// # Memory Ordering
///
/// All atomic operations use `SeqCst` (sequentially consistent) ordering
/// for simplicity and correctness. While `Relaxed` ordering could be used
/// for some counters, the performance difference is negligible for this
/// use case, and `SeqCst` prevents subtle synchronization bugs.
///
/// # Locking
///
/// The status word itself is an atomic so pumps can check it without a
/// lock on every tick. Transitions (compare + set + side effects) are
/// serialized by `transition_lock`; readers that depend on a status must
/// re-validate after any transition they observe.
pub(crate) struct TransportState {
    /// Current status, encoded per `IotHubConnectionStatus::as_u8`.
    status: AtomicU8,
    /// Number of reconnection attempts in the current retry cycle.
    current_attempt: AtomicU32,
    /// Unix ms of the first attempt in the current retry cycle (0 = none).
    reconnect_started_ms: AtomicU64,
    /// Whether a reconnect loop is currently running.
    reconnecting: AtomicBool,
    /// Wakes tasks waiting for a status transition.
    status_changed: Notify,
    /// Serializes status transitions.
    transition_lock: Mutex<()>,
}

impl TransportState {
    pub(crate) fn new() -> Self {
        Self {
            status: AtomicU8::new(IotHubConnectionStatus::Disconnected.as_u8()),
            current_attempt: AtomicU32::new(0),
            reconnect_started_ms: AtomicU64::new(0),
            reconnecting: AtomicBool::new(false),
            status_changed: Notify::new(),
            transition_lock: Mutex::new(()),
        }
    }

    pub(crate) fn status(&self) -> IotHubConnectionStatus {
        IotHubConnectionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Store a new status. Callers must hold the transition lock.
    pub(crate) fn set_status(&self, status: IotHubConnectionStatus) {
        self.status.store(status.as_u8(), Ordering::SeqCst);
    }

    pub(crate) fn transition_lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.transition_lock.lock()
    }

    /// Register for the next status-change notification.
    ///
    /// Register BEFORE re-checking the status: if the check came first,
    /// a transition could land between check and registration and the
    /// waiter would sleep forever.
    pub(crate) fn status_changed(&self) -> Notified<'_> {
        self.status_changed.notified()
    }

    pub(crate) fn notify_status_waiters(&self) {
        self.status_changed.notify_waiters();
    }

    // =========================================================================
    // Retry progress
    // =========================================================================

    pub(crate) fn current_attempt(&self) -> u32 {
        self.current_attempt.load(Ordering::SeqCst)
    }

    pub(crate) fn increment_attempt(&self) -> u32 {
        self.current_attempt.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn reconnect_started_ms(&self) -> u64 {
        self.reconnect_started_ms.load(Ordering::SeqCst)
    }

    /// Stamp the start of a retry cycle, keeping an existing stamp.
    pub(crate) fn mark_reconnect_started(&self, now_ms: u64) {
        let _ = self.reconnect_started_ms.compare_exchange(
            0,
            now_ms,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Reset attempt counter and retry-cycle stamp, as required on every
    /// transition into `Connected`.
    pub(crate) fn reset_retry_progress(&self) {
        self.current_attempt.store(0, Ordering::SeqCst);
        self.reconnect_started_ms.store(0, Ordering::SeqCst);
    }

    // =========================================================================
    // Reconnect guard
    // =========================================================================

    /// Returns true if we successfully claimed the reconnect loop
    /// (no other task was already running it).
    pub(crate) fn start_reconnecting(&self) -> bool {
        !self.reconnecting.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn stop_reconnecting(&self) {
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }
}

impl Default for TransportState {
    fn default() -> Self {
        Self::new()
    }
}
