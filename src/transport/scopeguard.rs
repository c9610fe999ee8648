//! Scope guard for cleanup on drop.
//!
//! This is a minimal implementation to avoid adding the `scopeguard`
//! crate as a dependency for a single use case: guaranteeing the
//! reconnect guard is released however the reconnect loop exits.

/// A guard that executes a closure when dropped.
pub struct ScopeGuard<T, F: FnOnce(T)> {
    value: Option<T>,
    dropper: Option<F>,
}

impl<T, F: FnOnce(T)> Drop for ScopeGuard<T, F> {
    fn drop(&mut self) {
        if let (Some(value), Some(dropper)) = (self.value.take(), self.dropper.take()) {
            dropper(value);
        }
    }
}

/// Create a scope guard that will execute `dropper` with `value` when
/// dropped.
pub fn guard<T, F: FnOnce(T)>(value: T, dropper: F) -> ScopeGuard<T, F> {
    ScopeGuard {
        value: Some(value),
        dropper: Some(dropper),
    }
}
