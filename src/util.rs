use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::OnceLock;
use std::time::Instant;

use tracing::error;

/// Milliseconds on a process-local monotonic clock, the timebase of every
/// event timestamp in this crate.
pub fn monotonic_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Runs a user callback, containing any panic so a dispatch thread never
/// dies. Returns `None` when the callback panicked.
pub(crate) fn shielded<R>(context: &'static str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => Some(r),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .copied()
                .map(String::from)
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".into());
            error!(context, %msg, "panic escaped listener callback");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_ms_is_monotonic() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }

    #[test]
    fn shielded_contains_panics() {
        assert_eq!(shielded("test", || 7), Some(7));
        assert_eq!(shielded::<()>("test", || panic!("boom")), None);
    }
}
