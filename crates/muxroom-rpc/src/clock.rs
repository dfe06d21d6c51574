use std::sync::atomic::{AtomicI64, Ordering};

/// Method path of the liveness check served by rooms and peers
pub const PING_METHOD: &str = "tunnel.ping";

/// Millisecond wall clock that never goes backwards
///
/// Backs `tunnel.ping`; a wall clock step backwards repeats the last value.
#[derive(Debug, Default)]
pub struct PingClock {
    last: AtomicI64,
}

impl PingClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_millis(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis().max(1);
        let prev = self.last.fetch_max(now, Ordering::AcqRel);
        prev.max(now)
    }
}
