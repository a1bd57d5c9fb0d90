use std::time::{SystemTime, UNIX_EPOCH};

/// External collaborator: a source of time, so tests can control expiry
/// without sleeping. Production uses `SystemClock`.
pub trait Clock: Send + Sync + 'static {
    fn now_unix_secs(&self) -> i64;
    fn now_unix_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_secs(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    fn now_unix_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

#[cfg(test)]
pub mod test_support {
    use super::Clock;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// A clock a test can advance deterministically.
    pub struct FakeClock(AtomicI64);

    impl FakeClock {
        pub fn new(start_secs: i64) -> Self {
            Self(AtomicI64::new(start_secs))
        }

        pub fn advance(&self, secs: i64) {
            self.0.fetch_add(secs, Ordering::SeqCst);
        }
    }

    impl Clock for FakeClock {
        fn now_unix_secs(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }

        fn now_unix_millis(&self) -> i64 {
            self.0.load(Ordering::SeqCst) * 1000
        }
    }
}
