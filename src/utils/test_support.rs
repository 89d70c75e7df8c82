use std::sync::atomic::{AtomicU64, Ordering};

use crate::clock::Clock;

/// Reports whether httpmock-backed tests should be skipped because the
/// sandbox forbids binding to localhost.
pub fn httpmock_unavailable() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(listener) => {
            drop(listener);
            false
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping httpmock test: sandbox forbids binding to localhost");
            true
        }
        Err(err) => panic!("failed to bind localhost for httpmock tests: {err}"),
    }
}

/// Settable [`Clock`] for driving TTL and day-boundary behavior in tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn at(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: u64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_seconds(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
