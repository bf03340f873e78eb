use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

pub const ECHO_WINDOW: Duration = Duration::from_secs(5);

/// Paths the engine itself just wrote or deleted. Watcher events for them
/// are dropped until the window lapses. Expired entries are swept lazily.
pub struct EchoGuard {
    window: Duration,
    until: Mutex<HashMap<String, Instant>>,
}

impl EchoGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            until: Mutex::new(HashMap::new()),
        }
    }

    pub fn mark(&self, path: &str) {
        let deadline = Instant::now() + self.window;
        self.until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), deadline);
    }

    pub fn is_suppressed(&self, path: &str) -> bool {
        let now = Instant::now();
        let mut until = self.until.lock().unwrap_or_else(PoisonError::into_inner);
        until.retain(|_, deadline| *deadline > now);
        until.contains_key(path)
    }
}

impl Default for EchoGuard {
    fn default() -> Self {
        Self::new(ECHO_WINDOW)
    }
}
