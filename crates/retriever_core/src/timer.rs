use std::time::{Duration, Instant};

use tracing::info;

/// Prints `[name] done in X.XXX s` when dropped.
pub struct Timer {
    name: String,
    start: Instant,
}

impl Timer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn message(&self) -> String {
        format!("[{}] done in {:.3} s", self.name, self.elapsed().as_secs_f64())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let message = self.message();
        info!(elapsed_s = self.elapsed().as_secs_f64(), "{}", self.name);
        println!("{message}");
    }
}
