//! Re-armable one-shot deadline for use inside `tokio::select!`.

use std::future::pending;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};

#[derive(Debug, Default)]
pub struct WakeTimer {
    deadline: Option<Instant>,
}

impl WakeTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm unless already armed.
    pub fn schedule(&mut self, after: Duration) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + after);
        }
    }

    /// Arm, replacing any pending deadline.
    pub fn reset(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves once the deadline passes, then disarms. Never resolves while
    /// disarmed. Cancel safe.
    pub async fn fired(&mut self) {
        match self.deadline {
            Some(d) => {
                sleep_until(d).await;
                self.deadline = None;
            }
            None => pending().await,
        }
    }
}
