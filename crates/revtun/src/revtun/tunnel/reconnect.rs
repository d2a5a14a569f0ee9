use std::time::Duration;

use async_trait::async_trait;

/// Client connection lifecycle: `Disconnected -> Connecting -> Connected -> Disconnected ...`
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

/// How a connection attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Could not reach (or authenticate to) the server at all.
    DialFailed,
    /// A session was established and later dropped.
    SessionEnded,
}

/// Fixed-delay retry: no jitter, no attempt limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub dial_retry: Duration,
    pub session_retry: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            dial_retry: Duration::from_secs(5),
            session_retry: Duration::from_secs(2),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_after(&self, attempt: Attempt) -> Duration {
        match attempt {
            Attempt::DialFailed => self.dial_retry,
            Attempt::SessionEnded => self.session_retry,
        }
    }
}

/// Time source for reconnect delays, so tests can skip real sleeps.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, d: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}
