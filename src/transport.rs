use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

use crate::errors::{AppError, AppResult};

/// Text frames of one push connection. The stream ending means the
/// connection dropped.
pub type FrameStream = BoxStream<'static, AppResult<String>>;

#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn connect(&self) -> AppResult<FrameStream>;
}

pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl FeedTransport for WebSocketTransport {
    async fn connect(&self) -> AppResult<FrameStream> {
        debug!(url = %self.url, "opening progress feed");
        let (socket, _) = connect_async(self.url.as_str()).await?;
        let frames = socket
            .take_while(|message| {
                let open = !matches!(message, Ok(Message::Close(_)));
                async move { open }
            })
            .filter_map(|message| async move {
                match message {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => Some(Ok(text)),
                        Err(_) => {
                            trace!("skipping non-utf8 binary frame");
                            None
                        }
                    },
                    Ok(_) => None,
                    Err(err) => Some(Err(AppError::from(err))),
                }
            });
        Ok(frames.boxed())
    }
}

/// Backoff applied between reconnect attempts of the push transport.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn jitter(&self) -> Jitter {
        Jitter {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Exponential delay for `attempt` (1-based), capped, without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay)
    }

    pub fn delay_for(&self, attempt: u32, jitter: &Jitter) -> Duration {
        self.base_delay_for(attempt) + jitter.sample(self.base_delay)
    }
}

pub struct Jitter {
    rng: Mutex<StdRng>,
}

impl Jitter {
    #[cfg(test)]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn sample(&self, bound: Duration) -> Duration {
        let bound_ms = bound.as_millis() as u64;
        if bound_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.rng.lock().gen_range(0..bound_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
        }
    }

    #[test]
    fn doubles_until_capped() {
        let policy = policy();
        assert_eq!(policy.base_delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.base_delay_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.base_delay_for(40), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_one_base_delay() {
        let policy = policy();
        let jitter = Jitter::seeded(7);
        for attempt in 1..=6 {
            let delay = policy.delay_for(attempt, &jitter);
            let floor = policy.base_delay_for(attempt);
            assert!(delay >= floor);
            assert!(delay < floor + policy.base_delay);
        }
    }
}
