use std::time::Duration;

/// Exponential retry backoff for one worker scope: doubles from the initial
/// delay up to the cap, reset on the first success.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: None,
        }
    }

    /// The delay to apply right now, if a retry is pending.
    pub fn current(&self) -> Option<Duration> {
        self.current
    }

    /// Register a retryable failure and return the delay to wait.
    pub fn advance(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(cur) => self.max.min(cur * 2),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_the_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(900));
        assert_eq!(backoff.current(), None);
        assert_eq!(backoff.advance(), Duration::from_secs(30));
        assert_eq!(backoff.advance(), Duration::from_secs(60));
        assert_eq!(backoff.advance(), Duration::from_secs(120));
        for _ in 0..10 {
            backoff.advance();
        }
        assert_eq!(backoff.current(), Some(Duration::from_secs(900)));
    }

    #[test]
    fn reset_clears_the_delay() {
        let mut backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(900));
        backoff.advance();
        backoff.reset();
        assert_eq!(backoff.current(), None);
        assert_eq!(backoff.advance(), Duration::from_secs(30));
    }
}
