use std::time::Duration;

/// Bounded retry schedule, evaluated by a small state object instead of
/// recursive timer chains so the cap is explicit.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Doubles the delay per attempt when set; fixed delay otherwise.
    pub exponential: bool,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            exponential: false,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            exponential: true,
        }
    }
}

/// Per-use attempt counter for a [`RetryPolicy`].
#[derive(Debug, Default)]
pub struct RetryState {
    attempts: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Consume one attempt. Returns the delay to wait before retrying, or
    /// `None` when the policy is exhausted.
    pub fn next_delay(&mut self, policy: &RetryPolicy) -> Option<Duration> {
        if self.attempts >= policy.max_attempts {
            return None;
        }
        let delay = if policy.exponential {
            policy.base_delay * 2u32.saturating_pow(self.attempts)
        } else {
            policy.base_delay
        };
        self.attempts += 1;
        Some(delay)
    }

    /// Reset after a successful attempt so later failures get a fresh budget.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_policy_caps_attempts() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(2));
        let mut state = RetryState::new();

        assert_eq!(state.next_delay(&policy), Some(Duration::from_secs(2)));
        assert_eq!(state.next_delay(&policy), Some(Duration::from_secs(2)));
        assert_eq!(state.next_delay(&policy), Some(Duration::from_secs(2)));
        assert_eq!(state.next_delay(&policy), None);
        assert_eq!(state.next_delay(&policy), None);
    }

    #[test]
    fn exponential_policy_doubles() {
        let policy = RetryPolicy::exponential(4, Duration::from_secs(1));
        let mut state = RetryState::new();

        assert_eq!(state.next_delay(&policy), Some(Duration::from_secs(1)));
        assert_eq!(state.next_delay(&policy), Some(Duration::from_secs(2)));
        assert_eq!(state.next_delay(&policy), Some(Duration::from_secs(4)));
        assert_eq!(state.next_delay(&policy), Some(Duration::from_secs(8)));
        assert_eq!(state.next_delay(&policy), None);
    }

    #[test]
    fn reset_restores_budget() {
        let policy = RetryPolicy::fixed(1, Duration::from_millis(100));
        let mut state = RetryState::new();

        assert!(state.next_delay(&policy).is_some());
        assert!(state.next_delay(&policy).is_none());
        state.reset();
        assert!(state.next_delay(&policy).is_some());
    }
}
