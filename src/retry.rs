//! Policies deciding what happens after a transient request failure.
//!
//! The request client consults its policy once per failed attempt. The
//! default, [`Immediate`], retries forever without waiting, which suits an
//! unattended poller that must eventually recover its link. Callers needing a
//! hard bound can use [`Limited`] or [`Backoff`], or implement [`RetryPolicy`]
//! themselves.

use std::fmt;
use std::time::Duration;

/// The failure classes a request recovers from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transient {
    /// Writing the request ran past the deadline; the connection was reset.
    WriteTimeout,
    /// Reading the response ran past the deadline; the connection was reset.
    ReadTimeout,
    /// The response frame failed the checksum and was discarded.
    Checksum,
}

impl fmt::Display for Transient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Transient::WriteTimeout => write!(f, "write timeout"),
            Transient::ReadTimeout => write!(f, "read timeout"),
            Transient::Checksum => write!(f, "checksum mismatch"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    Now,
    After(Duration),
    GiveUp,
}

pub trait RetryPolicy: fmt::Debug {
    /// Called after failed attempt number `attempt` (starting at 1).
    fn next(&mut self, attempt: u32, reason: Transient) -> Retry;

    /// Called when a request starts so stateful policies can reset.
    fn reset(&mut self) {}
}

impl<P: RetryPolicy + ?Sized> RetryPolicy for Box<P> {
    fn next(&mut self, attempt: u32, reason: Transient) -> Retry {
        (**self).next(attempt, reason)
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

/// Retries forever without delay.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl RetryPolicy for Immediate {
    fn next(&mut self, _attempt: u32, _reason: Transient) -> Retry {
        Retry::Now
    }
}

/// Retries without delay until `max_attempts` attempts have failed.
#[derive(Debug, Clone, Copy)]
pub struct Limited {
    pub max_attempts: u32,
}

impl RetryPolicy for Limited {
    fn next(&mut self, attempt: u32, _reason: Transient) -> Retry {
        if attempt >= self.max_attempts {
            Retry::GiveUp
        } else {
            Retry::Now
        }
    }
}

/// Doubles the wait after every failure, capped at `max`. Retries forever.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl RetryPolicy for Backoff {
    fn next(&mut self, attempt: u32, _reason: Transient) -> Retry {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        Retry::After(self.initial.saturating_mul(factor).min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_never_gives_up() {
        let mut policy = Immediate;
        for attempt in 1..1000 {
            assert_eq!(policy.next(attempt, Transient::ReadTimeout), Retry::Now);
        }
    }

    #[test]
    fn test_limited() {
        let mut policy = Limited { max_attempts: 3 };
        assert_eq!(policy.next(1, Transient::Checksum), Retry::Now);
        assert_eq!(policy.next(2, Transient::Checksum), Retry::Now);
        assert_eq!(policy.next(3, Transient::Checksum), Retry::GiveUp);
    }

    #[test]
    fn test_boxed_policy() {
        let mut policy: Box<dyn RetryPolicy> = Box::new(Limited { max_attempts: 1 });
        assert_eq!(policy.next(1, Transient::ReadTimeout), Retry::GiveUp);
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut policy = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        assert_eq!(
            policy.next(1, Transient::WriteTimeout),
            Retry::After(Duration::from_millis(100))
        );
        assert_eq!(
            policy.next(3, Transient::WriteTimeout),
            Retry::After(Duration::from_millis(400))
        );
        assert_eq!(
            policy.next(5, Transient::WriteTimeout),
            Retry::After(Duration::from_secs(1))
        );
        assert_eq!(
            policy.next(200, Transient::WriteTimeout),
            Retry::After(Duration::from_secs(1))
        );
    }
}
