//! Restart policy for failed pipeline runs.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Decides whether a failed run is restarted from the latest checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Fail on the first error.
    None,
    /// Restart up to `attempts` times, waiting `delay` before each restart.
    FixedDelay {
        /// Maximum number of restarts.
        attempts: u32,
        /// Pause before each restart.
        delay: Duration,
    },
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::FixedDelay {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RestartPolicy {
    /// Creates a fixed-delay policy.
    #[must_use]
    pub fn fixed_delay(attempts: u32, delay: Duration) -> Self {
        Self::FixedDelay { attempts, delay }
    }

    /// Returns the delay before restart number `restarts_so_far + 1`, or
    /// `None` once attempts are exhausted.
    #[must_use]
    pub fn next_delay(&self, restarts_so_far: u32) -> Option<Duration> {
        match *self {
            Self::None => None,
            Self::FixedDelay { attempts, delay } => (restarts_so_far < attempts).then_some(delay),
        }
    }

    /// Returns the maximum number of restarts.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        match *self {
            Self::None => 0,
            Self::FixedDelay { attempts, .. } => attempts,
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::FixedDelay { attempts, delay } => {
                write!(f, "fixed-delay({attempts}, {}ms)", delay.as_millis())
            }
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = String;

    /// Parses the policy name. `fixed-delay` takes the default attempts and
    /// delay, which the `restart.attempts` and `restart.delay` keys override.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "none" | "no-restart" => Ok(Self::None),
            "fixed-delay" => Ok(Self::default()),
            _ => Err(format!(
                "Unknown restart policy: {s}. Expected 'fixed-delay' or 'none'"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay_bounds_attempts() {
        let policy = RestartPolicy::fixed_delay(2, Duration::from_millis(5));
        assert_eq!(policy.next_delay(0), Some(Duration::from_millis(5)));
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(5)));
        assert_eq!(policy.next_delay(2), None);
        assert_eq!(policy.max_attempts(), 2);
    }

    #[test]
    fn test_none_never_restarts() {
        assert_eq!(RestartPolicy::None.next_delay(0), None);
        assert_eq!(RestartPolicy::None.max_attempts(), 0);
    }

    #[test]
    fn test_parse() {
        assert_eq!("none".parse::<RestartPolicy>().unwrap(), RestartPolicy::None);
        assert!(matches!(
            "fixed_delay".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::FixedDelay { attempts: 3, .. }
        ));
        assert!("exponential".parse::<RestartPolicy>().is_err());
    }
}
