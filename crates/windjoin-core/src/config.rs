//! Job configuration.
//!
//! [`JobConfig`] is built either with [`JobConfig::builder`] or from the
//! string key surface with [`JobConfig::from_properties`]:
//!
//! | Key | Example | Default |
//! |---|---|---|
//! | `window.size` | `5s` | required |
//! | `window.offset` | `-1s` | `0` |
//! | `watermark.lateness` | `500ms` | `0` |
//! | `join.type` | `full` | `inner` |
//! | `join.null_equality` | `is_not_distinct` | `strict` |
//! | `checkpoint.interval` | `10s` | `10s` |
//! | `checkpoint.mode` | `exactly_once` | `exactly_once` |
//! | `checkpoint.max_retained` | `3` | `3` |
//! | `checkpoint.dir` | `/var/lib/job` | in-memory |
//! | `restart.policy` | `fixed-delay` | `fixed-delay` |
//! | `restart.attempts` | `1` | `3` |
//! | `restart.delay` | `100ms` | `1s` |
//! | `state.backend` | `disk:/tmp/state` | `memory` |
//! | `session.time_zone` | `Europe/Berlin` | `UTC` |
//!
//! Durations take an `ms`, `s`, `min` or `h` suffix (bare numbers are
//! milliseconds). Only `window.offset` may be negative.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::checkpoint::{CheckpointConfig, CheckpointMode, RestartPolicy};
use crate::operator::window_join::{JoinType, NullEquality};
use crate::state::StateBackend;

/// Window and watermark settings shared by both inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowConfig {
    /// Tumbling window size.
    pub size: Duration,
    /// Window offset in milliseconds, may be negative.
    pub offset_ms: i64,
    /// Watermark lateness bound.
    pub lateness: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size: Duration::from_secs(5),
            offset_ms: 0,
            lateness: Duration::ZERO,
        }
    }
}

/// Join semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JoinConfig {
    /// Join type.
    pub join_type: JoinType,
    /// Key equality.
    pub null_equality: NullEquality,
}

/// Complete configuration of a window-join job.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobConfig {
    /// Window settings.
    pub window: WindowConfig,
    /// Join settings.
    pub join: JoinConfig,
    /// Checkpoint settings.
    pub checkpoint: CheckpointConfig,
    /// Directory for persisted checkpoints; `None` keeps them in memory.
    pub checkpoint_dir: Option<PathBuf>,
    /// Restart policy.
    pub restart: RestartPolicy,
    /// Backend of the operator state stores.
    pub state_backend: StateBackend,
    /// Session time zone for `TimestampLtz` time columns.
    pub session_time_zone: Option<String>,
}

impl JobConfig {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn builder() -> JobConfigBuilder {
        JobConfigBuilder {
            config: Self::default(),
        }
    }

    /// Parses the string key surface.
    ///
    /// Keys outside the `window.`, `watermark.`, `join.`, `checkpoint.`,
    /// `restart.`, `state.` and `session.` namespaces are ignored; unknown
    /// keys inside them are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a missing `window.size`, an unknown key,
    /// or a value that does not parse.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut builder = Self::builder();
        let size = properties
            .get("window.size")
            .ok_or_else(|| ConfigError::MissingKey("window.size".into()))?;
        builder = builder.window_size(parse_duration("window.size", size)?);

        let mut attempts = None;
        let mut delay = None;
        let mut keys: Vec<&String> = properties.keys().collect();
        keys.sort();
        for key in keys {
            let value = properties[key].as_str();
            builder = match key.as_str() {
                "window.size" => builder,
                "window.offset" => builder.window_offset_ms(parse_signed_millis(key, value)?),
                "watermark.lateness" => builder.lateness(parse_duration(key, value)?),
                "join.type" => builder.join_type(parse_enum(key, value)?),
                "join.null_equality" => builder.null_equality(parse_enum(key, value)?),
                "checkpoint.interval" => builder.checkpoint_interval(parse_duration(key, value)?),
                "checkpoint.mode" => builder.checkpoint_mode(parse_enum(key, value)?),
                "checkpoint.max_retained" => builder.max_retained(parse_enum(key, value)?),
                "checkpoint.dir" => builder.checkpoint_dir(value),
                "restart.policy" => builder.restart_policy(parse_enum(key, value)?),
                "restart.attempts" => {
                    attempts = Some(parse_enum::<u32>(key, value)?);
                    builder
                }
                "restart.delay" => {
                    delay = Some(parse_duration(key, value)?);
                    builder
                }
                "state.backend" => builder.state_backend(parse_enum(key, value)?),
                "session.time_zone" => builder.session_time_zone(value),
                other if is_reserved(other) => {
                    return Err(ConfigError::UnknownKey(other.to_string()));
                }
                _ => builder,
            };
        }

        if attempts.is_some() || delay.is_some() {
            builder = match builder.config.restart {
                RestartPolicy::FixedDelay {
                    attempts: default_attempts,
                    delay: default_delay,
                } => builder.restart_policy(RestartPolicy::fixed_delay(
                    attempts.unwrap_or(default_attempts),
                    delay.unwrap_or(default_delay),
                )),
                RestartPolicy::None => {
                    return Err(ConfigError::Invalid(
                        "restart.attempts and restart.delay require restart.policy=fixed-delay"
                            .into(),
                    ));
                }
            };
        }
        builder.build()
    }

    /// Returns the window size in milliseconds.
    #[must_use]
    pub fn window_size_ms(&self) -> i64 {
        i64::try_from(self.window.size.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Builder for [`JobConfig`].
#[derive(Debug, Clone)]
pub struct JobConfigBuilder {
    config: JobConfig,
}

impl JobConfigBuilder {
    /// Sets the window size.
    #[must_use]
    pub fn window_size(mut self, size: Duration) -> Self {
        self.config.window.size = size;
        self
    }

    /// Sets the window offset in milliseconds.
    #[must_use]
    pub fn window_offset_ms(mut self, offset_ms: i64) -> Self {
        self.config.window.offset_ms = offset_ms;
        self
    }

    /// Sets the watermark lateness bound.
    #[must_use]
    pub fn lateness(mut self, lateness: Duration) -> Self {
        self.config.window.lateness = lateness;
        self
    }

    /// Sets the join type.
    #[must_use]
    pub fn join_type(mut self, join_type: JoinType) -> Self {
        self.config.join.join_type = join_type;
        self
    }

    /// Sets the key equality.
    #[must_use]
    pub fn null_equality(mut self, null_equality: NullEquality) -> Self {
        self.config.join.null_equality = null_equality;
        self
    }

    /// Sets the checkpoint interval.
    #[must_use]
    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.config.checkpoint.interval = interval;
        self
    }

    /// Sets the checkpoint mode.
    #[must_use]
    pub fn checkpoint_mode(mut self, mode: CheckpointMode) -> Self {
        self.config.checkpoint.mode = mode;
        self
    }

    /// Sets how many completed checkpoints are retained.
    #[must_use]
    pub fn max_retained(mut self, max_retained: usize) -> Self {
        self.config.checkpoint.max_retained = max_retained;
        self
    }

    /// Persists checkpoints under `dir`.
    #[must_use]
    pub fn checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.checkpoint_dir = Some(dir.into());
        self
    }

    /// Sets the restart policy.
    #[must_use]
    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.config.restart = policy;
        self
    }

    /// Sets the state backend.
    #[must_use]
    pub fn state_backend(mut self, backend: StateBackend) -> Self {
        self.config.state_backend = backend;
        self
    }

    /// Sets the session time zone.
    #[must_use]
    pub fn session_time_zone(mut self, time_zone: impl Into<String>) -> Self {
        self.config.session_time_zone = Some(time_zone.into());
        self
    }

    /// Validates and builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a zero window size or a zero
    /// checkpoint retention.
    pub fn build(self) -> Result<JobConfig, ConfigError> {
        if self.config.window.size.is_zero() {
            return Err(ConfigError::Invalid("window.size must be positive".into()));
        }
        if self.config.checkpoint.max_retained == 0 {
            return Err(ConfigError::Invalid(
                "checkpoint.max_retained must be at least 1".into(),
            ));
        }
        Ok(self.config)
    }
}

fn is_reserved(key: &str) -> bool {
    ["window.", "watermark.", "join.", "checkpoint.", "restart.", "state.", "session."]
        .iter()
        .any(|prefix| key.starts_with(prefix))
}

fn parse_enum<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Parses a possibly negative duration into milliseconds.
fn parse_signed_millis(key: &str, value: &str) -> Result<i64, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    };
    let trimmed = value.trim();
    let (negative, magnitude) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, trimmed),
    };
    let split = magnitude
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(magnitude.len());
    let (digits, unit) = magnitude.split_at(split);
    if digits.is_empty() {
        return Err(invalid("expected a number"));
    }
    let amount: i64 = digits.parse().map_err(|_| invalid("number out of range"))?;
    let factor = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "ms" => 1,
        "s" | "sec" | "second" | "seconds" => 1_000,
        "min" | "minute" | "minutes" => 60_000,
        "h" | "hour" | "hours" => 3_600_000,
        _ => return Err(invalid("expected an ms, s, min or h suffix")),
    };
    let millis = amount
        .checked_mul(factor)
        .ok_or_else(|| invalid("duration out of range"))?;
    Ok(if negative { -millis } else { millis })
}

/// Parses a non-negative duration.
fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let millis = parse_signed_millis(key, value)?;
    u64::try_from(millis)
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "must not be negative".into(),
        })
}

/// Errors from configuration parsing and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required key is absent.
    #[error("missing configuration key: {0}")]
    MissingKey(String),

    /// An unknown key in a reserved namespace.
    #[error("unknown configuration key: {0}")]
    UnknownKey(String),

    /// A value did not parse.
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Offending value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Settings are inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
