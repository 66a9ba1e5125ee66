//! # `WindJoin` Core
//!
//! A windowed stream-join engine over Arrow record batches.
//!
//! This crate provides:
//! - **Time**: event-time extraction with session time zones, per-stream
//!   watermarks and timers
//! - **State**: keyed state stores, in memory or memory-mapped on disk
//! - **Operators**: tumbling-window triggers and the two-input window join
//!   (inner, outer, semi and anti, with `EXISTS`/`IN` semantics)
//! - **Checkpointing**: barriers, alignment, snapshots, recovery and restart
//! - **Pipeline**: a driver wiring sources, operators and an epoch sink with
//!   exactly-once output
//!
//! ## Example
//!
//! ```rust,ignore
//! use windjoin_core::config::JobConfig;
//! use windjoin_core::pipeline::{StreamInput, WindowJoinPipeline};
//! use windjoin_core::sink::CollectingSink;
//!
//! let config = JobConfig::from_properties(&properties)?;
//! let mut pipeline = WindowJoinPipeline::builder(config, CollectingSink::new())
//!     .left(StreamInput::new(orders, "ts"))
//!     .right(StreamInput::new(payments, "ts"))
//!     .join_key("order_id", "order_id")
//!     .build()?;
//! pipeline.run()?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod checkpoint;
pub mod config;
pub mod datum;
pub mod operator;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod state;
pub mod time;

// Re-export key types
pub use config::JobConfig;
pub use datum::Datum;
pub use operator::window_join::{JoinType, NullEquality, WindowJoinOperator};
pub use pipeline::{StreamInput, WindowJoinPipeline};

/// Result type for windjoin-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for windjoin-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// State store errors
    #[error("State error: {0}")]
    State(#[from] state::StateError),

    /// Operator errors
    #[error("Operator error: {0}")]
    Operator(#[from] operator::OperatorError),

    /// Time-related errors
    #[error("Time error: {0}")]
    Time(#[from] time::TimeError),

    /// Checkpoint errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] checkpoint::CheckpointError),

    /// Source errors
    #[error("Source error: {0}")]
    Source(#[from] source::SourceError),

    /// Sink errors
    #[error("Sink error: {0}")]
    Sink(#[from] sink::SinkError),

    /// Pipeline errors
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] pipeline::PipelineError),
}
