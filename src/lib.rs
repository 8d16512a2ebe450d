//! Indicator Fusion - batched query fusion for metric indicators
//!
//! This library turns a batch of indicator requests into as few backend
//! queries as possible:
//! - Canonical, order-insensitive fingerprints of filters and group lists
//! - Compute families of requests that can share one statement
//! - Per-dialect rewriting of approximate aggregates and sketches
//! - Dispatch with polling, backoff, cancellation and async submission
//! - Demultiplexing of statements and result rows back to indicators
//!
//! # Example
//!
//! ```rust
//! use indicator_fusion::canonical::hash_predicate;
//!
//! assert_eq!(
//!     hash_predicate("a = 1 AND b = 2").unwrap(),
//!     hash_predicate("b = 2 AND a = 1").unwrap(),
//! );
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

/// Canonical forms and hashes of predicates and lists
pub mod canonical;

/// Grouping of requests into compute families
pub mod family;

/// Per-backend aggregate rewriting
pub mod dialect;

/// Fused statement assembly
pub mod assembler;

/// Backend dispatch, retries and result demultiplexing
pub mod dispatch;

/// Whole-batch execution
pub mod batch;

/// Configuration management with TOML support
pub mod config;

/// Prometheus metrics
pub mod metrics;

/// Tracing subscriber setup
pub mod telemetry;

// Re-export main types
pub use batch::{BatchOutcome, DispatchMode, EngineOptions, FusionEngine, PendingExecution};
pub use config::FusionConfig;
pub use dispatch::{Dispatcher, ExecutionBackend, ExecutionHandle, IndicatorValue};
pub use error::{BackendError, DispatchError, Error, ParseError, Result};
pub use types::{IndicatorId, IndicatorRequest, IndicatorStatus, StatusMetadata};
