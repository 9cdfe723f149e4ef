//! Deterministic evaluation of recorded agent executions.
//!
//! A *trace* (ordered messages, tool calls and tool results) is scored by a
//! set of pure judges; the runner folds judge verdicts into case- and
//! run-level results that downstream replay, comparison and stability
//! tooling consume. Determinism is the core contract: the same suite, the
//! same judge configuration and the same pinned environment always produce
//! the same verdicts.

pub mod engine;
pub mod environment;
pub mod errors;
pub mod judge;
pub mod model;
pub(crate) mod process;
pub mod stability;
pub mod validate;

pub use errors::CoreError;
