//! Run artifacts and run-to-run analysis.
//!
//! A completed evaluation is persisted as an *evidence pack*: a directory
//! holding the run config, summary, flattened event log, per-case
//! trajectories and verdicts, per-judge result files and a manifest. This
//! crate writes and reads those packs, verifies saved runs by replaying
//! them (pure re-scoring or full re-execution) and diffs two packs into a
//! regression/risk report.

pub mod compare;
pub mod errors;
pub mod pack;
pub mod replay;

pub use errors::EvidenceError;
