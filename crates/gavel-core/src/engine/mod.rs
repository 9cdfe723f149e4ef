//! Evaluation engines: the deterministic trace-scoring runner and the
//! propose/execute/repair loop that drives a live agent subprocess.

pub mod loop_runner;
pub mod runner;

pub use loop_runner::ProposeExecuteRepairRunner;
pub use runner::EvalRunner;
