use std::path::PathBuf;

use thiserror::Error;

use gavel_core::CoreError;

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("failed to write {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not find summary.json in {0}")]
    MissingSummary(PathBuf),

    #[error(
        "execution replay requires an execution-mode evidence pack \
         (run config execution_mode must be 'propose_execute_repair')"
    )]
    NotExecutionRun,

    #[error("runs are not comparable: {0}")]
    Incompatible(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}
