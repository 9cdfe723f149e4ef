use thiserror::Error;

/// Library-level errors for suite loading, judge construction and the
/// repeated-run analyzer. Evaluation itself never errors: structural
/// problems surface as failing judge results, not as `Err`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to read suite file {path}")]
    SuiteRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse suite file {path}")]
    SuiteParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("duplicate case_id '{case_id}' in suite '{dataset_id}'")]
    DuplicateCaseId { dataset_id: String, case_id: String },

    #[error("unknown judge '{0}': not a built-in and not registered as a plugin")]
    UnknownJudge(String),

    #[error("invalid configuration for judge '{judge}'")]
    JudgeConfig {
        judge: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid pattern '{pattern}' for judge '{judge}'")]
    JudgePattern {
        judge: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("empty agent command")]
    EmptyCommand,

    #[error("unbalanced quote in agent command: {0}")]
    UnbalancedCommand(String),

    #[error("stability check requires at least 2 runs, got {0}")]
    NotEnoughRuns(u32),

    #[error("propose_command is required for execution_mode=propose_execute_repair")]
    MissingProposeCommand,
}
