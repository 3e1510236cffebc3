use thiserror::Error;

/// The closed error taxonomy surfaced by every pipeline operation.
///
/// Each variant maps to exactly one CLI exit code; see `PipelineError::exit_code`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transient network error talking to item source: {0}")]
    TransientNetwork(String),

    #[error("dump {job} is in state {actual:?}, which is earlier than required {required:?}")]
    DumpStateTooEarly {
        job: String,
        actual: crate::dump::DumpState,
        required: crate::dump::DumpState,
    },

    #[error("dump {job} is in state {actual:?}, which is later than allowed {allowed:?}")]
    DumpStateTooLate {
        job: String,
        actual: crate::dump::DumpState,
        allowed: crate::dump::DumpState,
    },

    #[error("dump {job} is corrupted: expected {expected} versions, found {found}")]
    DumpCorrupted {
        job: String,
        expected: i64,
        found: i64,
    },

    #[error("store rejected row in entity {entity}: {reason}")]
    StoreRowRejected { entity: String, reason: String },

    #[error("store error: {0}")]
    StoreFatal(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::TransientNetwork(_) => 10,
            PipelineError::DumpStateTooEarly { .. } => 11,
            PipelineError::DumpStateTooLate { .. } => 12,
            PipelineError::DumpCorrupted { .. } => 13,
            PipelineError::StoreRowRejected { .. } => 14,
            PipelineError::StoreFatal(_) => 1,
            PipelineError::Config(_) => 2,
        }
    }
}

impl From<duckdb::Error> for PipelineError {
    fn from(e: duckdb::Error) -> Self {
        PipelineError::StoreFatal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::DumpState;

    #[test]
    fn exit_codes_are_documented_per_variant() {
        let cases: Vec<(PipelineError, i32)> = vec![
            (PipelineError::TransientNetwork("x".into()), 10),
            (
                PipelineError::DumpStateTooEarly {
                    job: "j".into(),
                    actual: DumpState::Created,
                    required: DumpState::Prepared,
                },
                11,
            ),
            (
                PipelineError::DumpStateTooLate {
                    job: "j".into(),
                    actual: DumpState::Processed,
                    allowed: DumpState::Processing,
                },
                12,
            ),
            (
                PipelineError::DumpCorrupted {
                    job: "j".into(),
                    expected: 100,
                    found: 99,
                },
                13,
            ),
            (
                PipelineError::StoreRowRejected {
                    entity: "sku".into(),
                    reason: "bad".into(),
                },
                14,
            ),
            (PipelineError::StoreFatal("boom".into()), 1),
            (PipelineError::Config("missing key".into()), 2),
        ];
        for (err, expected) in cases {
            assert_eq!(err.exit_code(), expected);
        }
    }
}
