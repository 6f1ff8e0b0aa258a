use thiserror::Error;

use crate::types::Stage;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown material: {0}")]
    UnknownMaterial(String),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Empty pipeline")]
    EmptyPipeline,

    #[error("Stage {0} not present in pipeline")]
    StageNotInPipeline(Stage),

    #[error("Message from {0} carries no correlation token")]
    MissingThread(String),

    #[error("Unexpected protocol tag: expected {expected}, got {got}")]
    UnexpectedProtocol { expected: String, got: String },
}
