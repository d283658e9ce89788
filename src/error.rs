use simple_error::SimpleError;
use thiserror::Error;

use crate::batch::UnitKey;

#[derive(Debug, Error)]
pub enum RfError {
    #[error("data shape error: {0}")]
    DataShape(String),

    #[error("optimization error: {0}")]
    Optimization(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(#[from] SimpleError),

    #[error("fit failed for {key}: {source}")]
    UnitFailed {
        key: UnitKey,
        #[source]
        source: Box<RfError>,
    },

    #[error("session {session_id} not found, available sessions: {available:?}")]
    SessionNotFound {
        session_id: String,
        available: Vec<String>,
    },

    #[error("brain area {requested} does not exist, possible values are {available:?}")]
    UnknownBrainArea {
        requested: String,
        available: Vec<String>,
    },

    #[error("worker thread failed: {0}")]
    Worker(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RfError {
    pub fn is_optimization_error(&self) -> bool {
        match self {
            RfError::Optimization(_) => true,
            RfError::UnitFailed { source, .. } => source.is_optimization_error(),
            _ => false,
        }
    }
}

pub type RfResult<T> = Result<T, RfError>;
