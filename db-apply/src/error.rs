use thiserror::Error;

/// Everything that can go wrong applying one job message. The variant
/// decides the delivery outcome: only `Database` failures are ever
/// requeue-eligible; the rest describe the message itself, which no
/// redelivery can fix.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("invalid message: {0}")]
    MalformedJson(String),
    #[error("invalid message shape: {0}")]
    MalformedShape(String),
    #[error("op not allowed: {0}")]
    OpDenied(String),
    #[error("table not allowed: {0}")]
    TableDenied(String),
    #[error("unsupported op: {0}")]
    UnsupportedOp(String),
    #[error("unsupported message format")]
    UnsupportedShape,
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("database error: {0}")]
    Database(String),
}

impl ApplyError {
    pub fn requeue_eligible(&self) -> bool {
        matches!(self, ApplyError::Database(_))
    }
}
