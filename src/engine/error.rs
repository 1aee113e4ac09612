use crate::model::{Id, Ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Event,
    Resource,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Event => write!(f, "event"),
            Entity::Resource => write!(f, "resource"),
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Entity, Id),
    InvalidSpan { start: Ms, end: Ms },
    DuplicateAllocation { event_id: Id, resource_id: Id },
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(entity, id) => write!(f, "{entity} not found: {id}"),
            EngineError::InvalidSpan { .. } => write!(f, "Start time must be before end time"),
            EngineError::DuplicateAllocation { .. } => {
                write!(f, "Resource already allocated to this event.")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::WalError(e.to_string())
    }
}
