use thiserror::Error;

use callgrid_call_model::InvalidTransition;
use callgrid_switch_events::EventError;

use crate::store::StoreError;

/// Call engine errors
#[derive(Error, Debug)]
pub enum CallEngineError {
    /// Shared store errors
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Event decode / schema errors
    #[error("event error: {0}")]
    Event(#[from] EventError),

    /// Rejected state transition
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Transport errors
    #[error("transport error: {0}")]
    Transport(String),

    /// Registry errors
    #[error("registry error: {0}")]
    Registry(String),

    /// Cluster / membership errors
    #[error("cluster error: {0}")]
    Cluster(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Timeout
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Service is shutting down, no new work accepted
    #[error("service is shutting down")]
    ShuttingDown,

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl CallEngineError {
    /// Create a new Transport error
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a new Registry error
    pub fn registry<S: Into<String>>(msg: S) -> Self {
        Self::Registry(msg.into())
    }

    /// Create a new Cluster error
    pub fn cluster<S: Into<String>>(msg: S) -> Self {
        Self::Cluster(msg.into())
    }

    /// Create a new Config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new NotFound error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new Timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new Internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type for call engine operations
pub type Result<T> = std::result::Result<T, CallEngineError>;
