use thiserror::Error;

/// Errors raised while decoding or reading switch events.
#[derive(Debug, Error)]
pub enum EventError {
    /// Payload is not valid JSON or not an attribute map
    #[error("malformed event payload: {0}")]
    Malformed(String),

    /// The event-type attribute is absent
    #[error("event type is missing")]
    MissingType,

    /// The event-type attribute names a type outside the schema
    #[error("unknown event type: {0}")]
    UnknownType(String),

    /// A required parameter is absent or null
    #[error("required parameter {0} is missing")]
    MissingParam(&'static str),

    /// A parameter is present but not parseable as the requested type
    #[error("invalid value for parameter {0}: {1}")]
    InvalidParam(&'static str, String),
}

/// Result type for event decoding operations.
pub type Result<T> = std::result::Result<T, EventError>;
