//! # Switch Events
//!
//! Typed representation of the event messages a telephony switch publishes:
//! a closed [`EventType`] enum, the [`Event`] value wrapping an opaque
//! attribute set with typed accessors, and the parameter-name constants the
//! switch uses.
//!
//! Decoding is strict at the boundary: a payload without a recognizable
//! event type is a terminal per-message error ([`EventError`]), never a
//! silently-dropped message.

pub mod error;
pub mod event;
pub mod params;
pub mod types;

pub use error::EventError;
pub use event::Event;
pub use types::EventType;
