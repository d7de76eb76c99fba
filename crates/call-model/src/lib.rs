//! # Call/Channel Domain Model
//!
//! Core entities for the callgrid control plane: the [`Call`] aggregate, its
//! [`Channel`] media legs, and the validated state machines both move through
//! as switch events arrive.
//!
//! State transitions are never applied blindly: every mutation goes through
//! the allowed-transition tables in [`state`], and an attempt outside the
//! table returns [`InvalidTransition`] without touching the entity.
//!
//! ## Modules
//!
//! - [`state`]: `CallState` / `ChannelState` enums and transition tables
//! - [`call`]: the `Call` aggregate root
//! - [`channel`]: a single media leg of a call
//! - [`dtmf`]: keypress events appended to a call's history

pub mod call;
pub mod channel;
pub mod dtmf;
pub mod state;

pub use call::{Call, DialParams};
pub use channel::{Channel, ChannelRole};
pub use dtmf::{DtmfEvent, DtmfKind};
pub use state::{CallState, ChannelState, InvalidTransition};
