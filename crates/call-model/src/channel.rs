//! A single media leg of a call.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{ChannelState, InvalidTransition};

/// Role a channel plays within its call. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelRole {
    /// The leg that originated the call
    Originator,
    /// The dialed party's leg
    Destination,
    /// A leg joined through a bridge
    BridgedLeg,
    /// A consultation leg (attended transfer)
    Consultation,
}

/// One media leg of a call on the telephony switch.
///
/// A channel is exclusively owned by its call's channel map and never
/// outlives the call. State only moves through
/// [`transition_to`](Channel::transition_to) or the validated helpers below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub channel_uuid: String,
    /// Owning call
    pub call_uuid: String,
    role: ChannelRole,
    state: ChannelState,
    /// Raw call-state string as reported by the switch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detailed_state: Option<String>,
    pub created_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answered_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hangup_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hangup_cause: Option<String>,
    pub bridged: bool,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl Channel {
    pub fn new(
        channel_uuid: impl Into<String>,
        call_uuid: impl Into<String>,
        role: ChannelRole,
    ) -> Self {
        Self {
            channel_uuid: channel_uuid.into(),
            call_uuid: call_uuid.into(),
            role,
            state: ChannelState::Creating,
            detailed_state: None,
            created_time: Utc::now(),
            answered_time: None,
            hangup_time: None,
            hangup_cause: None,
            bridged: false,
            variables: HashMap::new(),
        }
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Apply a validated transition. Timestamps are stamped for the states
    /// that carry them; on rejection the channel is untouched.
    pub fn transition_to(&mut self, target: ChannelState) -> Result<(), InvalidTransition> {
        self.state.validate_transition(target)?;
        self.state = target;
        match target {
            ChannelState::Answered if self.answered_time.is_none() => {
                self.answered_time = Some(Utc::now());
            }
            ChannelState::Bridged => self.bridged = true,
            ChannelState::Unbridged => self.bridged = false,
            ChannelState::Hangup | ChannelState::Failed => {
                self.hangup_time = Some(Utc::now());
            }
            _ => {}
        }
        Ok(())
    }

    pub fn ring(&mut self) -> Result<(), InvalidTransition> {
        self.transition_to(ChannelState::Ringing)
    }

    pub fn answer(&mut self) -> Result<(), InvalidTransition> {
        self.transition_to(ChannelState::Answered)
    }

    pub fn bridge(&mut self) -> Result<(), InvalidTransition> {
        self.transition_to(ChannelState::Bridged)
    }

    pub fn unbridge(&mut self) -> Result<(), InvalidTransition> {
        self.transition_to(ChannelState::Unbridged)
    }

    pub fn hold(&mut self) -> Result<(), InvalidTransition> {
        self.transition_to(ChannelState::Held)
    }

    pub fn unhold(&mut self) -> Result<(), InvalidTransition> {
        self.transition_to(ChannelState::Answered)
    }

    pub fn start_transfer(&mut self) -> Result<(), InvalidTransition> {
        self.transition_to(ChannelState::Transferring)
    }

    pub fn hangup(&mut self, cause: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition_to(ChannelState::Hangup)?;
        self.hangup_cause = Some(cause.into());
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition_to(ChannelState::Failed)?;
        self.hangup_cause = Some(reason.into());
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, ChannelState::Answered | ChannelState::Bridged)
    }

    /// Talk time: answer to hangup, or answer to now while still up.
    pub fn duration(&self) -> Duration {
        match self.answered_time {
            Some(answered) => {
                let end = self.hangup_time.unwrap_or_else(Utc::now);
                end - answered
            }
            None => Duration::zero(),
        }
    }
}
