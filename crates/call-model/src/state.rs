//! Call and channel state machines.
//!
//! Both enums carry an explicit allowed-transition table; a transition not
//! present in the table is rejected with [`InvalidTransition`] and leaves the
//! entity unchanged.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A state transition that is not present in the allowed-transition table.
///
/// Carries both endpoints so callers can decide whether to log-and-continue
/// or propagate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: String,
    pub to: String,
}

/// Lifecycle state of a [`Call`](crate::Call).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    /// Initial state
    Idle,
    /// Outbound: dialing, inbound: ringing
    Ringing,
    /// Early media detected
    EarlyMedia,
    /// Call answered and active
    Active,
    /// Attended transfer in progress
    TransferInProgress,
    /// Transfer completed
    Transferred,
    /// Call on hold
    OnHold,
    /// Call in conference
    Conferencing,
    /// Normal termination
    Ended,
    /// Call failed
    Failed,
    /// No answer
    TimedOut,
}

impl CallState {
    /// Allowed target states from `self`.
    pub fn allowed_transitions(&self) -> &'static [CallState] {
        use CallState::*;
        match self {
            Idle => &[Ringing],
            Ringing => &[EarlyMedia, Active, OnHold, Ended, Failed, TimedOut],
            EarlyMedia => &[Active, Ended, Failed, OnHold],
            Active => &[OnHold, TransferInProgress, Conferencing, Ended, Failed],
            TransferInProgress => &[Active, OnHold, Transferred, Ended, Failed],
            OnHold => &[Active, Ended, Failed, Conferencing],
            Conferencing => &[Active, OnHold, Ended, Failed],
            Transferred | Ended | Failed | TimedOut => &[],
        }
    }

    pub fn can_transition_to(&self, target: CallState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn validate_transition(&self, target: CallState) -> Result<(), InvalidTransition> {
        if self.can_transition_to(target) {
            Ok(())
        } else {
            Err(InvalidTransition {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// The call still occupies switch resources.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CallState::Active
                | CallState::OnHold
                | CallState::Conferencing
                | CallState::TransferInProgress
        )
    }

    /// No outgoing transitions remain.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Ended | CallState::Failed | CallState::TimedOut | CallState::Transferred
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, CallState::Failed | CallState::TimedOut)
    }

    fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "IDLE",
            CallState::Ringing => "RINGING",
            CallState::EarlyMedia => "EARLY_MEDIA",
            CallState::Active => "ACTIVE",
            CallState::TransferInProgress => "TRANSFER_IN_PROGRESS",
            CallState::Transferred => "TRANSFERRED",
            CallState::OnHold => "ON_HOLD",
            CallState::Conferencing => "CONFERENCING",
            CallState::Ended => "ENDED",
            CallState::Failed => "FAILED",
            CallState::TimedOut => "TIMED_OUT",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IDLE" => Ok(CallState::Idle),
            "RINGING" => Ok(CallState::Ringing),
            "EARLY_MEDIA" => Ok(CallState::EarlyMedia),
            "ACTIVE" => Ok(CallState::Active),
            "TRANSFER_IN_PROGRESS" => Ok(CallState::TransferInProgress),
            "TRANSFERRED" => Ok(CallState::Transferred),
            "ON_HOLD" => Ok(CallState::OnHold),
            "CONFERENCING" => Ok(CallState::Conferencing),
            "ENDED" => Ok(CallState::Ended),
            "FAILED" => Ok(CallState::Failed),
            "TIMED_OUT" => Ok(CallState::TimedOut),
            other => Err(format!("unexpected call state: {other}")),
        }
    }
}

/// Lifecycle state of a single [`Channel`](crate::Channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelState {
    /// Channel being created
    Creating,
    /// Channel is ringing
    Ringing,
    /// Early media (progress)
    EarlyMedia,
    /// Channel answered
    Answered,
    /// Channel bridged to another
    Bridged,
    /// Channel was unbridged (transfer start)
    Unbridged,
    /// Channel was held
    Held,
    /// Transfer in progress
    Transferring,
    /// Channel terminated
    Hangup,
    /// Channel failed
    Failed,
}

impl ChannelState {
    pub fn allowed_transitions(&self) -> &'static [ChannelState] {
        use ChannelState::*;
        match self {
            Creating => &[Ringing, Failed, Hangup],
            Ringing => &[EarlyMedia, Answered, Failed, Hangup],
            EarlyMedia => &[Answered, Failed, Hangup],
            Answered => &[Bridged, Held, Transferring, Hangup, Failed],
            Bridged => &[Unbridged, Held, Hangup, Failed],
            Unbridged => &[Transferring, Answered, Hangup, Failed],
            Held => &[Answered, Hangup, Failed],
            Transferring => &[Hangup, Failed],
            Hangup | Failed => &[],
        }
    }

    pub fn can_transition_to(&self, target: ChannelState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn validate_transition(&self, target: ChannelState) -> Result<(), InvalidTransition> {
        if self.can_transition_to(target) {
            Ok(())
        } else {
            Err(InvalidTransition {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ChannelState::Answered | ChannelState::Bridged | ChannelState::Transferring
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Hangup | ChannelState::Failed)
    }

    fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Creating => "CREATING",
            ChannelState::Ringing => "RINGING",
            ChannelState::EarlyMedia => "EARLY_MEDIA",
            ChannelState::Answered => "ANSWERED",
            ChannelState::Bridged => "BRIDGED",
            ChannelState::Unbridged => "UNBRIDGED",
            ChannelState::Held => "HELD",
            ChannelState::Transferring => "TRANSFERRING",
            ChannelState::Hangup => "HANGUP",
            ChannelState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATING" => Ok(ChannelState::Creating),
            "RINGING" => Ok(ChannelState::Ringing),
            "EARLY_MEDIA" => Ok(ChannelState::EarlyMedia),
            "ANSWERED" => Ok(ChannelState::Answered),
            "BRIDGED" => Ok(ChannelState::Bridged),
            "UNBRIDGED" => Ok(ChannelState::Unbridged),
            "HELD" => Ok(ChannelState::Held),
            "TRANSFERRING" => Ok(ChannelState::Transferring),
            "HANGUP" => Ok(ChannelState::Hangup),
            "FAILED" => Ok(ChannelState::Failed),
            other => Err(format!("unknown channel state: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_transitions_follow_table() {
        assert!(CallState::Idle.can_transition_to(CallState::Ringing));
        assert!(CallState::Ringing.can_transition_to(CallState::Active));
        assert!(CallState::Active.can_transition_to(CallState::TransferInProgress));
        assert!(CallState::TransferInProgress.can_transition_to(CallState::Transferred));
        assert!(!CallState::Idle.can_transition_to(CallState::Active));
        assert!(!CallState::Active.can_transition_to(CallState::Ringing));
    }

    #[test]
    fn terminal_call_states_have_no_exits() {
        for state in [
            CallState::Ended,
            CallState::Failed,
            CallState::TimedOut,
            CallState::Transferred,
        ] {
            assert!(state.allowed_transitions().is_empty());
            assert!(state.is_terminal());
        }
    }

    #[test]
    fn every_disallowed_call_pair_is_rejected() {
        let all = [
            CallState::Idle,
            CallState::Ringing,
            CallState::EarlyMedia,
            CallState::Active,
            CallState::TransferInProgress,
            CallState::Transferred,
            CallState::OnHold,
            CallState::Conferencing,
            CallState::Ended,
            CallState::Failed,
            CallState::TimedOut,
        ];
        for from in all {
            for to in all {
                let expected = from.allowed_transitions().contains(&to);
                assert_eq!(from.validate_transition(to).is_ok(), expected);
            }
        }
    }

    #[test]
    fn channel_transitions_follow_table() {
        assert!(ChannelState::Creating.can_transition_to(ChannelState::Ringing));
        assert!(ChannelState::Ringing.can_transition_to(ChannelState::Answered));
        assert!(ChannelState::Answered.can_transition_to(ChannelState::Bridged));
        assert!(!ChannelState::Answered.can_transition_to(ChannelState::Ringing));
        assert!(ChannelState::Hangup.allowed_transitions().is_empty());
        assert!(ChannelState::Failed.allowed_transitions().is_empty());
    }

    #[test]
    fn invalid_transition_reports_endpoints() {
        let err = CallState::Active
            .validate_transition(CallState::Ringing)
            .unwrap_err();
        assert_eq!(err.from, "ACTIVE");
        assert_eq!(err.to, "RINGING");
    }

    #[test]
    fn states_round_trip_through_strings() {
        assert_eq!(
            "transfer_in_progress".parse::<CallState>().unwrap(),
            CallState::TransferInProgress
        );
        assert_eq!(CallState::OnHold.to_string(), "ON_HOLD");
        assert_eq!("HELD".parse::<ChannelState>().unwrap(), ChannelState::Held);
        assert!("BOGUS".parse::<CallState>().is_err());
    }
}
