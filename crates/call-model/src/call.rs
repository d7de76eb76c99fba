//! The call aggregate root.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::{Channel, ChannelRole};
use crate::dtmf::DtmfEvent;
use crate::state::{CallState, ChannelState, InvalidTransition};

/// Dialing parameters a call is created with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialParams {
    /// Dialed target (extension / destination number)
    pub extension: String,
    pub caller_id_name: String,
    pub caller_id_number: String,
    /// Dial URL handed to the switch
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub call_url: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub application_name: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub application_arguments: String,
    #[serde(default)]
    pub custom_variables: HashMap<String, String>,
}

/// One end-to-end telephony session.
///
/// Aggregate root: exclusively owns its channels and the append-only DTMF
/// history. All state movement goes through [`transition_to`](Call::transition_to),
/// which validates against the call state machine before mutating anything.
/// `previous_state` always holds the state that was current immediately
/// before the last applied transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub call_uuid: String,
    #[serde(flatten)]
    pub params: DialParams,

    /// Switch node that owns this call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub switch_node_id: Option<String>,
    /// Service instance that owns this call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    pub orphaned: bool,
    /// Instance that lost the call, while orphaned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orphaned_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orphaned_at: Option<DateTime<Utc>>,

    current_state: CallState,
    previous_state: CallState,
    pub early_media_detected: bool,

    pub create_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub early_media_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_timestamp: Option<DateTime<Utc>>,
    /// Milliseconds from answer (or creation, if never answered) to end
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hangup_cause: Option<String>,

    #[serde(default)]
    channels: HashMap<String, Channel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    originator_channel_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    destination_channel_uuid: Option<String>,

    pub being_transferred: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_target: Option<String>,

    #[serde(default)]
    dtmf_history: Vec<DtmfEvent>,
}

impl Call {
    pub fn new(call_uuid: impl Into<String>, params: DialParams) -> Self {
        Self {
            call_uuid: call_uuid.into(),
            params,
            switch_node_id: None,
            instance_id: None,
            orphaned: false,
            orphaned_from: None,
            orphaned_at: None,
            current_state: CallState::Idle,
            previous_state: CallState::Idle,
            early_media_detected: false,
            create_time: Utc::now(),
            early_media_time: None,
            answer_time: None,
            end_time: None,
            last_update_timestamp: Some(Utc::now()),
            duration_ms: None,
            hangup_cause: None,
            channels: HashMap::new(),
            originator_channel_uuid: None,
            destination_channel_uuid: None,
            being_transferred: false,
            transfer_target: None,
            dtmf_history: Vec::new(),
        }
    }

    pub fn current_state(&self) -> CallState {
        self.current_state
    }

    pub fn previous_state(&self) -> CallState {
        self.previous_state
    }

    /// Apply a validated state transition.
    ///
    /// Entering ACTIVE stamps the answer time; entering a terminal state
    /// stamps the end time and computes the duration from the answer time
    /// (creation time if the call was never answered). On rejection nothing
    /// is mutated.
    pub fn transition_to(&mut self, target: CallState) -> Result<(), InvalidTransition> {
        self.current_state.validate_transition(target)?;
        self.previous_state = self.current_state;
        self.current_state = target;

        match target {
            CallState::Active => {
                self.answer_time = Some(Utc::now());
            }
            CallState::Ended | CallState::Failed | CallState::TimedOut | CallState::Transferred => {
                let end = Utc::now();
                self.end_time = Some(end);
                let started = self.answer_time.unwrap_or(self.create_time);
                self.duration_ms = Some((end - started).num_milliseconds());
            }
            CallState::TransferInProgress => {
                self.being_transferred = true;
            }
            _ => {}
        }
        self.touch();
        Ok(())
    }

    /// Refresh the last-update stamp.
    pub fn touch(&mut self) {
        self.last_update_timestamp = Some(Utc::now());
    }

    // ----- channels -----

    /// Insert a channel; originator/destination references track the role.
    pub fn add_channel(&mut self, channel: Channel) {
        match channel.role() {
            ChannelRole::Originator => {
                self.originator_channel_uuid = Some(channel.channel_uuid.clone());
            }
            ChannelRole::Destination => {
                self.destination_channel_uuid = Some(channel.channel_uuid.clone());
            }
            _ => {}
        }
        self.channels.insert(channel.channel_uuid.clone(), channel);
    }

    pub fn channel(&self, channel_uuid: &str) -> Option<&Channel> {
        self.channels.get(channel_uuid)
    }

    pub fn channel_mut(&mut self, channel_uuid: &str) -> Option<&mut Channel> {
        self.channels.get_mut(channel_uuid)
    }

    pub fn remove_channel(&mut self, channel_uuid: &str) -> Option<Channel> {
        self.channels.remove(channel_uuid)
    }

    pub fn channels(&self) -> &HashMap<String, Channel> {
        &self.channels
    }

    pub fn channel_ids(&self) -> impl Iterator<Item = &String> {
        self.channels.keys()
    }

    pub fn originator_channel(&self) -> Option<&Channel> {
        self.originator_channel_uuid
            .as_deref()
            .and_then(|id| self.channels.get(id))
    }

    pub fn destination_channel(&self) -> Option<&Channel> {
        self.destination_channel_uuid
            .as_deref()
            .and_then(|id| self.channels.get(id))
    }

    /// A call is fully ended only when every channel has reached HANGUP.
    pub fn all_channels_hangup(&self) -> bool {
        self.channels
            .values()
            .all(|c| c.state() == ChannelState::Hangup)
    }

    // ----- transfer -----

    pub fn initiate_transfer(&mut self, target: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transfer_target = Some(target.into());
        self.transition_to(CallState::TransferInProgress)
    }

    pub fn complete_transfer(&mut self) -> Result<(), InvalidTransition> {
        self.transition_to(CallState::Transferred)?;
        self.being_transferred = false;
        Ok(())
    }

    // ----- misc -----

    pub fn set_early_media_detected(&mut self, detected: bool) {
        self.early_media_detected = detected;
        if detected {
            self.early_media_time = Some(Utc::now());
        }
    }

    pub fn mark_orphaned(&mut self, lost_by: impl Into<String>, at: DateTime<Utc>) {
        self.orphaned = true;
        self.orphaned_from = Some(lost_by.into());
        self.orphaned_at = Some(at);
        self.touch();
    }

    /// Adopt the call into a new owning instance, clearing the orphan marker.
    pub fn adopt(&mut self, instance_id: impl Into<String>) {
        self.orphaned = false;
        self.orphaned_from = None;
        self.orphaned_at = None;
        self.instance_id = Some(instance_id.into());
        self.touch();
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.current_state,
            CallState::Active | CallState::Ringing | CallState::OnHold | CallState::Conferencing
        )
    }

    /// Talk time so far, zero until answered.
    pub fn duration(&self) -> Duration {
        match self.answer_time {
            Some(answered) => self.end_time.unwrap_or_else(Utc::now) - answered,
            None => Duration::zero(),
        }
    }

    pub fn add_dtmf_event(&mut self, event: DtmfEvent) {
        self.dtmf_history.push(event);
    }

    pub fn dtmf_history(&self) -> &[DtmfEvent] {
        &self.dtmf_history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call() -> Call {
        Call::new(
            "call-1",
            DialParams {
                extension: "1003".into(),
                caller_id_name: "Test".into(),
                caller_id_number: "9876543210".into(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn ringing_then_active_stamps_answer_and_previous_state() {
        let mut c = call();
        c.transition_to(CallState::Ringing).unwrap();
        c.transition_to(CallState::Active).unwrap();
        assert_eq!(c.current_state(), CallState::Active);
        assert_eq!(c.previous_state(), CallState::Ringing);
        assert!(c.answer_time.is_some());
    }

    #[test]
    fn active_to_ringing_is_rejected_without_mutation() {
        let mut c = call();
        c.transition_to(CallState::Ringing).unwrap();
        c.transition_to(CallState::Active).unwrap();
        let before_prev = c.previous_state();
        assert!(c.transition_to(CallState::Ringing).is_err());
        assert_eq!(c.current_state(), CallState::Active);
        assert_eq!(c.previous_state(), before_prev);
    }

    #[test]
    fn terminal_transition_computes_duration_from_answer() {
        let mut c = call();
        c.transition_to(CallState::Ringing).unwrap();
        c.transition_to(CallState::Active).unwrap();
        c.transition_to(CallState::Ended).unwrap();
        assert!(c.end_time.is_some());
        assert!(c.duration_ms.is_some());
        assert!(c.duration_ms.unwrap() >= 0);
    }

    #[test]
    fn unanswered_call_measures_duration_from_creation() {
        let mut c = call();
        c.transition_to(CallState::Ringing).unwrap();
        c.transition_to(CallState::TimedOut).unwrap();
        assert!(c.answer_time.is_none());
        assert!(c.duration_ms.unwrap() >= 0);
    }

    #[test]
    fn channel_roles_are_indexed() {
        let mut c = call();
        c.add_channel(Channel::new("ch-a", "call-1", ChannelRole::Originator));
        c.add_channel(Channel::new("ch-b", "call-1", ChannelRole::Destination));
        assert_eq!(
            c.originator_channel().unwrap().channel_uuid,
            "ch-a".to_string()
        );
        assert_eq!(
            c.destination_channel().unwrap().channel_uuid,
            "ch-b".to_string()
        );
    }

    #[test]
    fn all_channels_hangup_requires_every_leg() {
        let mut c = call();
        let mut a = Channel::new("ch-a", "call-1", ChannelRole::Originator);
        a.ring().unwrap();
        a.hangup("NORMAL_CLEARING").unwrap();
        c.add_channel(a);
        let mut b = Channel::new("ch-b", "call-1", ChannelRole::Destination);
        b.ring().unwrap();
        c.add_channel(b);
        assert!(!c.all_channels_hangup());
        c.channel_mut("ch-b")
            .unwrap()
            .hangup("NORMAL_CLEARING")
            .unwrap();
        assert!(c.all_channels_hangup());
    }

    #[test]
    fn transfer_flow_sets_and_clears_flag() {
        let mut c = call();
        c.transition_to(CallState::Ringing).unwrap();
        c.transition_to(CallState::Active).unwrap();
        c.initiate_transfer("sip:2001@pbx").unwrap();
        assert!(c.being_transferred);
        assert_eq!(c.current_state(), CallState::TransferInProgress);
        c.complete_transfer().unwrap();
        assert!(!c.being_transferred);
        assert_eq!(c.current_state(), CallState::Transferred);
    }

    #[test]
    fn orphan_mark_and_adopt_round_trip() {
        let mut c = call();
        c.instance_id = Some("i1".into());
        c.mark_orphaned("i1", Utc::now());
        assert!(c.orphaned);
        assert_eq!(c.orphaned_from.as_deref(), Some("i1"));
        c.adopt("i2");
        assert!(!c.orphaned);
        assert!(c.orphaned_from.is_none());
        assert_eq!(c.instance_id.as_deref(), Some("i2"));
    }

    #[test]
    fn dtmf_history_is_append_only_ordered() {
        let mut c = call();
        for digit in ["1", "2", "3"] {
            c.add_dtmf_event(DtmfEvent::new(
                digit,
                120,
                ChannelRole::Originator,
                Utc::now(),
                "call-1",
                "ch-a",
            ));
        }
        let digits: Vec<_> = c.dtmf_history().iter().map(|e| e.digit.as_str()).collect();
        assert_eq!(digits, vec!["1", "2", "3"]);
    }

    #[test]
    fn call_document_round_trips_through_json() {
        let mut c = call();
        c.transition_to(CallState::Ringing).unwrap();
        c.add_channel(Channel::new("ch-a", "call-1", ChannelRole::Originator));
        let json = serde_json::to_string(&c).unwrap();
        let back: Call = serde_json::from_str(&json).unwrap();
        assert_eq!(back.call_uuid, c.call_uuid);
        assert_eq!(back.current_state(), CallState::Ringing);
        assert!(back.channel("ch-a").is_some());
    }
}
