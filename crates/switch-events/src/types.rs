//! The closed set of event types the schema knows about.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EventError;

/// Event types published by the switch.
///
/// The set is closed: a name outside it fails decoding. Types the pipeline
/// has no specific handler for still dispatch to the fallback handler rather
/// than being dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Startup,
    Heartbeat,
    ModuleLoad,
    ModuleUnload,
    Shutdown,
    DelSchedule,
    ReSchedule,
    Custom,
    MessageQuery,
    Unpublish,
    MediaBugStart,
    MediaBugStop,
    Codec,
    RequestParams,
    Api,
    BackgroundJob,
    RecvInfo,
    ChannelCallstate,
    ChannelState,
    ChannelCreate,
    ChannelHold,
    ChannelUnhold,
    ChannelExecute,
    ChannelExecuteComplete,
    ChannelAnswer,
    PresenceIn,
    ChannelHangup,
    ChannelHangupComplete,
    ChannelDestroy,
    ChannelOutgoing,
    ChannelBridge,
    CallUpdate,
    RecvRtcpMessage,
    ChannelUnbridge,
    ChannelOriginate,
    ChannelProgress,
    Dtmf,
    PlaybackStart,
    PlaybackStop,
    RecordStart,
    RecordStop,
}

impl EventType {
    /// Channel-scoped events require strict per-channel ordering.
    pub fn is_channel_event(&self) -> bool {
        matches!(
            self,
            EventType::ChannelCreate
                | EventType::ChannelProgress
                | EventType::ChannelAnswer
                | EventType::ChannelHold
                | EventType::ChannelUnhold
                | EventType::ChannelHangup
                | EventType::ChannelHangupComplete
                | EventType::ChannelCallstate
                | EventType::ChannelBridge
                | EventType::ChannelUnbridge
                | EventType::ChannelExecute
                | EventType::Dtmf
        )
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, EventType::Heartbeat)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Startup => "STARTUP",
            EventType::Heartbeat => "HEARTBEAT",
            EventType::ModuleLoad => "MODULE_LOAD",
            EventType::ModuleUnload => "MODULE_UNLOAD",
            EventType::Shutdown => "SHUTDOWN",
            EventType::DelSchedule => "DEL_SCHEDULE",
            EventType::ReSchedule => "RE_SCHEDULE",
            EventType::Custom => "CUSTOM",
            EventType::MessageQuery => "MESSAGE_QUERY",
            EventType::Unpublish => "UNPUBLISH",
            EventType::MediaBugStart => "MEDIA_BUG_START",
            EventType::MediaBugStop => "MEDIA_BUG_STOP",
            EventType::Codec => "CODEC",
            EventType::RequestParams => "REQUEST_PARAMS",
            EventType::Api => "API",
            EventType::BackgroundJob => "BACKGROUND_JOB",
            EventType::RecvInfo => "RECV_INFO",
            EventType::ChannelCallstate => "CHANNEL_CALLSTATE",
            EventType::ChannelState => "CHANNEL_STATE",
            EventType::ChannelCreate => "CHANNEL_CREATE",
            EventType::ChannelHold => "CHANNEL_HOLD",
            EventType::ChannelUnhold => "CHANNEL_UNHOLD",
            EventType::ChannelExecute => "CHANNEL_EXECUTE",
            EventType::ChannelExecuteComplete => "CHANNEL_EXECUTE_COMPLETE",
            EventType::ChannelAnswer => "CHANNEL_ANSWER",
            EventType::PresenceIn => "PRESENCE_IN",
            EventType::ChannelHangup => "CHANNEL_HANGUP",
            EventType::ChannelHangupComplete => "CHANNEL_HANGUP_COMPLETE",
            EventType::ChannelDestroy => "CHANNEL_DESTROY",
            EventType::ChannelOutgoing => "CHANNEL_OUTGOING",
            EventType::ChannelBridge => "CHANNEL_BRIDGE",
            EventType::CallUpdate => "CALL_UPDATE",
            EventType::RecvRtcpMessage => "RECV_RTCP_MESSAGE",
            EventType::ChannelUnbridge => "CHANNEL_UNBRIDGE",
            EventType::ChannelOriginate => "CHANNEL_ORIGINATE",
            EventType::ChannelProgress => "CHANNEL_PROGRESS",
            EventType::Dtmf => "DTMF",
            EventType::PlaybackStart => "PLAYBACK_START",
            EventType::PlaybackStop => "PLAYBACK_STOP",
            EventType::RecordStart => "RECORD_START",
            EventType::RecordStop => "RECORD_STOP",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STARTUP" => Ok(EventType::Startup),
            "HEARTBEAT" => Ok(EventType::Heartbeat),
            "MODULE_LOAD" => Ok(EventType::ModuleLoad),
            "MODULE_UNLOAD" => Ok(EventType::ModuleUnload),
            "SHUTDOWN" => Ok(EventType::Shutdown),
            "DEL_SCHEDULE" => Ok(EventType::DelSchedule),
            "RE_SCHEDULE" => Ok(EventType::ReSchedule),
            "CUSTOM" => Ok(EventType::Custom),
            "MESSAGE_QUERY" => Ok(EventType::MessageQuery),
            "UNPUBLISH" => Ok(EventType::Unpublish),
            "MEDIA_BUG_START" => Ok(EventType::MediaBugStart),
            "MEDIA_BUG_STOP" => Ok(EventType::MediaBugStop),
            "CODEC" => Ok(EventType::Codec),
            "REQUEST_PARAMS" => Ok(EventType::RequestParams),
            "API" => Ok(EventType::Api),
            "BACKGROUND_JOB" => Ok(EventType::BackgroundJob),
            "RECV_INFO" => Ok(EventType::RecvInfo),
            "CHANNEL_CALLSTATE" => Ok(EventType::ChannelCallstate),
            "CHANNEL_STATE" => Ok(EventType::ChannelState),
            "CHANNEL_CREATE" => Ok(EventType::ChannelCreate),
            "CHANNEL_HOLD" => Ok(EventType::ChannelHold),
            "CHANNEL_UNHOLD" => Ok(EventType::ChannelUnhold),
            "CHANNEL_EXECUTE" => Ok(EventType::ChannelExecute),
            "CHANNEL_EXECUTE_COMPLETE" => Ok(EventType::ChannelExecuteComplete),
            "CHANNEL_ANSWER" => Ok(EventType::ChannelAnswer),
            "PRESENCE_IN" => Ok(EventType::PresenceIn),
            "CHANNEL_HANGUP" => Ok(EventType::ChannelHangup),
            "CHANNEL_HANGUP_COMPLETE" => Ok(EventType::ChannelHangupComplete),
            "CHANNEL_DESTROY" => Ok(EventType::ChannelDestroy),
            "CHANNEL_OUTGOING" => Ok(EventType::ChannelOutgoing),
            "CHANNEL_BRIDGE" => Ok(EventType::ChannelBridge),
            "CALL_UPDATE" => Ok(EventType::CallUpdate),
            "RECV_RTCP_MESSAGE" => Ok(EventType::RecvRtcpMessage),
            "CHANNEL_UNBRIDGE" => Ok(EventType::ChannelUnbridge),
            "CHANNEL_ORIGINATE" => Ok(EventType::ChannelOriginate),
            "CHANNEL_PROGRESS" => Ok(EventType::ChannelProgress),
            "DTMF" => Ok(EventType::Dtmf),
            "PLAYBACK_START" => Ok(EventType::PlaybackStart),
            "PLAYBACK_STOP" => Ok(EventType::PlaybackStop),
            "RECORD_START" => Ok(EventType::RecordStart),
            "RECORD_STOP" => Ok(EventType::RecordStop),
            other => Err(EventError::UnknownType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_events_are_classified() {
        assert!(EventType::ChannelAnswer.is_channel_event());
        assert!(EventType::Dtmf.is_channel_event());
        assert!(!EventType::Heartbeat.is_channel_event());
        assert!(!EventType::BackgroundJob.is_channel_event());
    }

    #[test]
    fn names_round_trip() {
        for t in [
            EventType::Heartbeat,
            EventType::ChannelHangupComplete,
            EventType::BackgroundJob,
            EventType::Dtmf,
        ] {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
        }
    }

    #[test]
    fn unknown_name_is_an_error() {
        assert!(matches!(
            "NOT_A_THING".parse::<EventType>(),
            Err(EventError::UnknownType(_))
        ));
    }
}
