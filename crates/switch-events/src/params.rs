//! Attribute names used in switch event payloads.

// Common event parameters
pub const EVENT_NAME: &str = "Event-Name";
pub const CORE_UUID: &str = "Core-UUID";
pub const SWITCH_HOSTNAME: &str = "FreeSWITCH-Hostname";
pub const SWITCH_NAME: &str = "FreeSWITCH-Switchname";
pub const SWITCH_IPV4: &str = "FreeSWITCH-IPv4";
pub const EVENT_DATE_TIMESTAMP: &str = "Event-Date-Timestamp";
pub const EVENT_SEQUENCE: &str = "Event-Sequence";
pub const EVENT_SUBCLASS: &str = "Event-Subclass";

// Heartbeat parameters
pub const SESSION_COUNT: &str = "Session-Count";
pub const MAX_SESSIONS: &str = "Max-Sessions";
pub const IDLE_CPU: &str = "Idle-CPU";

// Background job parameters
pub const JOB_COMMAND: &str = "Job-Command";
pub const JOB_COMMAND_ARG: &str = "Job-Command-Arg";
pub const BODY: &str = "_body";

// Channel event parameters
pub const CHANNEL_CALL_UUID: &str = "Channel-Call-UUID";
pub const UNIQUE_ID: &str = "Unique-ID";
pub const CHANNEL_NAME: &str = "Channel-Name";
pub const CHANNEL_STATE: &str = "Channel-State";
pub const CALL_DIRECTION: &str = "Call-Direction";
pub const CHANNEL_CALL_STATE: &str = "Channel-Call-State";
pub const OTHER_LEG_UNIQUE_ID: &str = "Other-Leg-Unique-ID";
pub const BRIDGE_A_UNIQUE_ID: &str = "Bridge-A-Unique-ID";
pub const BRIDGE_B_UNIQUE_ID: &str = "Bridge-B-Unique-ID";
pub const HANGUP_CAUSE: &str = "Hangup-Cause";
pub const ANSWER_STATE: &str = "Answer-State";

// Channel execute parameters
pub const APPLICATION: &str = "Application";
pub const APPLICATION_DATA: &str = "Application-Data";

// DTMF parameters
pub const DTMF_DIGIT: &str = "DTMF-Digit";
pub const DTMF_DURATION: &str = "DTMF-Duration";

/// Prefix under which the switch reports channel variables.
pub const VARIABLE_PREFIX: &str = "variable_";

/// Channel variable carrying the control plane's own call id.
pub const CALL_ID_VARIABLE: &str = "variable_cg_call_id";
/// Same variable when it arrives via a SIP header copy.
pub const CALL_ID_SIP_HEADER_VARIABLE: &str = "variable_sip_h_X-cg_call_id";
