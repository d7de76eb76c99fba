//! DTMF (keypress) events recorded against a call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelRole;

/// Duration above which a keypress counts as a long press, in milliseconds.
const LONG_PRESS_MS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DtmfKind {
    DigitPressed,
    LongPress,
}

impl DtmfKind {
    /// Classify a keypress by its reported duration.
    pub fn from_duration_ms(duration_ms: u32) -> Self {
        if duration_ms > LONG_PRESS_MS {
            DtmfKind::LongPress
        } else {
            DtmfKind::DigitPressed
        }
    }
}

/// One keypress observed on a channel, appended to the owning call's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtmfEvent {
    pub digit: String,
    pub duration_ms: u32,
    pub kind: DtmfKind,
    /// Role of the channel the keypress arrived on
    pub source: ChannelRole,
    pub timestamp: DateTime<Utc>,
    pub call_uuid: String,
    pub channel_uuid: String,
}

impl DtmfEvent {
    pub fn new(
        digit: impl Into<String>,
        duration_ms: u32,
        source: ChannelRole,
        timestamp: DateTime<Utc>,
        call_uuid: impl Into<String>,
        channel_uuid: impl Into<String>,
    ) -> Self {
        Self {
            digit: digit.into(),
            duration_ms,
            kind: DtmfKind::from_duration_ms(duration_ms),
            source,
            timestamp,
            call_uuid: call_uuid.into(),
            channel_uuid: channel_uuid.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_press_detected_above_one_second() {
        assert_eq!(DtmfKind::from_duration_ms(400), DtmfKind::DigitPressed);
        assert_eq!(DtmfKind::from_duration_ms(1000), DtmfKind::DigitPressed);
        assert_eq!(DtmfKind::from_duration_ms(1001), DtmfKind::LongPress);
    }

    #[test]
    fn event_classifies_itself() {
        let ev = DtmfEvent::new("5", 1500, ChannelRole::Destination, Utc::now(), "c1", "ch1");
        assert_eq!(ev.kind, DtmfKind::LongPress);
    }
}
