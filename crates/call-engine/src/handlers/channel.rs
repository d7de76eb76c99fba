//! Channel-scoped event handling.
//!
//! Applies the switch's channel lifecycle to the call model: create,
//! progress, answer, hold, bridge, hangup and DTMF. Every state movement is
//! validated by the model; a rejected transition is logged and the event is
//! otherwise complete — stale or duplicated deliveries must not poison the
//! call.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use callgrid_call_model::{CallState, Channel, ChannelRole, ChannelState, DtmfEvent};
use callgrid_switch_events::{params, Event, EventType};

use crate::error::Result;
use crate::registry::{CallRegistry, SharedCall};

pub struct ChannelEventHandler {
    registry: Arc<CallRegistry>,
}

impl ChannelEventHandler {
    pub fn new(registry: Arc<CallRegistry>) -> Self {
        Self { registry }
    }

    /// Find the call an event belongs to: the control plane's own call-id
    /// variable first, then the channel indices for each channel id the
    /// event mentions.
    async fn resolve_call(&self, event: &Event) -> Option<SharedCall> {
        for var in [params::CALL_ID_VARIABLE, params::CALL_ID_SIP_HEADER_VARIABLE] {
            if let Some(call_uuid) = event.str_param(var) {
                if let Some(call) = self.registry.get_call(call_uuid).await {
                    return Some(call);
                }
            }
        }
        for key in [
            params::UNIQUE_ID,
            params::OTHER_LEG_UNIQUE_ID,
            params::CHANNEL_CALL_UUID,
        ] {
            if let Some(channel_uuid) = event.str_param(key) {
                if let Some(call) = self.registry.get_call_by_channel(channel_uuid).await {
                    return Some(call);
                }
            }
        }
        None
    }

    fn determine_role(event: &Event) -> ChannelRole {
        match event
            .str_param(params::CALL_DIRECTION)
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("outbound") => ChannelRole::Originator,
            Some("inbound") => ChannelRole::Destination,
            Some("transfer") => ChannelRole::Consultation,
            Some("bridge") => ChannelRole::BridgedLeg,
            other => {
                warn!("unknown call direction {:?}, defaulting to consultation", other);
                ChannelRole::Consultation
            }
        }
    }

    /// Move the call's state, treating a rejected transition as a stale or
    /// duplicated event rather than a failure.
    async fn move_call_state(&self, call_uuid: &str, target: CallState) {
        match self.registry.update_call_state(call_uuid, target).await {
            Ok(()) => {}
            Err(crate::error::CallEngineError::InvalidTransition(err)) => {
                debug!("call {}: {}", call_uuid, err);
            }
            Err(err) => warn!("state update failed for call {}: {}", call_uuid, err),
        }
    }

    async fn handle_create(&self, call: &SharedCall, channel_uuid: &str, event: &Event) -> Result<()> {
        let call_uuid = call.read().call_uuid.clone();
        let role = Self::determine_role(event);
        let mut channel = Channel::new(channel_uuid, call_uuid.as_str(), role);
        for (name, value) in event.channel_variables() {
            channel.variables.insert(name.to_string(), value.to_string());
        }
        self.registry.add_channel_to_call(&call_uuid, channel).await?;

        if role == ChannelRole::Originator {
            self.move_call_state(&call_uuid, CallState::Ringing).await;
        }
        info!("channel created: {} for call {} ({:?})", channel_uuid, call_uuid, role);
        Ok(())
    }

    async fn handle_progress(&self, call: &SharedCall, channel_uuid: &str, event: &Event) {
        let call_uuid = {
            let mut call = call.write();
            if let Some(channel) = call.channel_mut(channel_uuid) {
                if channel.state() == ChannelState::Creating {
                    let _ = channel.ring();
                }
                if let Err(err) = channel.transition_to(ChannelState::EarlyMedia) {
                    debug!("channel {}: {}", channel_uuid, err);
                }
            }
            if event.str_param(params::ANSWER_STATE).is_some() {
                call.set_early_media_detected(true);
                info!(
                    "early media detected on channel {} of call {}",
                    channel_uuid, call.call_uuid
                );
            }
            call.call_uuid.clone()
        };
        self.persist(call_uuid);
    }

    async fn handle_answer(&self, call: &SharedCall, channel_uuid: &str) {
        let (call_uuid, answered) = {
            let mut call = call.write();
            let call_uuid = call.call_uuid.clone();
            let answered = match call.channel_mut(channel_uuid) {
                Some(channel) => {
                    if channel.state() == ChannelState::Creating {
                        let _ = channel.ring();
                    }
                    match channel.answer() {
                        Ok(()) => true,
                        Err(err) => {
                            warn!("invalid answer on channel {}: {}", channel_uuid, err);
                            false
                        }
                    }
                }
                None => false,
            };
            (call_uuid, answered)
        };
        if answered {
            self.move_call_state(&call_uuid, CallState::Active).await;
            info!("channel answered: {} for call {}", channel_uuid, call_uuid);
        }
    }

    async fn handle_callstate(&self, call: &SharedCall, channel_uuid: &str, event: &Event) {
        let detailed = event.str_param(params::CHANNEL_CALL_STATE).unwrap_or_default();
        let call_uuid = {
            let mut call = call.write();
            if let Some(channel) = call.channel_mut(channel_uuid) {
                channel.detailed_state = Some(detailed.to_string());
            }
            call.call_uuid.clone()
        };
        if detailed == "HELD" {
            self.move_call_state(&call_uuid, CallState::OnHold).await;
        }
        debug!("channel state {} on channel {} call {}", detailed, channel_uuid, call_uuid);
    }

    async fn handle_hangup(&self, call: &SharedCall, channel_uuid: &str, event: &Event) {
        let cause = event
            .str_param(params::HANGUP_CAUSE)
            .unwrap_or("UNKNOWN")
            .to_string();
        let call_uuid = {
            let mut call = call.write();
            if let Some(channel) = call.channel_mut(channel_uuid) {
                if let Err(err) = channel.hangup(cause.clone()) {
                    debug!("channel {} already terminal: {}", channel_uuid, err);
                }
            }
            call.call_uuid.clone()
        };

        let target = match cause.as_str() {
            "NORMAL_CLEARING" => CallState::Ended,
            "NO_ANSWER" => CallState::TimedOut,
            _ => CallState::Failed,
        };
        self.move_call_state(&call_uuid, target).await;
        info!("channel {} hung up with cause {}", channel_uuid, cause);
    }

    async fn handle_hangup_complete(&self, call: &SharedCall) -> Result<()> {
        let (all_down, call_uuid, duration) = {
            let call = call.read();
            (call.all_channels_hangup(), call.call_uuid.clone(), call.duration())
        };
        if all_down {
            self.registry.finalize_call(&call_uuid).await?;
            info!(
                "call {} completed with duration {} ms",
                call_uuid,
                duration.num_milliseconds()
            );
        }
        Ok(())
    }

    async fn handle_bridge(&self, call: &SharedCall, event: &Event) {
        let a_leg = event.str_param(params::BRIDGE_A_UNIQUE_ID).map(str::to_string);
        let b_leg = event.str_param(params::BRIDGE_B_UNIQUE_ID).map(str::to_string);
        let call_uuid = {
            let mut call = call.write();
            for leg in [&a_leg, &b_leg].into_iter().flatten() {
                if let Some(channel) = call.channel_mut(leg) {
                    if let Err(err) = channel.bridge() {
                        debug!("channel {}: {}", leg, err);
                    }
                }
            }
            call.call_uuid.clone()
        };
        self.move_call_state(&call_uuid, CallState::Active).await;
        info!(
            "channels bridged: {} and {}",
            a_leg.as_deref().unwrap_or("?"),
            b_leg.as_deref().unwrap_or("?")
        );
    }

    async fn handle_unbridge(&self, call: &SharedCall, event: &Event) {
        let a_leg = event.str_param(params::BRIDGE_A_UNIQUE_ID).map(str::to_string);
        let b_leg = event.str_param(params::BRIDGE_B_UNIQUE_ID).map(str::to_string);
        let (call_uuid, transferring) = {
            let mut call = call.write();
            for leg in [&a_leg, &b_leg].into_iter().flatten() {
                if let Some(channel) = call.channel_mut(leg) {
                    if let Err(err) = channel.unbridge() {
                        debug!("channel {}: {}", leg, err);
                    }
                }
            }
            (call.call_uuid.clone(), call.being_transferred)
        };
        if transferring {
            self.move_call_state(&call_uuid, CallState::TransferInProgress)
                .await;
        }
        info!(
            "channels unbridged: {} and {}",
            a_leg.as_deref().unwrap_or("?"),
            b_leg.as_deref().unwrap_or("?")
        );
    }

    async fn handle_dtmf(&self, call: &SharedCall, channel_uuid: &str, event: &Event) -> Result<()> {
        let digit = event.str_param(params::DTMF_DIGIT).unwrap_or_default().to_string();
        let duration = event.int_param_or(params::DTMF_DURATION, 0).max(0) as u32;
        let (call_uuid, source) = {
            let call = call.read();
            let Some(channel) = call.channel(channel_uuid) else {
                return Ok(());
            };
            (call.call_uuid.clone(), channel.role())
        };
        let dtmf = DtmfEvent::new(
            digit.clone(),
            duration,
            source,
            event.timestamp().unwrap_or_else(Utc::now),
            call_uuid.clone(),
            channel_uuid,
        );
        self.registry.append_dtmf(&call_uuid, dtmf).await?;
        info!(
            "DTMF {} received on call {} channel {} (duration: {} ms)",
            digit, call_uuid, channel_uuid, duration
        );
        Ok(())
    }

    async fn handle_hold(&self, call: &SharedCall, channel_uuid: &str) {
        let call_uuid = {
            let mut call = call.write();
            let held = match call.channel_mut(channel_uuid) {
                // Hold only makes sense from an answered or bridged leg.
                Some(channel)
                    if matches!(
                        channel.state(),
                        ChannelState::Answered | ChannelState::Bridged
                    ) =>
                {
                    channel.hold().is_ok()
                }
                _ => false,
            };
            if !held {
                return;
            }
            call.call_uuid.clone()
        };
        self.move_call_state(&call_uuid, CallState::OnHold).await;
        info!("channel put on hold: {} for call {}", channel_uuid, call_uuid);
    }

    async fn handle_unhold(&self, call: &SharedCall, channel_uuid: &str) {
        let (call_uuid, any_active) = {
            let mut call = call.write();
            let resumed = match call.channel_mut(channel_uuid) {
                Some(channel) if channel.state() == ChannelState::Held => {
                    channel.unhold().is_ok()
                }
                _ => false,
            };
            if !resumed {
                return;
            }
            let any_active = call.channels().values().any(Channel::is_active);
            (call.call_uuid.clone(), any_active)
        };
        let target = if any_active {
            CallState::Active
        } else {
            CallState::Ringing
        };
        self.move_call_state(&call_uuid, target).await;
        info!("channel unheld: {}", channel_uuid);
    }

    async fn handle_execute(&self, call: &SharedCall, event: &Event) {
        let application = event.str_param(params::APPLICATION).unwrap_or_default();
        let data = event.str_param(params::APPLICATION_DATA).unwrap_or_default();

        // Attended transfer completion shows up as an executed application.
        if application == "att_xfer" || data == "transfer" {
            let transferred = {
                let mut call = call.write();
                match call.complete_transfer() {
                    Ok(()) => Some(call.call_uuid.clone()),
                    Err(err) => {
                        debug!("call {}: {}", call.call_uuid, err);
                        None
                    }
                }
            };
            if let Some(call_uuid) = transferred {
                info!("call transferred: {}", call_uuid);
                self.persist(call_uuid);
            }
        }
    }

    fn persist(&self, call_uuid: String) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            if let Err(err) = registry.persist_call(&call_uuid).await {
                warn!("persist of call {} failed: {}", call_uuid, err);
            }
        });
    }
}

#[async_trait]
impl crate::handlers::EventHandler for ChannelEventHandler {
    async fn handle_event(&self, event: &Event) -> Result<()> {
        let event_type = event.event_type();
        debug!(
            "channel pipeline processing {} sequence {}",
            event_type,
            event.sequence()
        );

        let channel_uuid = event
            .str_param(params::UNIQUE_ID)
            .unwrap_or_default()
            .to_string();

        let Some(call) = self.resolve_call(event).await else {
            warn!(
                "no active call found for {} on channel {}",
                event_type, channel_uuid
            );
            self.registry.cleanup_orphaned_channel(&channel_uuid).await;
            return Ok(());
        };

        match event_type {
            EventType::ChannelCreate => self.handle_create(&call, &channel_uuid, event).await?,
            EventType::ChannelProgress => self.handle_progress(&call, &channel_uuid, event).await,
            EventType::ChannelAnswer => self.handle_answer(&call, &channel_uuid).await,
            EventType::ChannelCallstate => self.handle_callstate(&call, &channel_uuid, event).await,
            EventType::ChannelHangup => self.handle_hangup(&call, &channel_uuid, event).await,
            EventType::ChannelHangupComplete => self.handle_hangup_complete(&call).await?,
            EventType::ChannelBridge => self.handle_bridge(&call, event).await,
            EventType::ChannelUnbridge => self.handle_unbridge(&call, event).await,
            EventType::Dtmf => self.handle_dtmf(&call, &channel_uuid, event).await?,
            EventType::ChannelHold => self.handle_hold(&call, &channel_uuid).await,
            EventType::ChannelUnhold => self.handle_unhold(&call, &channel_uuid).await,
            EventType::ChannelExecute => self.handle_execute(&call, event).await,
            other => warn!("unhandled channel event type: {}", other),
        }
        Ok(())
    }
}
