//! JSON wire protocol between dashboard clients and the web bridge.
//!
//! Client commands are validated here, at the boundary: a payload that does
//! not parse against its verb's schema never reaches the bus. Validation
//! failures produce a single ack with `VALIDATION_ERROR` and a list of
//! human-readable problems.

use crate::payload::{DjCommand, DjSettings, Mode, MusicCommand, Payload, TrackRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Command families a client may address.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandVerb {
    Voice,
    Music,
    Dj,
    System,
}

/// Client → server messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Command {
        verb: CommandVerb,
        command_id: String,
        payload: serde_json::Value,
    },
}

/// Server → client event envelope. Clients unwrap `{topic, data, timestamp}`
/// uniformly regardless of topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventFrame {
    pub topic: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Error codes carried on failed acks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    WrongMode,
    UnknownAction,
    ProcessingError,
    Timeout,
}

/// Server → client command reply. Every validated command produces exactly
/// one ack with the same `command_id`; the bridge adds `type: "ack"` on the
/// wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ack {
    pub command_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Ack {
    pub fn ok(command_id: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            success: true,
            error_code: None,
            errors: None,
            data: None,
        }
    }

    pub fn failure(
        command_id: impl Into<String>,
        code: ErrorCode,
        errors: Vec<String>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            success: false,
            error_code: Some(code),
            errors: Some(errors),
            data: None,
        }
    }
}

/// Voice command payload: `action ∈ {start, stop}`, no other fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct VoiceCommandPayload {
    pub action: VoiceAction,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VoiceAction {
    Start,
    Stop,
}

/// Music command payload schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MusicCommandPayload {
    pub action: MusicAction,
    #[serde(default)]
    pub track_name: Option<String>,
    #[serde(default)]
    pub track_id: Option<String>,
    #[serde(default)]
    pub volume_level: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MusicAction {
    Play,
    Pause,
    Resume,
    Stop,
    Next,
    Queue,
    Volume,
}

/// DJ command payload schema. Durations are whole seconds on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DjCommandPayload {
    pub action: DjAction,
    #[serde(default)]
    pub auto_transition: Option<bool>,
    #[serde(default)]
    pub transition_duration: Option<u64>,
    #[serde(default)]
    pub crossfade_duration: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DjAction {
    Start,
    Stop,
    Next,
    UpdateSettings,
}

/// System command payload schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SystemCommandPayload {
    pub action: SystemAction,
    #[serde(default)]
    pub mode: Option<Mode>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SystemAction {
    SetMode,
    RestartSystem,
    RefreshStatus,
}

/// A validated command, ready for translation onto the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidatedCommand {
    /// Publish this payload on the given topic.
    Publish { topic: &'static str, payload: Payload },
    /// Answer directly from the bridge cache, no bus traffic.
    RefreshStatus,
}

/// Validate a raw command payload against its verb's schema.
///
/// Returns the canonical translation or the list of problems for a
/// `VALIDATION_ERROR` ack.
pub fn validate(verb: CommandVerb, raw: &serde_json::Value) -> Result<ValidatedCommand, Vec<String>> {
    match verb {
        CommandVerb::Voice => validate_voice(raw),
        CommandVerb::Music => validate_music(raw),
        CommandVerb::Dj => validate_dj(raw),
        CommandVerb::System => validate_system(raw),
    }
}

fn schema_error(e: serde_json::Error) -> Vec<String> {
    vec![e.to_string()]
}

fn validate_voice(raw: &serde_json::Value) -> Result<ValidatedCommand, Vec<String>> {
    let payload: VoiceCommandPayload =
        serde_json::from_value(raw.clone()).map_err(schema_error)?;
    let (topic, payload) = match payload.action {
        VoiceAction::Start => (crate::topics::MIC_START_REQUEST, Payload::MicStartRequest),
        VoiceAction::Stop => (crate::topics::MIC_STOP_REQUEST, Payload::MicStopRequest),
    };
    Ok(ValidatedCommand::Publish { topic, payload })
}

fn validate_music(raw: &serde_json::Value) -> Result<ValidatedCommand, Vec<String>> {
    let payload: MusicCommandPayload =
        serde_json::from_value(raw.clone()).map_err(schema_error)?;

    let mut errors = Vec::new();
    let track_ref = match (&payload.track_id, &payload.track_name) {
        (Some(id), _) => Some(TrackRef::Id { id: id.clone() }),
        (None, Some(name)) => Some(TrackRef::Name { name: name.clone() }),
        (None, None) => None,
    };

    let command = match payload.action {
        MusicAction::Play => match track_ref {
            Some(track_ref) => Some(MusicCommand::Play { track_ref }),
            None => {
                errors.push("play requires track_name or track_id".to_string());
                None
            }
        },
        MusicAction::Queue => match track_ref {
            Some(track_ref) => Some(MusicCommand::Queue { track_ref }),
            None => {
                errors.push("queue requires track_name or track_id".to_string());
                None
            }
        },
        MusicAction::Volume => match payload.volume_level {
            Some(level) if (0.0..=1.0).contains(&level) => Some(MusicCommand::Volume { level }),
            Some(level) => {
                errors.push(format!("volume_level {level} outside [0, 1]"));
                None
            }
            None => {
                errors.push("volume requires volume_level".to_string());
                None
            }
        },
        MusicAction::Pause => Some(MusicCommand::Pause),
        MusicAction::Resume => Some(MusicCommand::Resume),
        MusicAction::Stop => Some(MusicCommand::Stop),
        MusicAction::Next => Some(MusicCommand::Next),
    };

    match (command, errors.is_empty()) {
        (Some(command), true) => Ok(ValidatedCommand::Publish {
            topic: crate::topics::MUSIC_COMMAND,
            payload: Payload::MusicCommand(command),
        }),
        _ => Err(errors),
    }
}

fn validate_dj(raw: &serde_json::Value) -> Result<ValidatedCommand, Vec<String>> {
    let payload: DjCommandPayload = serde_json::from_value(raw.clone()).map_err(schema_error)?;

    let command = match payload.action {
        DjAction::Start => {
            let mut settings = DjSettings::default();
            if let Some(auto) = payload.auto_transition {
                settings.auto_transition = auto;
            }
            if let Some(secs) = payload.crossfade_duration {
                settings.crossfade_sec = secs as f64;
            }
            if let Some(secs) = payload.transition_duration {
                settings.interval_sec = Some(secs as f64);
            }
            DjCommand::Start { settings }
        }
        DjAction::Stop => DjCommand::Stop,
        DjAction::Next => DjCommand::Next,
        DjAction::UpdateSettings => DjCommand::UpdateSettings {
            auto_transition: payload.auto_transition,
            crossfade_sec: payload.crossfade_duration.map(|s| s as f64),
            commentary_lead_sec: None,
        },
    };

    Ok(ValidatedCommand::Publish {
        topic: crate::topics::DJ_COMMAND,
        payload: Payload::DjCommand(command),
    })
}

fn validate_system(raw: &serde_json::Value) -> Result<ValidatedCommand, Vec<String>> {
    let payload: SystemCommandPayload =
        serde_json::from_value(raw.clone()).map_err(schema_error)?;

    match payload.action {
        SystemAction::SetMode => match payload.mode {
            Some(target) => Ok(ValidatedCommand::Publish {
                topic: crate::topics::SET_MODE_REQUEST,
                payload: Payload::SetModeRequest { target },
            }),
            None => Err(vec!["set_mode requires mode".to_string()]),
        },
        SystemAction::RestartSystem => Ok(ValidatedCommand::Publish {
            topic: crate::topics::SHUTDOWN_REQUESTED,
            payload: Payload::ShutdownRequested,
        }),
        SystemAction::RefreshStatus => Ok(ValidatedCommand::RefreshStatus),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn client_command_parses() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "command",
            "verb": "music",
            "command_id": "c1",
            "payload": {"action": "pause"}
        }))
        .unwrap();
        match msg {
            ClientMessage::Command { verb, command_id, .. } => {
                assert_eq!(verb, CommandVerb::Music);
                assert_eq!(command_id, "c1");
            }
        }
    }

    #[test]
    fn volume_without_level_fails_validation() {
        let result = validate(CommandVerb::Music, &json!({"action": "volume"}));
        let errors = result.unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("volume_level"));
    }

    #[test]
    fn volume_out_of_range_fails_validation() {
        let result = validate(
            CommandVerb::Music,
            &json!({"action": "volume", "volume_level": 1.5}),
        );
        assert!(result.is_err());
    }

    #[test]
    fn play_by_name_translates() {
        let result = validate(
            CommandVerb::Music,
            &json!({"action": "play", "track_name": "cantina"}),
        )
        .unwrap();
        match result {
            ValidatedCommand::Publish { topic, payload } => {
                assert_eq!(topic, crate::topics::MUSIC_COMMAND);
                assert_eq!(
                    payload,
                    Payload::MusicCommand(MusicCommand::Play {
                        track_ref: TrackRef::Name { name: "cantina".into() }
                    })
                );
            }
            other => panic!("unexpected translation {other:?}"),
        }
    }

    #[test]
    fn track_id_wins_over_track_name() {
        let result = validate(
            CommandVerb::Music,
            &json!({"action": "play", "track_name": "cantina", "track_id": "trk_9"}),
        )
        .unwrap();
        match result {
            ValidatedCommand::Publish { payload, .. } => assert_eq!(
                payload,
                Payload::MusicCommand(MusicCommand::Play {
                    track_ref: TrackRef::Id { id: "trk_9".into() }
                })
            ),
            other => panic!("unexpected translation {other:?}"),
        }
    }

    #[test]
    fn unknown_field_is_rejected() {
        let result = validate(
            CommandVerb::Voice,
            &json!({"action": "start", "extra": true}),
        );
        assert!(result.is_err());
    }

    #[test]
    fn unknown_action_is_rejected() {
        let result = validate(CommandVerb::Dj, &json!({"action": "scratch"}));
        assert!(result.is_err());
    }

    #[test]
    fn dj_start_maps_durations() {
        let result = validate(
            CommandVerb::Dj,
            &json!({"action": "start", "crossfade_duration": 8, "transition_duration": 120}),
        )
        .unwrap();
        match result {
            ValidatedCommand::Publish { payload, .. } => match payload {
                Payload::DjCommand(DjCommand::Start { settings }) => {
                    assert_eq!(settings.crossfade_sec, 8.0);
                    assert_eq!(settings.interval_sec, Some(120.0));
                }
                other => panic!("unexpected payload {other:?}"),
            },
            other => panic!("unexpected translation {other:?}"),
        }
    }

    #[test]
    fn set_mode_requires_mode() {
        assert!(validate(CommandVerb::System, &json!({"action": "set_mode"})).is_err());
        let ok = validate(
            CommandVerb::System,
            &json!({"action": "set_mode", "mode": "AMBIENT"}),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn ack_serialization_skips_empty_fields() {
        let ack = Ack::ok("c1");
        let json = serde_json::to_value(&ack).unwrap();
        assert!(json.get("error_code").is_none());
        assert!(json.get("errors").is_none());

        let fail = Ack::failure("c2", ErrorCode::ValidationError, vec!["bad".into()]);
        let json = serde_json::to_value(&fail).unwrap();
        assert_eq!(json["error_code"], "VALIDATION_ERROR");
    }
}
