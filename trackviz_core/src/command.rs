//! Control surface: the closed set of commands and their replies.
//!
//! A command arrives as a JSON object with exactly one key naming it:
//!
//! ```text
//! {"start": [44, 1, 16]}
//! {"stop": null}
//! {"draw_reference_track": {}}
//! ```
//!
//! Payloads of `stop` and `draw_reference_track` are ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::error::PipelineError;
use trackviz_env::EntityId;

pub const START: &str = "start";
pub const STOP: &str = "stop";
pub const DRAW_REFERENCE_TRACK: &str = "draw_reference_track";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start { entities: Vec<EntityId> },
    Stop,
    DrawReferenceTrack,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start { .. } => START,
            Command::Stop => STOP,
            Command::DrawReferenceTrack => DRAW_REFERENCE_TRACK,
        }
    }

    /// Parses a raw command object.
    pub fn from_json(raw: &Value) -> Result<Self, PipelineError> {
        let object = raw
            .as_object()
            .ok_or_else(|| PipelineError::invalid("command must be a JSON object"))?;

        let mut keys = object.iter();
        let (name, payload) = match (keys.next(), keys.next()) {
            (Some(entry), None) => entry,
            (None, _) => return Err(PipelineError::invalid("empty command")),
            (Some(_), Some(_)) => {
                return Err(PipelineError::invalid(format!(
                    "expected exactly one command, got {}",
                    object.len()
                )))
            }
        };

        match name.as_str() {
            START => Ok(Command::Start {
                entities: parse_entities(payload)?,
            }),
            STOP => Ok(Command::Stop),
            DRAW_REFERENCE_TRACK => Ok(Command::DrawReferenceTrack),
            other => Err(PipelineError::UnknownCommand(other.to_string())),
        }
    }

    pub fn from_str_json(raw: &str) -> Result<Self, PipelineError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| PipelineError::invalid(format!("malformed JSON: {}", e)))?;
        Self::from_json(&value)
    }
}

/// Normalizes a start payload into distinct entity ids, keeping their order.
pub fn parse_entities(payload: &Value) -> Result<Vec<EntityId>, PipelineError> {
    let items = payload
        .as_array()
        .ok_or_else(|| PipelineError::invalid("start expects an array of entity ids"))?;
    if items.is_empty() {
        return Err(PipelineError::EmptyEntityList);
    }

    let mut seen = BTreeSet::new();
    let mut entities = Vec::with_capacity(items.len());
    for item in items {
        let entity = parse_entity(item)?;
        if !seen.insert(entity) {
            return Err(PipelineError::InvalidEntityId(format!("{} listed twice", item)));
        }
        entities.push(entity);
    }
    Ok(entities)
}

fn parse_entity(item: &Value) -> Result<EntityId, PipelineError> {
    let invalid = || PipelineError::InvalidEntityId(item.to_string());

    if let Some(n) = item.as_u64() {
        return u32::try_from(n).map(EntityId).map_err(|_| invalid());
    }
    // Integral floats such as 44.0 arrive from loosely typed clients.
    match item.as_f64() {
        Some(f) if f.fract() == 0.0 && f >= 0.0 && f <= u32::MAX as f64 => Ok(EntityId(f as u32)),
        _ => Err(invalid()),
    }
}

/// Reply to a successfully executed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandResponse {
    Started {
        session_key: u32,
        entities: Vec<EntityId>,
    },
    Stopped {
        was_running: bool,
        rounds_flushed: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log_file: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        flush_error: Option<String>,
    },
    ReferenceDrawn {
        points: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_start() {
        let cmd = Command::from_json(&json!({"start": [44, 1, 16]})).unwrap();
        assert_eq!(
            cmd,
            Command::Start {
                entities: vec![EntityId(44), EntityId(1), EntityId(16)]
            }
        );
        assert_eq!(cmd.name(), "start");
    }

    #[test]
    fn test_integral_floats_accepted() {
        let cmd = Command::from_json(&json!({"start": [44.0, 81]})).unwrap();
        assert_eq!(
            cmd,
            Command::Start {
                entities: vec![EntityId(44), EntityId(81)]
            }
        );
    }

    #[test]
    fn test_bad_entity_ids_rejected() {
        for payload in [
            json!(["44"]),
            json!([4.5]),
            json!([-1]),
            json!([4_294_967_296u64]),
            json!([null]),
            json!([44, 44]),
        ] {
            let err = Command::from_json(&json!({ "start": payload })).unwrap_err();
            assert!(
                matches!(err, PipelineError::InvalidEntityId(_)),
                "payload {} gave {:?}",
                payload,
                err
            );
            assert!(err.is_input_error());
        }
    }

    #[test]
    fn test_empty_entity_list() {
        let err = Command::from_json(&json!({"start": []})).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyEntityList));
    }

    #[test]
    fn test_start_requires_array() {
        let err = Command::from_json(&json!({"start": 44})).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidCommand(_)));
    }

    #[test]
    fn test_stop_and_draw_ignore_payload() {
        assert_eq!(Command::from_json(&json!({"stop": null})).unwrap(), Command::Stop);
        assert_eq!(
            Command::from_json(&json!({"draw_reference_track": {"file": "x"}})).unwrap(),
            Command::DrawReferenceTrack
        );
    }

    #[test]
    fn test_unknown_command() {
        let err = Command::from_json(&json!({"pause": true})).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownCommand(ref name) if name == "pause"));
    }

    #[test]
    fn test_malformed_shapes() {
        assert!(matches!(
            Command::from_json(&json!({})).unwrap_err(),
            PipelineError::InvalidCommand(_)
        ));
        assert!(matches!(
            Command::from_json(&json!({"start": [1], "stop": null})).unwrap_err(),
            PipelineError::InvalidCommand(_)
        ));
        assert!(matches!(
            Command::from_json(&json!(["start"])).unwrap_err(),
            PipelineError::InvalidCommand(_)
        ));
        assert!(matches!(
            Command::from_str_json("{start").unwrap_err(),
            PipelineError::InvalidCommand(_)
        ));
    }

    #[test]
    fn test_response_shape() {
        let started = CommandResponse::Started {
            session_key: 9161,
            entities: vec![EntityId(44)],
        };
        assert_eq!(
            serde_json::to_value(&started).unwrap(),
            json!({"status": "started", "session_key": 9161, "entities": [44]})
        );

        let stopped = CommandResponse::Stopped {
            was_running: false,
            rounds_flushed: 0,
            log_file: None,
            flush_error: None,
        };
        assert_eq!(
            serde_json::to_value(&stopped).unwrap(),
            json!({"status": "stopped", "was_running": false, "rounds_flushed": 0})
        );
    }
}
