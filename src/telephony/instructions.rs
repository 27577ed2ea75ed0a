//! Declarative next-instruction documents.
//!
//! A webhook response tells the phone network what to do with the call
//! next: play audio, dial into a conference room, redirect, or hang up.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CallInstruction {
    /// Play an audio resource to the caller (hold music, prompts).
    Play {
        url: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        repeat: bool,
    },
    /// Bridge the call leg into a conference room.
    DialConference {
        room: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        /// Played while the caller waits alone in the room.
        #[serde(skip_serializing_if = "Option::is_none")]
        hold_audio: Option<String>,
    },
    /// Hand the call to another webhook endpoint.
    Redirect { url: String },
    Hangup,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_conference_wire_shape() {
        let doc = CallInstruction::DialConference {
            room: "lobby-ep-1".into(),
            token: Some("tok".into()),
            hold_audio: Some("https://cdn/hold.mp3".into()),
        };
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"action\":\"dial_conference\""));
        assert!(json.contains("\"room\":\"lobby-ep-1\""));

        let parsed: CallInstruction = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, doc);
    }

    #[test]
    fn test_hangup_is_minimal() {
        let json = serde_json::to_string(&CallInstruction::Hangup).unwrap();
        assert_eq!(json, r#"{"action":"hangup"}"#);
    }

    #[test]
    fn test_play_omits_default_repeat() {
        let json = serde_json::to_string(&CallInstruction::Play {
            url: "x".into(),
            repeat: false,
        })
        .unwrap();
        assert!(!json.contains("repeat"));
    }
}
