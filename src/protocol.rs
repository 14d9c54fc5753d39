//! Wire envelopes for the voice-agent protocol.
//!
//! Every frame in both directions is a JSON object with a `type`
//! discriminator. Audio payloads travel base64-encoded inside the envelope.

use base64::Engine;
use serde::{Deserialize, Serialize};

/// Client -> server messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Sent exactly once, immediately after the socket opens.
    #[serde(rename = "setup")]
    #[serde(rename_all = "camelCase")]
    Setup {
        api_key: String,
        output_format: String,
        output_sample_rate: u32,
        input_encoding: String,
        input_sample_rate: u32,
    },
    /// One chunk of captured microphone audio.
    #[serde(rename = "audioIn")]
    AudioIn { data: String },
}

impl ClientMessage {
    pub fn audio_in(chunk: &[u8]) -> Self {
        Self::AudioIn {
            data: base64::engine::general_purpose::STANDARD.encode(chunk),
        }
    }
}

/// Server -> client messages.
///
/// Types the server may add later deserialize as [`ServerEvent::Unknown`]
/// and are dropped by the classification pump.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "onUserTranscript")]
    UserTranscript { message: String },
    #[serde(rename = "onAgentTranscript")]
    AgentTranscript { message: String },
    #[serde(rename = "audioStream")]
    AudioStream { data: String },
    #[serde(rename = "newAudioStream")]
    NewAudioStream,
    #[serde(rename = "voiceActivityStart")]
    VoiceActivityStart,
    #[serde(rename = "voiceActivityEnd")]
    VoiceActivityEnd,
    #[serde(other)]
    Unknown,
}

/// Decodes a base64 `audioStream` payload.
pub fn decode_audio_payload(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_message_shape() {
        let msg = ClientMessage::Setup {
            api_key: "ak-test".to_string(),
            output_format: "mp3".to_string(),
            output_sample_rate: 16_000,
            input_encoding: "media-container".to_string(),
            input_sample_rate: 16_000,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();

        assert_eq!(json["type"], "setup");
        assert_eq!(json["apiKey"], "ak-test");
        assert_eq!(json["outputFormat"], "mp3");
        assert_eq!(json["outputSampleRate"], 16_000);
        assert_eq!(json["inputEncoding"], "media-container");
        assert_eq!(json["inputSampleRate"], 16_000);
    }

    #[test]
    fn test_audio_in_roundtrip() {
        let msg = ClientMessage::audio_in(&[1, 2, 3, 4, 5]);
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();

        assert_eq!(json["type"], "audioIn");
        let decoded = decode_audio_payload(json["data"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_unknown_server_type_is_tolerated() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"somethingNew","payload":42}"#).unwrap();
        assert!(matches!(event, ServerEvent::Unknown));
    }

    #[test]
    fn test_transcript_events_parse() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"onAgentTranscript","message":"Hola!"}"#).unwrap();
        match event {
            ServerEvent::AgentTranscript { message } => assert_eq!(message, "Hola!"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
