use crate::transport::TokioWebSocketTransportFactory;
use std::time::Duration;

/// Settings for a voice-coaching session.
///
/// The defaults match the product constants: a five minute session fed by
/// 250 ms microphone chunks, with agent audio returned as 16 kHz mp3.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base WebSocket endpoint of the voice agent, without the agent id.
    pub endpoint: String,
    /// Agent to talk to; appended to the endpoint as a path segment.
    pub agent_id: String,
    /// API key sent in the setup message.
    pub api_key: String,
    /// Requested format for agent audio.
    pub output_format: String,
    /// Requested sample rate for agent audio, in Hz.
    pub output_sample_rate: u32,
    /// Declared encoding of outbound microphone audio.
    pub input_encoding: String,
    /// Declared sample rate of outbound microphone audio, in Hz.
    pub input_sample_rate: u32,
    /// Fixed session length; the countdown ends the session when it elapses.
    pub session_length: Duration,
    /// Cadence at which capture emits encoded chunks.
    pub chunk_interval: Duration,
    /// Minimum gap between two filler-word coaching hints.
    pub filler_hint_debounce: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "wss://api.play.ai/v1/talk".to_string(),
            agent_id: String::new(),
            api_key: String::new(),
            output_format: "mp3".to_string(),
            output_sample_rate: 16_000,
            input_encoding: "media-container".to_string(),
            input_sample_rate: 16_000,
            session_length: Duration::from_secs(300),
            chunk_interval: Duration::from_millis(250),
            filler_hint_debounce: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Full WebSocket URL for this agent.
    pub fn agent_url(&self) -> String {
        format!("{}/{}", self.endpoint, self.agent_id)
    }

    /// Production transport factory dialing this agent's endpoint.
    pub fn transport_factory(&self) -> TokioWebSocketTransportFactory {
        TokioWebSocketTransportFactory::new(self.agent_url())
    }
}
