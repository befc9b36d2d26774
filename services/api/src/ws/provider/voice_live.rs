//! Azure Voice Live endpoint and its session defaults.
//!
//! Voice Live accepts the realtime protocol but adds Azure speech features
//! (noise suppression, echo cancellation, semantic turn detection) that the
//! gateway switches on for every session.

use super::{CLIENT_REQUEST_ID_HEADER, UpstreamRequest, websocket_url};
use anyhow::Result;
use serde_json::{Map, Value, json};
use uuid::Uuid;

/// Model name prefixes of the older realtime generation.
const LEGACY_MODEL_PREFIXES: &[&str] = &["gpt-4o-realtime", "gpt-4o-mini-realtime"];
/// Model name suffix marking an older preview generation.
const LEGACY_MODEL_SUFFIX: &str = "-preview";

/// Builds the request for `{endpoint}/voice-live/realtime`.
///
/// A client request id is always sent; one is generated when the inbound
/// connection did not carry it.
pub fn request(
    endpoint: &str,
    api_version: &str,
    model: &str,
    client_request_id: Option<&str>,
) -> Result<UpstreamRequest> {
    let url = websocket_url(
        endpoint,
        "voice-live/realtime",
        &[("api-version", api_version), ("model", model)],
    )?;
    let request_id = client_request_id
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    Ok(UpstreamRequest {
        url,
        headers: vec![(CLIENT_REQUEST_ID_HEADER, request_id)],
    })
}

/// Whether `model` belongs to the older model family that only supports
/// plain server-side voice activity detection.
pub fn is_legacy_model(model: &str) -> bool {
    let model = model.to_ascii_lowercase();
    LEGACY_MODEL_PREFIXES.iter().any(|p| model.starts_with(p))
        || model.ends_with(LEGACY_MODEL_SUFFIX)
}

/// The turn detection configuration for `model`.
pub fn turn_detection(model: &str) -> Value {
    if is_legacy_model(model) {
        json!({
            "type": "server_vad",
            "threshold": 0.5,
            "prefix_padding_ms": 300,
            "silence_duration_ms": 500,
        })
    } else {
        json!({
            "type": "azure_semantic_vad",
            "threshold": 0.3,
            "prefix_padding_ms": 200,
            "silence_duration_ms": 200,
            "remove_filler_words": false,
            "end_of_utterance_detection": {
                "model": "semantic_detection_v1",
                "threshold": 0.01,
                "timeout": 2,
            },
        })
    }
}

/// Renders a voice for Voice Live.
///
/// Azure neural voices (`en-US-AvaNeural`, `en-US-Ava:DragonHDLatestNeural`)
/// are sent as voice objects; OpenAI voice names stay plain strings.
pub fn voice(name: &str) -> Value {
    if name.contains('-') {
        json!({ "name": name, "type": "azure-standard" })
    } else {
        Value::String(name.to_string())
    }
}

/// Writes the Voice Live audio pipeline settings into a session object.
pub fn apply_session_defaults(session: &mut Map<String, Value>, model: &str) {
    session.insert("input_audio_format".into(), json!("pcm16"));
    session.insert("output_audio_format".into(), json!("pcm16"));
    session.insert(
        "input_audio_transcription".into(),
        json!({ "model": "whisper-1" }),
    );
    session.insert(
        "input_audio_noise_reduction".into(),
        json!({ "type": "azure_deep_noise_suppression" }),
    );
    session.insert(
        "input_audio_echo_cancellation".into(),
        json!({ "type": "server_echo_cancellation" }),
    );
    session.insert("turn_detection".into(), turn_detection(model));
}
