//! Wire protocol types for worker communication.
//!
//! One JSON object per line in each direction. Requests are tagged on
//! `"type"`, responses on `"status"`. Optional request fields are omitted
//! from the wire form when absent, never sent as null. Binary audio travels
//! only inside `"ok"` responses as standard base64 text.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// Requests sent to the worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Load the model. Must be the first request on a fresh worker; the
    /// channel sends it during the startup handshake.
    Init { model: String, device: String },

    /// Synthesize speech from text.
    Generate {
        text: String,
        /// Path to a reference audio clip for voice cloning.
        #[serde(skip_serializing_if = "Option::is_none")]
        audio_prompt: Option<String>,
        /// Language code (multilingual models only).
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        exaggeration: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cfg_weight: Option<f32>,
    },

    /// Liveness probe; the worker answers with an ok status.
    Ping,
}

impl Request {
    /// Serialize to one line payload (no trailing newline; the framing layer
    /// appends it).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Responses received from the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Bare ok status: handshake success or ping reply.
    Ack,
    /// Ok status carrying a synthesized audio payload, already decoded from
    /// base64 to raw bytes.
    Audio(Vec<u8>),
    /// Worker-reported application error. This is a legitimate reply and is
    /// delivered to the caller; it is not a channel fault.
    Failure { message: String },
}

/// A frame that could not be decoded into a [`Response`].
///
/// Distinct from [`Response::Failure`]: a decode failure is a
/// channel-integrity problem and never completes a pending call.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Malformed JSON, or a missing/unknown `"status"` discriminant.
    #[error("malformed response frame: {0}")]
    Json(#[from] serde_json::Error),

    /// The `audio` field was not valid base64.
    #[error("invalid base64 in audio payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Wire form of a response, tagged on `"status"`.
#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum WireResponse {
    Ok {
        #[serde(default)]
        audio: Option<String>,
        /// Informational text on some ok replies (e.g. "pong"); not
        /// surfaced to callers.
        #[serde(default)]
        #[allow(dead_code)]
        message: Option<String>,
    },
    Error {
        error: String,
    },
}

/// Decode one framed line payload into a typed response.
pub fn decode_response(line: &str) -> Result<Response, DecodeError> {
    match serde_json::from_str::<WireResponse>(line)? {
        WireResponse::Ok { audio: Some(b64), .. } => Ok(Response::Audio(BASE64.decode(b64)?)),
        WireResponse::Ok { audio: None, .. } => Ok(Response::Ack),
        WireResponse::Error { error } => Ok(Response::Failure { message: error }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn to_value(req: &Request) -> serde_json::Value {
        serde_json::from_str(&req.to_line().unwrap()).unwrap()
    }

    #[test]
    fn init_serializes() {
        let req = Request::Init {
            model: "turbo".to_string(),
            device: "cuda".to_string(),
        };
        assert_eq!(
            to_value(&req),
            json!({"type": "init", "model": "turbo", "device": "cuda"})
        );
    }

    #[test]
    fn generate_omits_absent_options() {
        let req = Request::Generate {
            text: "hello".to_string(),
            audio_prompt: None,
            language: None,
            exaggeration: None,
            cfg_weight: None,
        };
        assert_eq!(to_value(&req), json!({"type": "generate", "text": "hello"}));
    }

    #[test]
    fn generate_serializes_present_options() {
        let req = Request::Generate {
            text: "hello".to_string(),
            audio_prompt: Some("/tmp/voice.wav".to_string()),
            language: Some("pl".to_string()),
            exaggeration: Some(0.5),
            cfg_weight: Some(0.3),
        };
        assert_eq!(
            to_value(&req),
            json!({
                "type": "generate",
                "text": "hello",
                "audio_prompt": "/tmp/voice.wav",
                "language": "pl",
                "exaggeration": 0.5,
                "cfg_weight": 0.3,
            })
        );
    }

    #[test]
    fn ping_serializes() {
        let req = Request::Ping;
        assert_eq!(to_value(&req), json!({"type": "ping"}));
    }

    #[test]
    fn request_line_has_no_embedded_newline() {
        let req = Request::Generate {
            text: "line one\nline two".to_string(),
            audio_prompt: None,
            language: None,
            exaggeration: None,
            cfg_weight: None,
        };
        assert!(!req.to_line().unwrap().contains('\n'));
    }

    #[test]
    fn decodes_bare_ok_as_ack() {
        assert_eq!(decode_response(r#"{"status":"ok"}"#).unwrap(), Response::Ack);
    }

    #[test]
    fn decodes_ok_with_message_as_ack() {
        assert_eq!(
            decode_response(r#"{"status":"ok","message":"pong"}"#).unwrap(),
            Response::Ack
        );
    }

    #[test]
    fn decodes_audio_payload() {
        let resp = decode_response(r#"{"status":"ok","audio":"aGk="}"#).unwrap();
        assert_eq!(resp, Response::Audio(b"hi".to_vec()));
    }

    #[test]
    fn decodes_error_as_failure() {
        let resp = decode_response(r#"{"status":"error","error":"Model not initialized"}"#).unwrap();
        assert_eq!(
            resp,
            Response::Failure {
                message: "Model not initialized".to_string()
            }
        );
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        assert!(matches!(
            decode_response("{not json"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn missing_status_is_a_decode_error() {
        assert!(matches!(
            decode_response(r#"{"audio":"aGk="}"#),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn unknown_status_is_a_decode_error() {
        assert!(matches!(
            decode_response(r#"{"status":"sideways"}"#),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn invalid_base64_is_a_decode_error() {
        assert!(matches!(
            decode_response(r#"{"status":"ok","audio":"not base64!!!"}"#),
            Err(DecodeError::Base64(_))
        ));
    }

    #[test]
    fn base64_payload_roundtrips_exactly() {
        let all_bytes: Vec<u8> = (0u8..=255).collect();
        let payloads: [&[u8]; 4] = [b"", b"hi", b"RIFF\x00\x01\x02\xff wave data", &all_bytes];
        for bytes in payloads {
            let line = format!(r#"{{"status":"ok","audio":"{}"}}"#, BASE64.encode(bytes));
            assert_eq!(decode_response(&line).unwrap(), Response::Audio(bytes.to_vec()));
        }
    }
}
