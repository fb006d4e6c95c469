use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;

/// One request frame: a single JSON object on a single line.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Request {
    /// Echoed verbatim on the response; opaque to the engine.
    pub id: Value,
    pub command: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: String,
    pub message: String,
}

/// One response frame. Exactly one of `data`/`error` is present, matching
/// `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn success(id: Value, data: Value) -> Self {
        Self {
            id,
            status: ResponseStatus::Success,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(id: Value, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            status: ResponseStatus::Error,
            data: None,
            error: Some(ResponseError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

/// Parses one line into a request frame.
pub fn decode_line(line: &str) -> Result<Request, TransportError> {
    serde_json::from_str(line.trim()).map_err(|e| TransportError::BadFrame(e.to_string()))
}

/// Serializes a response as a single line. `serde_json` escapes embedded
/// newlines, so the framing invariant holds for any payload.
pub fn encode(response: &Response) -> String {
    serde_json::to_string(response).unwrap_or_else(|_| {
        r#"{"id":null,"status":"error","error":{"code":"ENCODE_FAILED","message":"response not serializable"}}"#
            .to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trip() {
        let req = decode_line(r#"{"id": 7, "command": "ping", "payload": {}}"#).unwrap();
        assert_eq!(req.id, json!(7));
        assert_eq!(req.command, "ping");
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let req = decode_line(r#"{"id": "a", "command": "get_true_holdings"}"#).unwrap();
        assert_eq!(req.payload, Value::Null);
    }

    #[test]
    fn malformed_frames_are_refused() {
        assert!(decode_line("not json").is_err());
        assert!(decode_line(r#"{"command": "ping"}"#).is_err(), "id is required");
    }

    #[test]
    fn encoded_responses_stay_on_one_line() {
        let response = Response::success(
            json!(1),
            json!({ "message": "line one\nline two" }),
        );
        let encoded = encode(&response);
        assert!(!encoded.contains('\n'));

        let back: Response = serde_json::from_str(&encoded).unwrap();
        assert_eq!(back, response);
    }

    #[test]
    fn error_response_shape() {
        let response = Response::failure(json!(2), "UNKNOWN_COMMAND", "no such command");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["error"]["code"], "UNKNOWN_COMMAND");
        assert!(value.get("data").is_none());
    }
}
