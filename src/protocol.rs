//! JSON-RPC 2.0 envelopes for the control port.
//!
//! Inbound lines are parsed to a JSON object first and then classified by
//! their discriminating fields:
//!
//! - `method` + `id` is a [`Request`]
//! - `method` without `id` is a [`Notification`]
//! - `id` with exactly one of `result` / `error` is a [`Response`]
//!
//! Unknown extra fields are ignored.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Value of the `jsonrpc` member on every envelope
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC code for an unknown method
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Request identifier
pub type RequestId = i64;

/// Errors produced while decoding an inbound line
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The line is not valid JSON
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The line is not valid UTF-8
    #[error("line is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// The line is valid JSON but not an object
    #[error("message is not a JSON object")]
    NotAnObject,

    /// `jsonrpc` is present but is not "2.0"
    #[error("unsupported jsonrpc version: {0}")]
    UnsupportedVersion(String),

    /// A discriminating field has the wrong type
    #[error("invalid `{0}` field")]
    InvalidField(&'static str),

    /// Neither `method` nor `id` is present
    #[error("message has neither `method` nor `id`")]
    MissingDiscriminator,

    /// A response carries both `result` and `error`
    #[error("response has both `result` and `error`")]
    AmbiguousResponse,

    /// A response carries neither `result` nor `error`
    #[error("response has neither `result` nor `error`")]
    MissingOutcome,
}

/// JSON-RPC request (client to server, or server to client)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC notification (no id, no response expected)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC response
///
/// `id` is `None` when the peer answered with `"id": null`, which servers
/// do for requests they could not parse.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Option<RequestId>,
    pub outcome: std::result::Result<Value, RpcError>,
}

/// Any decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    jsonrpc: &'static str,
    #[serde(flatten)]
    body: &'a T,
}

#[derive(Serialize)]
struct ErrorResponseBody<'a> {
    id: RequestId,
    error: &'a RpcError,
}

/// Encode a request as a single line (without the trailing newline)
pub fn encode_request(
    method: &str,
    id: RequestId,
    params: Option<Value>,
) -> serde_json::Result<String> {
    let body = Request {
        id,
        method: method.to_string(),
        params,
    };
    serde_json::to_string(&Envelope {
        jsonrpc: JSONRPC_VERSION,
        body: &body,
    })
}

/// Encode a notification as a single line (without the trailing newline)
pub fn encode_notification(method: &str, params: Option<Value>) -> serde_json::Result<String> {
    let body = Notification {
        method: method.to_string(),
        params,
    };
    serde_json::to_string(&Envelope {
        jsonrpc: JSONRPC_VERSION,
        body: &body,
    })
}

/// Encode an error response to a request the peer sent us
pub fn encode_error_response(id: RequestId, error: &RpcError) -> serde_json::Result<String> {
    serde_json::to_string(&Envelope {
        jsonrpc: JSONRPC_VERSION,
        body: &ErrorResponseBody { id, error },
    })
}

/// Decode one inbound line as received from the socket
pub fn decode_bytes(line: &[u8]) -> std::result::Result<Message, DecodeError> {
    decode(std::str::from_utf8(line)?)
}

/// Decode one inbound line
pub fn decode(line: &str) -> std::result::Result<Message, DecodeError> {
    let value: Value = serde_json::from_str(line)?;
    let Value::Object(mut obj) = value else {
        return Err(DecodeError::NotAnObject);
    };

    // Some servers omit `jsonrpc` on responses; only a wrong value is rejected.
    match obj.get("jsonrpc") {
        None => {}
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        Some(other) => return Err(DecodeError::UnsupportedVersion(other.to_string())),
    }

    let method = match obj.remove("method") {
        None => None,
        Some(Value::String(m)) => Some(m),
        Some(_) => return Err(DecodeError::InvalidField("method")),
    };
    let id = obj.remove("id");
    let params = obj.remove("params");

    match (method, id) {
        (Some(method), Some(id)) => {
            let id = parse_id(&id)?.ok_or(DecodeError::InvalidField("id"))?;
            Ok(Message::Request(Request { id, method, params }))
        }
        (Some(method), None) => Ok(Message::Notification(Notification { method, params })),
        (None, Some(id)) => {
            let id = parse_id(&id)?;
            let outcome = parse_outcome(&mut obj)?;
            Ok(Message::Response(Response { id, outcome }))
        }
        (None, None) => Err(DecodeError::MissingDiscriminator),
    }
}

fn parse_id(value: &Value) -> std::result::Result<Option<RequestId>, DecodeError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_i64()
            .map(Some)
            .ok_or(DecodeError::InvalidField("id")),
        _ => Err(DecodeError::InvalidField("id")),
    }
}

fn parse_outcome(
    obj: &mut Map<String, Value>,
) -> std::result::Result<std::result::Result<Value, RpcError>, DecodeError> {
    match (obj.remove("result"), obj.remove("error")) {
        (Some(result), None) => Ok(Ok(result)),
        (None, Some(error)) => serde_json::from_value::<RpcError>(error)
            .map(Err)
            .map_err(|_| DecodeError::InvalidField("error")),
        (Some(_), Some(_)) => Err(DecodeError::AmbiguousResponse),
        (None, None) => Err(DecodeError::MissingOutcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_request() {
        let line = encode_request("Client.SetMute", 7, Some(json!({"client": "aa", "mute": true})))
            .unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "Client.SetMute");
        assert_eq!(value["params"]["mute"], true);
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_encode_request_without_params() {
        let line = encode_request("Server.GetStatus", 1, None).unwrap();
        assert!(!line.contains("params"));
    }

    #[test]
    fn test_encode_notification_has_no_id() {
        let line = encode_notification("Client.Ping", None).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "Client.Ping");
        assert!(value.get("id").is_none());
    }

    #[test]
    fn test_encode_error_response() {
        let error = RpcError {
            code: METHOD_NOT_FOUND,
            message: "Method not found".to_string(),
            data: None,
        };
        let line = encode_error_response(3, &error).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["id"], 3);
        assert_eq!(value["error"]["code"], -32601);
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_decode_result_response() {
        let msg = decode(r#"{"jsonrpc":"2.0","id":4,"result":{"volume":80}}"#).unwrap();
        assert_eq!(
            msg,
            Message::Response(Response {
                id: Some(4),
                outcome: Ok(json!({"volume": 80})),
            })
        );
    }

    #[test]
    fn test_decode_null_result_is_a_result() {
        let msg = decode(r#"{"jsonrpc":"2.0","id":4,"result":null}"#).unwrap();
        assert!(matches!(
            msg,
            Message::Response(Response { outcome: Ok(Value::Null), .. })
        ));
    }

    #[test]
    fn test_decode_error_response() {
        let msg = decode(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32602,"message":"Invalid params","data":"client not found"}}"#,
        )
        .unwrap();
        let Message::Response(response) = msg else {
            panic!("expected response");
        };
        let error = response.outcome.unwrap_err();

        assert_eq!(response.id, Some(2));
        assert_eq!(error.code, -32602);
        assert_eq!(error.message, "Invalid params");
        assert_eq!(error.data, Some(json!("client not found")));
    }

    #[test]
    fn test_decode_error_response_with_null_id() {
        let msg = decode(r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#)
            .unwrap();
        assert!(matches!(msg, Message::Response(Response { id: None, .. })));
    }

    #[test]
    fn test_decode_notification() {
        let msg = decode(
            r#"{"jsonrpc":"2.0","method":"Client.OnUpdate","params":{"data":{"MAC":"AA:BB"}}}"#,
        )
        .unwrap();
        let Message::Notification(notification) = msg else {
            panic!("expected notification");
        };
        assert_eq!(notification.method, "Client.OnUpdate");
        assert_eq!(notification.params.unwrap()["data"]["MAC"], "AA:BB");
    }

    #[test]
    fn test_decode_request() {
        let msg = decode(r#"{"jsonrpc":"2.0","id":9,"method":"Client.Hello"}"#).unwrap();
        assert_eq!(
            msg,
            Message::Request(Request {
                id: 9,
                method: "Client.Hello".to_string(),
                params: None,
            })
        );
    }

    #[test]
    fn test_decode_tolerates_missing_version_and_unknown_fields() {
        let msg = decode(r#"{"id":1,"result":{},"extension":{"x":1}}"#).unwrap();
        assert!(matches!(msg, Message::Response(Response { id: Some(1), .. })));
    }

    #[test]
    fn test_decode_rejects_wrong_version() {
        let err = decode(r#"{"jsonrpc":"1.0","id":1,"result":{}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedVersion(_)));
    }

    #[test]
    fn test_decode_rejects_both_result_and_error() {
        let err = decode(r#"{"id":1,"result":{},"error":{"code":1,"message":"x"}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::AmbiguousResponse));
    }

    #[test]
    fn test_decode_rejects_neither_result_nor_error() {
        let err = decode(r#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingOutcome));
    }

    #[test]
    fn test_decode_rejects_missing_discriminator() {
        let err = decode(r#"{"jsonrpc":"2.0","params":{}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingDiscriminator));
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        assert!(matches!(decode("{not json"), Err(DecodeError::Json(_))));
        assert!(matches!(decode("[1,2]"), Err(DecodeError::NotAnObject)));
        assert!(matches!(
            decode(r#"{"id":"abc","result":1}"#),
            Err(DecodeError::InvalidField("id"))
        ));
        assert!(matches!(
            decode(r#"{"id":1,"error":{"message":"no code"}}"#),
            Err(DecodeError::InvalidField("error"))
        ));
    }

    #[test]
    fn test_decode_bytes_rejects_invalid_utf8() {
        let line = b"{\"jsonrpc\":\"2.0\",\"method\":\"X\",\"params\":{\"n\":\"\xff\xfe\"}}";
        assert!(matches!(decode_bytes(line), Err(DecodeError::Utf8(_))));

        let line = br#"{"jsonrpc":"2.0","method":"Client.OnUpdate"}"#;
        assert!(matches!(decode_bytes(line), Ok(Message::Notification(_))));
    }
}
