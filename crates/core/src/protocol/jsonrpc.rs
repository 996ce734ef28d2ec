// JSON-RPC 2.0 envelope shared by every MCP transport

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// Request identifier. Peers may use numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::custom(error_codes::PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::custom(error_codes::INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::custom(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::custom(error_codes::INVALID_PARAMS, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::custom(error_codes::INTERNAL_ERROR, message)
    }

    pub fn custom(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// The three shapes a well-formed envelope can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Notification,
    Response,
}

/// A single JSON-RPC 2.0 message as it travels on the wire.
///
/// Decoding is deliberately lenient so that a structurally broken envelope can
/// still be answered with a proper error; [`McpMessage::kind`] performs the
/// actual shape validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpMessage {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    // `"result": null` is a legal success payload, so presence matters.
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl McpMessage {
    fn empty() -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }

    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: Some(id.into()),
            method: Some(method.into()),
            params,
            ..Self::empty()
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: Some(method.into()),
            params,
            ..Self::empty()
        }
    }

    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            ..Self::empty()
        }
    }

    /// Error response. `id` is `None` only when the request id could not be read.
    pub fn failure(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            id,
            error: Some(error),
            ..Self::empty()
        }
    }

    /// Decode a message from text, mapping malformed JSON to a parse error and
    /// non-object payloads to an invalid request.
    pub fn parse(text: &str) -> Result<Self, JsonRpcError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| JsonRpcError::parse_error(format!("Parse error: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, JsonRpcError> {
        if !value.is_object() {
            return Err(JsonRpcError::invalid_request(
                "Invalid Request: message must be a JSON object",
            ));
        }
        serde_json::from_value(value)
            .map_err(|e| JsonRpcError::invalid_request(format!("Invalid Request: {}", e)))
    }

    /// Classify the message, rejecting envelopes that are not exactly one of
    /// request, notification or response.
    pub fn kind(&self) -> Result<MessageKind, JsonRpcError> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(JsonRpcError::invalid_request(format!(
                "Invalid Request: unsupported jsonrpc version '{}'",
                self.jsonrpc
            )));
        }

        let has_result = self.result.is_some();
        let has_error = self.error.is_some();

        if self.method.is_some() {
            if has_result || has_error {
                return Err(JsonRpcError::invalid_request(
                    "Invalid Request: message carries both a method and a result/error",
                ));
            }
            return Ok(if self.id.is_some() {
                MessageKind::Request
            } else {
                MessageKind::Notification
            });
        }

        match (has_result, has_error) {
            (true, true) => Err(JsonRpcError::invalid_request(
                "Invalid Request: response carries both result and error",
            )),
            (true, false) if self.id.is_none() => Err(JsonRpcError::invalid_request(
                "Invalid Request: result without id",
            )),
            (true, false) | (false, true) => Ok(MessageKind::Response),
            (false, false) => Err(JsonRpcError::invalid_request(
                "Invalid Request: missing method",
            )),
        }
    }

    /// Consume a response into its outcome.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Err(JsonRpcError::internal_error(
                "response missing both result and error",
            )),
        }
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization_omits_absent_fields() {
        let msg = McpMessage::request(1, "tools/list", None);
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#);
    }

    #[test]
    fn test_kind_classification() {
        let req = McpMessage::request("abc", "ping", None);
        assert_eq!(req.kind().unwrap(), MessageKind::Request);

        let note = McpMessage::notification("notifications/initialized", None);
        assert_eq!(note.kind().unwrap(), MessageKind::Notification);

        let resp = McpMessage::success(RequestId::Number(3), json!({}));
        assert_eq!(resp.kind().unwrap(), MessageKind::Response);
    }

    #[test]
    fn test_null_result_is_still_a_response() {
        let msg = McpMessage::parse(r#"{"jsonrpc":"2.0","id":7,"result":null}"#).unwrap();
        assert_eq!(msg.result, Some(Value::Null));
        assert_eq!(msg.kind().unwrap(), MessageKind::Response);
        assert_eq!(msg.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn test_missing_method_is_invalid_request() {
        let msg = McpMessage::parse(r#"{"jsonrpc":"2.0","id":1}"#).unwrap();
        let err = msg.kind().unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_REQUEST);
    }

    #[test]
    fn test_result_and_error_together_rejected() {
        let msg = McpMessage::parse(
            r#"{"jsonrpc":"2.0","id":1,"result":{},"error":{"code":-1,"message":"x"}}"#,
        )
        .unwrap();
        assert!(msg.kind().is_err());
    }

    #[test]
    fn test_wrong_version_rejected() {
        let msg = McpMessage::parse(r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#).unwrap();
        assert_eq!(msg.kind().unwrap_err().code, error_codes::INVALID_REQUEST);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            McpMessage::parse("{not json").unwrap_err().code,
            error_codes::PARSE_ERROR
        );
        assert_eq!(
            McpMessage::parse("[1,2]").unwrap_err().code,
            error_codes::INVALID_REQUEST
        );
    }

    #[test]
    fn test_string_and_number_ids() {
        let a = McpMessage::parse(r#"{"jsonrpc":"2.0","id":"req-1","method":"ping"}"#).unwrap();
        assert_eq!(a.id, Some(RequestId::String("req-1".into())));
        let b = McpMessage::parse(r#"{"jsonrpc":"2.0","id":42,"method":"ping"}"#).unwrap();
        assert_eq!(b.id, Some(RequestId::Number(42)));
    }

    #[test]
    fn test_into_result_prefers_error() {
        let msg = McpMessage::failure(
            Some(RequestId::Number(1)),
            JsonRpcError::method_not_found("nope"),
        );
        let err = msg.into_result().unwrap_err();
        assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
        assert_eq!(err.message, "Method not found: nope");
    }

    #[test]
    fn test_to_line_is_newline_terminated() {
        let line = McpMessage::notification("ping", None).to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }
}
