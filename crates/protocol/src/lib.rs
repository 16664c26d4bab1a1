//! Gateway WebSocket/RPC protocol definitions.
//!
//! Protocol version 3. All communication uses JSON frames over a framed
//! bidirectional stream.
//!
//! Frame types:
//! - `RequestFrame`  — RPC call (client → gateway, and gateway → node)
//! - `ResponseFrame` — RPC result
//! - `EventFrame`    — server-push

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 3;

/// Methods the node sends on its own initiative.
pub mod methods {
    pub const CONNECT: &str = "connect";
    pub const NODE_EVENT: &str = "node.event";
    pub const NODE_INVOKE_RESULT: &str = "node.invoke.result";
}

/// Events the gateway pushes at the node.
pub mod events {
    pub const CONNECT_CHALLENGE: &str = "connect.challenge";
    pub const NODE_INVOKE_REQUEST: &str = "node.invoke.request";
    pub const SHUTDOWN: &str = "shutdown";
    pub const TICK: &str = "tick";
    pub const VOICEWAKE_CHANGED: &str = "voicewake.changed";
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid invoke payload")]
    InvalidInvokePayload,

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// RPC request. The node uses this for `connect`, `node.event` and
/// `node.invoke.result`; the gateway may deliver invokes this way too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub r#type: String, // always "req"
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl RequestFrame {
    pub fn new(
        id: impl Into<String>,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
    ) -> Self {
        Self {
            r#type: "req".into(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub r#type: String, // always "res"
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GatewayError>,
}

/// Server-push event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub r#type: String, // always "event"
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            r#type: "event".into(),
            event: event.into(),
            payload: Some(payload),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(rename = "retryAfterMs", skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Discriminated union of all frame types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Request(RequestBody),
    #[serde(rename = "res")]
    Response(ResponseBody),
    #[serde(rename = "event")]
    Event(EventBody),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GatewayError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBody {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Parse one wire frame. Unknown `type` discriminators fail to decode; the
/// read loop logs and skips them.
pub fn decode_frame(data: &str) -> Result<Frame, ProtocolError> {
    Ok(serde_json::from_str(data)?)
}

pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

// ── Connect handshake ────────────────────────────────────────────────────────

/// Parameters sent by the node in the initial `connect` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "minProtocol")]
    pub min_protocol: u32,
    #[serde(rename = "maxProtocol")]
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caps: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(rename = "pathEnv", skip_serializing_if = "Option::is_none")]
    pub path_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(rename = "userAgent", skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub version: String,
    pub platform: String,
    #[serde(rename = "deviceFamily", skip_serializing_if = "Option::is_none")]
    pub device_family: Option<String>,
    #[serde(rename = "modelIdentifier", skip_serializing_if = "Option::is_none")]
    pub model_identifier: Option<String>,
    pub mode: String,
    #[serde(rename = "instanceId", skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

/// Signed device identity attached to `connect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub signature: String,
    #[serde(rename = "signedAt")]
    pub signed_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// `ok:true` payload of the `connect` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloOk {
    pub r#type: String, // must be "hello-ok"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<HelloAuth>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HelloAuth {
    #[serde(rename = "deviceToken", skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(rename = "issuedAtMs", skip_serializing_if = "Option::is_none")]
    pub issued_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChallengePayload {
    #[serde(default)]
    pub nonce: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShutdownPayload {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(rename = "restartExpectedMs", default)]
    pub restart_expected_ms: Option<i64>,
}

// ── Node invoke ──────────────────────────────────────────────────────────────

/// A command invocation addressed at this node.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeRequestParams {
    pub request_id: String,
    pub node_id: String,
    pub command: String,
    pub args: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawInvokePayload {
    #[serde(default)]
    id: String,
    #[serde(rename = "nodeId", default)]
    node_id: String,
    #[serde(default)]
    command: String,
    #[serde(rename = "paramsJSON", default)]
    params_json: Option<String>,
    #[serde(default)]
    params: Option<serde_json::Value>,
    #[serde(rename = "idempotencyKey", default)]
    _idempotency_key: Option<String>,
}

/// Parse the payload of `node.invoke.request`, delivered either as an event
/// payload or as request params. The string-wrapped `paramsJSON` form wins
/// over `params` when both are present.
pub fn parse_invoke_payload(raw: &serde_json::Value) -> Result<InvokeRequestParams, ProtocolError> {
    let payload: RawInvokePayload = serde_json::from_value(raw.clone())?;
    if payload.id.is_empty() || payload.node_id.is_empty() || payload.command.is_empty() {
        return Err(ProtocolError::InvalidInvokePayload);
    }
    let args = match payload.params_json.as_deref() {
        Some(text) if !text.is_empty() => Some(serde_json::from_str(text)?),
        _ => payload.params,
    };
    Ok(InvokeRequestParams {
        request_id: payload.id,
        node_id: payload.node_id,
        command: payload.command,
        args,
    })
}

/// Outcome of an invoke, sent back as a fresh `req` of method
/// `node.invoke.result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeResultParams {
    pub id: String,
    #[serde(rename = "nodeId")]
    pub node_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(rename = "payloadJSON", skip_serializing_if = "Option::is_none")]
    pub payload_json: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeInvokeError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInvokeError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Params of a `node.event` request. The payload is kept as raw JSON so
/// server-side shapes survive verbatim.
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeEventParams {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
    #[serde(rename = "payloadJSON", skip_serializing_if = "Option::is_none")]
    pub payload_json: Option<String>,
}

impl NodeEventParams {
    pub fn new(event: impl Into<String>, payload: Box<RawValue>) -> Self {
        Self {
            event: event.into(),
            payload: Some(payload),
            payload_json: None,
        }
    }
}
