//! Typed DAP wire messages.
//!
//! The byte-level framing lives in [`crate::transport`]; this module only
//! shapes the JSON payloads: request/response/event envelopes plus the typed
//! bodies the adapter produces.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// Synthetic error identifiers. Values are implementation-defined but stable
// within a session and distinct from each other.
pub const FAILED_TO_LAUNCH: i64 = 3000;
pub const UNABLE_TO_SET_BREAKPOINTS: i64 = 2002;
pub const UNABLE_TO_DISPLAY_THREADS: i64 = 2003;
pub const UNABLE_TO_PRODUCE_STACK_TRACE: i64 = 2004;
pub const UNABLE_TO_LIST_ARGS: i64 = 2005;
pub const UNABLE_TO_LIST_LOCALS: i64 = 2006;
pub const UNABLE_TO_LIST_GLOBALS: i64 = 2007;
pub const UNABLE_TO_LOOKUP_VARIABLE: i64 = 2008;
pub const UNSUPPORTED_COMMAND: i64 = 9999;
pub const NOT_YET_IMPLEMENTED: i64 = 7777;
pub const INTERNAL_ERROR: i64 = 8888;

/// DAP request envelope.
#[derive(Debug, Deserialize)]
pub struct Request {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

/// DAP response envelope.
///
/// The specification allows responses with no `body` field at all; a
/// `serde_json::Value` body keeps the envelope stable across all handlers.
#[derive(Debug, Serialize)]
pub struct Response {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// DAP event envelope.
#[derive(Debug, Serialize)]
pub struct Event {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Error response body: numeric identifier plus a human-readable format
/// string.
pub fn error_body(id: i64, format: &str) -> Value {
    json!({ "error": { "id": id, "format": format } })
}

/// Capability set advertised in the `initialize` response.
///
/// Every optional capability is serialized explicitly: absent support is
/// advertised as `false`, never silently omitted.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub supports_configuration_done_request: bool,
    pub supports_conditional_breakpoints: bool,
    pub supports_function_breakpoints: bool,
    pub supports_set_variable: bool,
    pub supports_set_expression: bool,
    pub supports_terminate_request: bool,
    pub supports_restart_request: bool,
    pub supports_step_back: bool,
    pub supports_loaded_sources_request: bool,
    pub supports_read_memory_request: bool,
    pub supports_disassemble_request: bool,
    pub supports_cancel_request: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities {
            supports_configuration_done_request: true,
            supports_conditional_breakpoints: true,
            supports_function_breakpoints: false,
            supports_set_variable: false,
            supports_set_expression: false,
            supports_terminate_request: false,
            supports_restart_request: false,
            supports_step_back: false,
            supports_loaded_sources_request: false,
            supports_read_memory_request: false,
            supports_disassemble_request: false,
            supports_cancel_request: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Source {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceBreakpoint {
    pub line: i64,
    pub condition: Option<String>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    pub verified: bool,
    pub line: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    pub line: i64,
    pub column: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub name: String,
    pub variables_reference: i64,
    pub expensive: bool,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub value: String,
    pub variables_reference: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedEventBody {
    pub reason: String,
    pub thread_id: i64,
    pub all_threads_stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEventBody {
    pub category: String,
    pub output: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetBreakpointsArguments {
    pub source: Source,
    pub breakpoints: Vec<SourceBreakpoint>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StackTraceArguments {
    pub thread_id: i64,
    pub start_frame: i64,
    pub levels: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScopesArguments {
    pub frame_id: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VariablesArguments {
    pub variables_reference: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointsResponseBody {
    pub breakpoints: Vec<Breakpoint>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadsResponseBody {
    pub threads: Vec<Thread>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceResponseBody {
    pub stack_frames: Vec<StackFrame>,
    pub total_frames: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopesResponseBody {
    pub scopes: Vec<Scope>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesResponseBody {
    pub variables: Vec<Variable>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueResponseBody {
    pub all_threads_continued: bool,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_capabilities_advertise_unsupported_requests_explicitly() {
        let caps = serde_json::to_value(Capabilities::default()).unwrap();
        assert_eq!(caps["supportsConfigurationDoneRequest"], json!(true));
        assert_eq!(caps["supportsConditionalBreakpoints"], json!(true));
        assert_eq!(caps["supportsSetVariable"], json!(false));
        assert_eq!(caps["supportsStepBack"], json!(false));
        assert_eq!(caps["supportsRestartRequest"], json!(false));
    }

    #[test]
    fn test_request_envelope_tolerates_missing_arguments() {
        let req: Request = serde_json::from_value(json!({
            "seq": 1,
            "type": "request",
            "command": "threads",
        }))
        .unwrap();
        assert_eq!(req.seq, 1);
        assert_eq!(req.command, "threads");
        assert!(req.arguments.is_null());
    }

    #[test]
    fn test_error_body_shape() {
        let body = error_body(FAILED_TO_LAUNCH, "Failed to launch: no program");
        assert_eq!(body["error"]["id"], json!(3000));
        assert_eq!(body["error"]["format"], json!("Failed to launch: no program"));
    }
}
