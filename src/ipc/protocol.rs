//! Wire envelopes for the southbound worker protocol (spec §6): line
//! delimited JSON over stdio, or an equivalent HTTP POST body. All field
//! names are snake_case; payloads are kept as opaque maps — the core never
//! types the inner payload, only `success`/`error` are load-bearing for
//! dispatch (§9 design note on dynamic-typed request maps).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize)]
pub struct RequestEnvelope {
    pub message_type: String,
    pub session_id: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl RequestEnvelope {
    pub fn new(message_type: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            session_id: session_id.into(),
            payload: Map::new(),
        }
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseEnvelope {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// Well-known message types from spec §4.4. The core treats any other
/// string as an opaque pass-through — this list only documents the
/// contract, it is not exhaustive and nothing here enforces membership.
pub mod message_type {
    pub const INITIALIZE: &str = "initialize";
    pub const LOAD_MODEL: &str = "load_model";
    pub const UNLOAD_MODEL: &str = "unload_model";
    pub const CLEANUP: &str = "cleanup";
    pub const GET_STATUS: &str = "get_status";
    pub const GENERATE_SDXL_ENHANCED: &str = "generate_sdxl_enhanced";
    pub const BATCH_PROCESS: &str = "batch_process";
    pub const GET_BATCH_STATUS: &str = "get_batch_status";
    pub const CONTROLNET_INFERENCE: &str = "controlnet_inference";
    pub const LORA_INFERENCE: &str = "lora_inference";
    pub const INPAINT_IMAGE: &str = "inpaint_image";
    pub const ANALYZE_MASK: &str = "analyze_mask";
    pub const GET_SESSION_ANALYTICS: &str = "get_session_analytics";
}
