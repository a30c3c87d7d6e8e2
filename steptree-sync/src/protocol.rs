//! JSON payloads of the workset HTTP API.
//!
//! The remote store exposes a request/response surface scoped to one
//! workset and optionally one step within it; every body is JSON. Step
//! identifiers are assigned by the server and are unrelated to the
//! client's local serials.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

/// API revision this client speaks.
pub const API_VERSION: u64 = 1;

/// Application name a compatible server announces on `api/version`.
pub const APPLICATION: &str = "steptree";

/// Remote step identifier assigned by the workset store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub u64);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Response of `GET api/version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub application: String,
    pub min_version: u64,
    pub max_version: u64,
}

impl VersionInfo {
    /// Whether this client can talk to the announcing server.
    pub fn compatible(&self) -> bool {
        self.application == APPLICATION
            && self.min_version <= API_VERSION
            && API_VERSION <= self.max_version
    }
}

/// Response of the workset creation endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CreatedWorkset {
    pub id: u64,
}

/// One entry of `GET workset/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorksetSummary {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorksetList {
    pub worksets: Vec<WorksetSummary>,
}

/// Server-side load state of a workset's backing database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    Loaded,
    Unloaded,
}

/// Response of `GET workset/{id}/get_context`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorksetContext {
    pub name: String,
    pub status: LoadStatus,
    /// Present once the workset is loaded.
    #[serde(default)]
    pub root_step_id: Option<StepId>,
}

/// Response of the step creation endpoints.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CreatedStep {
    pub id: StepId,
}

/// Response of `GET step/{id}/get`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepData {
    /// Opaque step payload; the tree never interprets it.
    #[serde(default)]
    pub sentence: String,
    /// Remote ids of the step's children, in sibling order.
    #[serde(default)]
    pub children: Vec<StepId>,
}

/// Recursive seed for `POST step/create_from_dump`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepDump {
    #[serde(default)]
    pub sentence: String,
    #[serde(default)]
    pub children: Vec<StepDump>,
}

/// Generic `{success}` acknowledgement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
}

/// One entry of the remote event queue (`POST queue`, long-poll).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    /// Long-poll timeout; nothing happened, poll again.
    Nothing,
    /// A step's content changed remotely.
    StepUpdated { step: StepId },
    /// An event this client does not understand; skipped.
    Unknown(String),
}

impl RemoteEvent {
    /// Parse the `{event, ...}` payload of the queue endpoint.
    pub fn parse(value: &Value) -> Result<Self, SyncError> {
        let name = value
            .get("event")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::UnexpectedPayload {
                path: "queue".to_string(),
                detail: "missing `event` field".to_string(),
            })?;
        match name {
            "nothing" => Ok(Self::Nothing),
            "step_updated" => {
                let step = value.get("step_id").and_then(Value::as_u64).ok_or_else(|| {
                    SyncError::UnexpectedPayload {
                        path: "queue".to_string(),
                        detail: "`step_updated` without a numeric `step_id`".to_string(),
                    }
                })?;
                Ok(Self::StepUpdated { step: StepId(step) })
            }
            other => Ok(Self::Unknown(other.to_string())),
        }
    }
}
