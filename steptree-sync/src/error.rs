//! Error taxonomy for remote synchronization.
//!
//! Remote protocol failures are reported, logged, and never rolled back
//! locally; structural precondition violations are caller bugs and
//! panic at the call site (see `steptree-core`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport-level failure, including non-2xx statuses.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The response body was not the JSON we expected.
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The response parsed as JSON but missed a required field.
    #[error("unexpected payload from `{path}`: {detail}")]
    UnexpectedPayload { path: String, detail: String },

    /// The server announced an incompatible API revision.
    #[error(
        "server speaks `{application}` API {min_version}..={max_version}, client speaks {client}"
    )]
    VersionMismatch {
        application: String,
        min_version: u64,
        max_version: u64,
        client: u64,
    },

    /// The workset has no loaded context on the server yet.
    #[error("workset {workset} is not loaded")]
    WorksetNotLoaded { workset: u64 },

    /// The remote store answered `success: false`: the local and remote
    /// trees have diverged.
    #[error("remote rejected `{op}` for {id}: local and remote state have diverged")]
    RemoteRejected { op: &'static str, id: u64 },

    /// An observer attached to the same tree failed during a lifecycle
    /// callback.
    #[error("tree observer failure")]
    Tree(#[from] steptree_core::TreeError),

    /// The operation queue worker is gone (runtime shutting down).
    #[error("operation queue worker is gone")]
    QueueClosed,
}
