//! # steptree-sync — remote reconciliation for steptree trees
//!
//! Keeps a local `steptree_core::Tree` synchronized with an
//! authoritative remote workset store over a JSON request/response
//! surface, without getting in the way of the other observers sharing
//! the same mutation stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  lifecycle   ┌────────────────┐  FIFO ops   ┌───────────┐
//! │     Tree     │ ───────────► │ WorksetManager │ ──────────► │  OpQueue  │
//! │ (local tree) │              │ (remote mirror)│             │ (1 worker)│
//! └──────────────┘              └───────┬────────┘             └─────┬─────┘
//!         ▲                             │ long-poll                  │ HTTP
//!         │ import / refresh            ▼                            ▼
//!         └──────────────────── event pump ◄──────────── remote workset store
//! ```
//!
//! ## Modules
//!
//! - [`sync`] — the remote-sync observer (`WorksetManager`)
//! - [`op_queue`] — FIFO serialization of remote calls with a drain
//!   barrier
//! - [`workset`] — workset session lifecycle and api paths
//! - [`protocol`] — typed JSON payloads of the workset API
//! - [`transport`] — the `ApiTransport` seam and its `reqwest`
//!   implementation
//! - [`error`] — the `SyncError` taxonomy
//!
//! Local mutations reach the wire in program order through the queue;
//! remote-originated events only refresh node payloads — tree shape
//! changes travel exclusively through the explicit mutation protocol.

pub mod error;
pub mod op_queue;
pub mod protocol;
pub mod sync;
pub mod transport;
pub mod workset;

pub use error::SyncError;
pub use op_queue::OpQueue;
pub use protocol::{
    Ack, CreatedStep, CreatedWorkset, LoadStatus, RemoteEvent, StepData, StepDump, StepId,
    VersionInfo, WorksetContext, WorksetList, WorksetSummary, API_VERSION, APPLICATION,
};
pub use sync::{StepState, WorksetEvent, WorksetManager};
pub use transport::{ApiTransport, HttpTransport, SyncConfig};
pub use workset::{check_version, create_workset, list_worksets, load_workset, Workset};
