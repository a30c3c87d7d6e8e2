//! # steptree-core — observer-coordinated tree
//!
//! A client-side tree of mutable nodes that drives an arbitrary number
//! of independent observers, such as a renderer or a remote mirror,
//! through a single mutation stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  mutations   ┌──────────────┐   ordered callbacks
//! │ application │ ───────────► │     Tree     │ ──────────────────────┐
//! └────────────┘              │  (node arena) │                       │
//!                             └──────────────┘                        ▼
//!                                     ▲            ┌─────────────────────┐
//!                                     │ re-entry   │ TreeManager 0, 1, … │
//!                                     └─────────── │ (one state slot per │
//!                                                  │  manager per node)  │
//!                                                  └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`tree`] — the node arena, structural operations, per-manager slots
//! - [`manager`] — the `TreeManager` observer contract
//! - [`serial`] — process-wide monotonic identifier allocation
//! - [`error`] — observer failure reporting
//!
//! Observers for one event always fire in registration order, and the
//! async lifecycle callbacks are awaited one manager at a time, so a
//! later manager may rely on state an earlier one attached.

pub mod error;
pub mod manager;
pub mod serial;
pub mod tree;

pub use error::TreeError;
pub use manager::{ManagerError, ManagerIndex, TreeManager};
pub use serial::{next_serial, SerialAllocator};
pub use tree::{Insert, NodeId, Tree};
