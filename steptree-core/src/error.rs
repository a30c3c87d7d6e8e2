//! Error types for tree lifecycle operations.
//!
//! Structural precondition violations (orphaning the root, destroying a
//! non-leaf) are caller bugs and panic at the call site; only observer
//! failures travel through `Result`.

use thiserror::Error;

use crate::manager::ManagerError;
use crate::tree::NodeId;

#[derive(Debug, Error)]
pub enum TreeError {
    /// An observer failed while handling `creating_node`. The node stays
    /// registered; there is no rollback path.
    #[error("observer {manager} failed while creating node {node}")]
    CreatingNode {
        manager: usize,
        node: NodeId,
        #[source]
        source: ManagerError,
    },

    /// An observer failed while handling `destroying_node`. The node is
    /// not removed.
    #[error("observer {manager} failed while destroying node {node}")]
    DestroyingNode {
        manager: usize,
        node: NodeId,
        #[source]
        source: ManagerError,
    },
}
