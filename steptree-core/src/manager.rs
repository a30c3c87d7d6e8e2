//! Observer contract for tree lifecycle events.
//!
//! A [`TreeManager`] is a pluggable concern attached to a tree, such as
//! a renderer or a remote mirror. The tree fans every structural event
//! out to its managers in registration order; each manager owns one
//! opaque state slot per node, keyed by the index it was assigned when
//! the tree was built.

use std::error::Error;
use std::sync::OnceLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::tree::{NodeId, Tree};

/// Error a manager reports from the fallible lifecycle methods.
pub type ManagerError = Box<dyn Error + Send + Sync + 'static>;

/// The slot index a manager receives when its tree is constructed.
///
/// Bound exactly once, by [`Tree::new`]. Reading it before binding, or
/// binding twice (attaching one manager to two trees), is a programming
/// error and panics.
#[derive(Debug, Default)]
pub struct ManagerIndex(OnceLock<usize>);

impl ManagerIndex {
    pub const fn new() -> Self {
        Self(OnceLock::new())
    }

    pub(crate) fn bind(&self, index: usize) {
        if self.0.set(index).is_err() {
            panic!("manager is already attached to a tree");
        }
    }

    /// The bound slot index.
    pub fn get(&self) -> usize {
        *self.0.get().expect("manager is not attached to a tree")
    }
}

/// A concern attached to a tree, reacting to structural lifecycle events.
///
/// Every method has a no-op default, so a manager only overrides what it
/// cares about. For one structural event the callbacks fire strictly in
/// registration order, and for [`creating_node`](Self::creating_node) /
/// [`destroying_node`](Self::destroying_node) each manager's async work
/// is awaited before the next manager starts — manager `k` may rely on
/// state manager `k - 1` attached during the same call.
///
/// The reparent/orphan brackets are synchronous: the `before` pair fires
/// while the old structure is still intact, the `after` pair once the
/// mutation is applied. Managers must not re-enter mutation operations
/// for the same node from inside its own callback.
#[async_trait]
pub trait TreeManager: Send + Sync {
    /// The manager's bind-once slot index.
    fn index(&self) -> &ManagerIndex;

    /// A node was registered; `extra` is an opaque caller-supplied seed.
    async fn creating_node(
        &self,
        tree: &Tree,
        node: NodeId,
        extra: Option<&Value>,
    ) -> Result<(), ManagerError> {
        let _ = (tree, node, extra);
        Ok(())
    }

    /// A parentless, childless node is about to leave the tree.
    async fn destroying_node(&self, tree: &Tree, node: NodeId) -> Result<(), ManagerError> {
        let _ = (tree, node);
        Ok(())
    }

    /// `child` will be inserted into `parent`'s children at `index`.
    fn before_reparenting(&self, tree: &Tree, parent: NodeId, child: NodeId, index: usize) {
        let _ = (tree, parent, child, index);
    }

    /// `child` is now `parent.children[index]`.
    fn after_reparenting(&self, tree: &Tree, parent: NodeId, child: NodeId, index: usize) {
        let _ = (tree, parent, child, index);
    }

    /// `child` will be removed from `parent`'s children at `index`; the
    /// old links are still readable.
    fn before_orphaning(&self, tree: &Tree, parent: NodeId, child: NodeId, index: usize) {
        let _ = (tree, parent, child, index);
    }

    /// `child` was removed from `parent`'s children at `index`.
    fn after_orphaning(&self, tree: &Tree, parent: NodeId, child: NodeId, index: usize) {
        let _ = (tree, parent, child, index);
    }
}
