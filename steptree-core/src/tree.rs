//! The observer-coordinated tree.
//!
//! Nodes live in an arena owned by the [`Tree`]; parent/children links
//! are [`NodeId`] values, never references. Every structural mutation
//! goes through the tree, which validates the invariants and fans the
//! event out to every attached [`TreeManager`] in registration order:
//!
//! ```text
//! caller ──► Tree::{create_node, destroy_node, reparent, orphan}
//!                │ check preconditions (panic on caller bugs)
//!                ├── before-callbacks, in manager order
//!                │ apply the structural mutation
//!                └── after-callbacks, in manager order
//! ```
//!
//! The arena lock is never held across an await point or a callback, so
//! managers are free to read the tree (and, for `creating_node`, attach
//! their own per-node state) while handling an event.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::error::TreeError;
use crate::manager::TreeManager;

/// Locally unique node identifier.
///
/// Issued from the serial allocator, immutable once assigned, never
/// reused within a process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Where [`Tree::reparent`] inserts the child among its new siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// At this position in the parent's children sequence.
    At(usize),
    /// After the current last child.
    End,
}

/// Arena record for one node.
struct NodeData {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    /// One opaque slot per attached manager, keyed by manager index.
    slots: Vec<Option<Box<dyn Any + Send + Sync>>>,
}

impl NodeData {
    fn new(slot_count: usize) -> Self {
        Self {
            parent: None,
            children: Vec::new(),
            slots: (0..slot_count).map(|_| None).collect(),
        }
    }
}

/// An observer-coordinated tree of mutable nodes.
pub struct Tree {
    id: u64,
    nodes: RwLock<HashMap<NodeId, NodeData>>,
    root: RwLock<Option<NodeId>>,
    managers: Vec<Arc<dyn TreeManager>>,
}

impl Tree {
    /// Build a tree with a fixed, ordered list of managers.
    ///
    /// Each manager is bound to its registration index here; the index
    /// doubles as the key into every node's state slots. The manager
    /// list cannot change for the tree's lifetime.
    pub fn new(id: u64, managers: Vec<Arc<dyn TreeManager>>) -> Self {
        for (index, manager) in managers.iter().enumerate() {
            manager.index().bind(index);
        }
        Self {
            id,
            nodes: RwLock::new(HashMap::new()),
            root: RwLock::new(None),
            managers,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn manager_count(&self) -> usize {
        self.managers.len()
    }

    /// Number of live (created, not yet destroyed) nodes.
    pub fn len(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().unwrap().is_empty()
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    /// Register a new node and run every manager's `creating_node`,
    /// in order, each awaited before the next starts.
    ///
    /// `extra` is an opaque seed passed through to the managers (the
    /// remote mirror uses it to seed a step from a dump). Panics on a
    /// duplicate id, or if `is_root` is set and a root already exists.
    /// A manager failure aborts the callback chain and is returned; the
    /// node stays registered, since there is no rollback path.
    pub async fn create_node(
        &self,
        id: NodeId,
        is_root: bool,
        extra: Option<Value>,
    ) -> Result<NodeId, TreeError> {
        {
            let mut nodes = self.nodes.write().unwrap();
            assert!(
                !nodes.contains_key(&id),
                "node {id} already exists in tree {}",
                self.id
            );
            nodes.insert(id, NodeData::new(self.managers.len()));
        }
        if is_root {
            let mut root = self.root.write().unwrap();
            assert!(root.is_none(), "tree {} already has a root", self.id);
            *root = Some(id);
        }
        log::debug!("tree {}: created node {id} (root: {is_root})", self.id);

        for (index, manager) in self.managers.iter().enumerate() {
            manager
                .creating_node(self, id, extra.as_ref())
                .await
                .map_err(|source| TreeError::CreatingNode {
                    manager: index,
                    node: id,
                    source,
                })?;
        }
        Ok(id)
    }

    /// Run every manager's `destroying_node` in order, then remove the
    /// node from the arena, invalidating its id.
    ///
    /// The node must be parentless, childless, and not the root;
    /// destroying a node that still has structure would strand its
    /// children. Violations panic.
    pub async fn destroy_node(&self, id: NodeId) -> Result<(), TreeError> {
        {
            let nodes = self.nodes.read().unwrap();
            let node = nodes
                .get(&id)
                .unwrap_or_else(|| panic!("destroying unknown node {id}"));
            assert!(node.parent.is_none(), "destroying node {id} which still has a parent");
            assert!(
                node.children.is_empty(),
                "destroying node {id} which still has children"
            );
        }
        assert!(!self.is_root(id), "destroying the root of tree {}", self.id);

        for (index, manager) in self.managers.iter().enumerate() {
            manager
                .destroying_node(self, id)
                .await
                .map_err(|source| TreeError::DestroyingNode {
                    manager: index,
                    node: id,
                    source,
                })?;
        }
        self.nodes.write().unwrap().remove(&id);
        log::debug!("tree {}: destroyed node {id}", self.id);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Structure
    // ---------------------------------------------------------------

    /// Insert a parentless node under `parent`.
    ///
    /// Panics if the node already has a parent, is the root, or the
    /// insertion index is out of `0..=len`. The mutation is bracketed by
    /// `before_reparenting` / `after_reparenting` on every manager.
    pub fn reparent(&self, id: NodeId, parent: NodeId, position: Insert) {
        assert!(!self.is_root(id), "cannot reparent the root of tree {}", self.id);
        let index = {
            let nodes = self.nodes.read().unwrap();
            let node = nodes
                .get(&id)
                .unwrap_or_else(|| panic!("reparenting unknown node {id}"));
            assert!(node.parent.is_none(), "node {id} already has a parent");
            let sibling_count = nodes
                .get(&parent)
                .unwrap_or_else(|| panic!("reparenting {id} under unknown node {parent}"))
                .children
                .len();
            match position {
                Insert::At(index) => {
                    assert!(
                        index <= sibling_count,
                        "index {index} out of range for node {parent} with {sibling_count} children"
                    );
                    index
                }
                Insert::End => sibling_count,
            }
        };

        for manager in &self.managers {
            manager.before_reparenting(self, parent, id, index);
        }
        {
            let mut nodes = self.nodes.write().unwrap();
            nodes.get_mut(&parent).unwrap().children.insert(index, id);
            nodes.get_mut(&id).unwrap().parent = Some(parent);
        }
        log::debug!("tree {}: node {id} reparented under {parent} at {index}", self.id);
        for manager in &self.managers {
            manager.after_reparenting(self, parent, id, index);
        }
    }

    /// Detach a node from its parent, leaving it parentless.
    ///
    /// Panics if the node is the root or has no parent. The mutation is
    /// bracketed by `before_orphaning` / `after_orphaning`; the before
    /// callbacks still see the old parent and index.
    pub fn orphan(&self, id: NodeId) {
        assert!(!self.is_root(id), "cannot orphan the root of tree {}", self.id);
        let (parent, index) = {
            let nodes = self.nodes.read().unwrap();
            let node = nodes
                .get(&id)
                .unwrap_or_else(|| panic!("orphaning unknown node {id}"));
            let parent = node
                .parent
                .unwrap_or_else(|| panic!("orphaning node {id} which has no parent"));
            let index = nodes[&parent]
                .children
                .iter()
                .position(|child| *child == id)
                .unwrap_or_else(|| panic!("node {id} is missing from the children of {parent}"));
            (parent, index)
        };

        for manager in &self.managers {
            manager.before_orphaning(self, parent, id, index);
        }
        {
            let mut nodes = self.nodes.write().unwrap();
            nodes.get_mut(&parent).unwrap().children.remove(index);
            nodes.get_mut(&id).unwrap().parent = None;
        }
        log::debug!("tree {}: node {id} orphaned from {parent} at {index}", self.id);
        for manager in &self.managers {
            manager.after_orphaning(self, parent, id, index);
        }
    }

    // ---------------------------------------------------------------
    // Lookups
    // ---------------------------------------------------------------

    /// Whether `id` names a live node. Never panics: remote event
    /// processing may race with local destruction, so unknown ids are an
    /// expected answer, not a bug.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.read().unwrap().contains_key(&id)
    }

    pub fn root(&self) -> Option<NodeId> {
        *self.root.read().unwrap()
    }

    pub fn is_root(&self, id: NodeId) -> bool {
        *self.root.read().unwrap() == Some(id)
    }

    /// The node's parent, if attached. Panics on an unknown id.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        let nodes = self.nodes.read().unwrap();
        nodes
            .get(&id)
            .unwrap_or_else(|| panic!("unknown node {id}"))
            .parent
    }

    /// Snapshot of the node's ordered children. Panics on an unknown id.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        let nodes = self.nodes.read().unwrap();
        nodes
            .get(&id)
            .unwrap_or_else(|| panic!("unknown node {id}"))
            .children
            .clone()
    }

    pub fn child(&self, id: NodeId, index: usize) -> Option<NodeId> {
        let nodes = self.nodes.read().unwrap();
        nodes
            .get(&id)
            .unwrap_or_else(|| panic!("unknown node {id}"))
            .children
            .get(index)
            .copied()
    }

    pub fn child_count(&self, id: NodeId) -> usize {
        let nodes = self.nodes.read().unwrap();
        nodes
            .get(&id)
            .unwrap_or_else(|| panic!("unknown node {id}"))
            .children
            .len()
    }

    /// Position of `child` among `parent`'s children.
    pub fn find_child_index(&self, parent: NodeId, child: NodeId) -> Option<usize> {
        let nodes = self.nodes.read().unwrap();
        nodes
            .get(&parent)
            .unwrap_or_else(|| panic!("unknown node {parent}"))
            .children
            .iter()
            .position(|candidate| *candidate == child)
    }

    // ---------------------------------------------------------------
    // Per-manager node state
    // ---------------------------------------------------------------
    //
    // Each node carries one slot per manager, sized at creation. A slot
    // is owned exclusively by the manager whose index keys it; an
    // out-of-range index or a foreign type is a programming error and
    // panics.

    /// Store `value` in the node's slot for manager `manager`.
    pub fn set_state<T: Any + Send + Sync>(&self, id: NodeId, manager: usize, value: T) {
        let mut nodes = self.nodes.write().unwrap();
        let node = nodes
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unknown node {id}"));
        let slot = node
            .slots
            .get_mut(manager)
            .unwrap_or_else(|| panic!("manager index {manager} out of range for tree"));
        *slot = Some(Box::new(value));
    }

    /// Borrow the node's slot for manager `manager`.
    pub fn with_state<T: Any + Send + Sync, R>(
        &self,
        id: NodeId,
        manager: usize,
        f: impl FnOnce(Option<&T>) -> R,
    ) -> R {
        let nodes = self.nodes.read().unwrap();
        let node = nodes
            .get(&id)
            .unwrap_or_else(|| panic!("unknown node {id}"));
        let slot = node
            .slots
            .get(manager)
            .unwrap_or_else(|| panic!("manager index {manager} out of range for tree"));
        let state = slot.as_ref().map(|boxed| {
            boxed
                .downcast_ref::<T>()
                .unwrap_or_else(|| panic!("slot {manager} of node {id} holds foreign state"))
        });
        f(state)
    }

    /// Clone the node's slot state for manager `manager`.
    pub fn state<T: Any + Send + Sync + Clone>(&self, id: NodeId, manager: usize) -> Option<T> {
        self.with_state(id, manager, |state: Option<&T>| state.cloned())
    }

    /// Mutate the node's slot state in place. Panics if the slot is
    /// empty.
    pub fn update_state<T: Any + Send + Sync, R>(
        &self,
        id: NodeId,
        manager: usize,
        f: impl FnOnce(&mut T) -> R,
    ) -> R {
        let mut nodes = self.nodes.write().unwrap();
        let node = nodes
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unknown node {id}"));
        let slot = node
            .slots
            .get_mut(manager)
            .unwrap_or_else(|| panic!("manager index {manager} out of range for tree"));
        let state = slot
            .as_mut()
            .unwrap_or_else(|| panic!("slot {manager} of node {id} is empty"))
            .downcast_mut::<T>()
            .unwrap_or_else(|| panic!("slot {manager} of node {id} holds foreign state"));
        f(state)
    }
}
