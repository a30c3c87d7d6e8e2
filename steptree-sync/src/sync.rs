//! Remote-synchronizing tree observer.
//!
//! [`WorksetManager`] is a `TreeManager` that mirrors local structural
//! mutations into a remote workset and reconciles remote-originated
//! events back into the local tree:
//!
//! ```text
//! Tree mutation ──► WorksetManager ──► OpQueue ──► remote store
//!                        ▲                             │
//!                        │      long-poll queue        │
//!                        └──────── event pump ◄────────┘
//! ```
//!
//! Per node, the manager walks one state machine: unbound →
//! (`creating_node`) → bound → … → (`destroying_node`) → unbound. While
//! the initial bulk import is running (`loading`), structural mutations
//! describe the import itself, not user intent, and are not mirrored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use steptree_core::{
    next_serial, Insert, ManagerError, ManagerIndex, NodeId, Tree, TreeManager,
};

use crate::error::SyncError;
use crate::op_queue::OpQueue;
use crate::protocol::{Ack, RemoteEvent, StepDump, StepId};
use crate::transport::SyncConfig;
use crate::workset::Workset;

/// Events surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorksetEvent {
    /// A step changed remotely; the node's cached state has been
    /// refreshed and dependents should redraw.
    StepUpdated { node: NodeId, step: StepId },
    /// The remote store rejected a structural mutation: the local and
    /// remote trees have diverged and the session should be treated as
    /// unusable.
    Desynchronized { op: &'static str, step: StepId },
}

/// Per-node slot state owned by the workset manager.
#[derive(Debug, Clone)]
pub struct StepState {
    /// The node's remote counterpart.
    pub remote_id: StepId,
    /// Cached remote payload; opaque to the tree.
    pub sentence: String,
}

/// Bidirectional local ↔ remote binding, kept symmetric.
#[derive(Debug, Default)]
struct RemoteIdMap {
    to_remote: HashMap<NodeId, StepId>,
    to_local: HashMap<StepId, NodeId>,
}

impl RemoteIdMap {
    fn bind(&mut self, node: NodeId, step: StepId) {
        assert!(
            !self.to_remote.contains_key(&node),
            "node {node} is already bound to a remote step"
        );
        assert!(
            !self.to_local.contains_key(&step),
            "remote step {step} is already bound to a local node"
        );
        self.to_remote.insert(node, step);
        self.to_local.insert(step, node);
    }

    fn unbind(&mut self, node: NodeId) -> Option<StepId> {
        let step = self.to_remote.remove(&node)?;
        self.to_local.remove(&step);
        Some(step)
    }

    fn remote(&self, node: NodeId) -> Option<StepId> {
        self.to_remote.get(&node).copied()
    }

    fn local(&self, step: StepId) -> Option<NodeId> {
        self.to_local.get(&step).copied()
    }

    fn len(&self) -> usize {
        self.to_remote.len()
    }
}

/// The remote-sync observer.
///
/// Construct inside a tokio runtime (the operation queue spawns its
/// worker), attach to a [`Tree`] via `Tree::new`, then call
/// [`load_data`](Self::load_data) to import the remote tree before any
/// local editing starts.
pub struct WorksetManager {
    index: ManagerIndex,
    workset: Arc<Workset>,
    queue: OpQueue,
    remote_map: RwLock<RemoteIdMap>,
    loading: AtomicBool,
    poll_retry_delay: Duration,
    event_tx: mpsc::UnboundedSender<WorksetEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<WorksetEvent>>>,
}

impl WorksetManager {
    pub fn new(workset: Arc<Workset>, config: &SyncConfig) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            index: ManagerIndex::new(),
            workset,
            queue: OpQueue::new(),
            remote_map: RwLock::new(RemoteIdMap::default()),
            loading: AtomicBool::new(true),
            poll_retry_delay: config.poll_retry_delay,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        })
    }

    /// Take the application-facing event receiver (once).
    pub fn take_event_rx(&self) -> Option<mpsc::UnboundedReceiver<WorksetEvent>> {
        self.event_rx.lock().unwrap().take()
    }

    /// The remote workset this observer mirrors into.
    pub fn workset(&self) -> &Arc<Workset> {
        &self.workset
    }

    /// Whether the initial bulk import is still running.
    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    /// Remote step bound to a local node.
    pub fn remote_id(&self, node: NodeId) -> Option<StepId> {
        self.remote_map.read().unwrap().remote(node)
    }

    /// Local node bound to a remote step.
    pub fn local_node(&self, step: StepId) -> Option<NodeId> {
        self.remote_map.read().unwrap().local(step)
    }

    /// Number of bound nodes.
    pub fn bound_count(&self) -> usize {
        self.remote_map.read().unwrap().len()
    }

    /// Clone the cached step state for a node.
    pub fn step_state(&self, tree: &Tree, node: NodeId) -> Option<StepState> {
        tree.state::<StepState>(node, self.index.get())
    }

    /// Barrier over this observer's remote mutation queue.
    pub async fn drain(&self) {
        self.queue.drain().await;
    }

    // ---------------------------------------------------------------
    // Bulk import
    // ---------------------------------------------------------------

    /// Import the remote tree into `tree`.
    ///
    /// Fetches the workset context for the root step, then walks the
    /// remote tree depth-first, creating a local node per step. The
    /// `creating_node` re-entry runs in loading mode, so nothing is
    /// mirrored back out. Only after the whole recursion succeeds does
    /// the manager leave the loading phase; on error the tree is left
    /// partially populated and should be treated as unusable.
    pub async fn load_data(&self, tree: &Tree) -> Result<(), SyncError> {
        if !self.is_loading() {
            return Ok(());
        }
        let context = self.workset.refresh_context().await?;
        let root = context.root_step_id.ok_or(SyncError::WorksetNotLoaded {
            workset: self.workset.id(),
        })?;
        self.import_step(tree, None, root).await?;
        self.loading.store(false, Ordering::SeqCst);
        log::info!(
            "workset {}: imported {} steps",
            self.workset.id(),
            self.bound_count()
        );
        Ok(())
    }

    /// Recursively import one remote step and its subtree.
    ///
    /// The child is attached to its parent only after its own subtree is
    /// fully imported, so presentation observers always see complete
    /// subtrees arrive.
    fn import_step<'a>(
        &'a self,
        tree: &'a Tree,
        parent: Option<(NodeId, usize)>,
        remote: StepId,
    ) -> BoxFuture<'a, Result<NodeId, SyncError>> {
        Box::pin(async move {
            let node = tree
                .create_node(NodeId(next_serial()), parent.is_none(), None)
                .await?;
            self.remote_map.write().unwrap().bind(node, remote);

            let data = self.workset.get_step(remote).await?;
            tree.set_state(
                node,
                self.index.get(),
                StepState {
                    remote_id: remote,
                    sentence: data.sentence,
                },
            );

            for (child_index, child_remote) in data.children.iter().enumerate() {
                self.import_step(tree, Some((node, child_index)), *child_remote)
                    .await?;
            }
            if let Some((parent_node, index)) = parent {
                tree.reparent(node, parent_node, Insert::At(index));
            }
            Ok(node)
        })
    }

    // ---------------------------------------------------------------
    // Content updates
    // ---------------------------------------------------------------

    /// Update a step's payload locally and mirror it to the remote
    /// store. Returns the queued operation's outcome receiver.
    pub fn set_sentence(
        &self,
        tree: &Tree,
        node: NodeId,
        sentence: String,
    ) -> oneshot::Receiver<Result<(), SyncError>> {
        assert!(!self.is_loading(), "set_sentence during bulk import");
        let remote = self
            .remote_map
            .read()
            .unwrap()
            .remote(node)
            .unwrap_or_else(|| panic!("node {node} has no remote binding"));

        tree.update_state::<StepState, _>(node, self.index.get(), |state| {
            state.sentence = sentence.clone();
        });

        let transport = self.workset.transport();
        let path = self.workset.step_path(remote, "set_sentence");
        self.queue
            .enqueue(format!("set_sentence step {remote}"), move || async move {
                transport.post(&path, &json!({ "sentence": sentence })).await?;
                Ok(())
            })
    }

    // ---------------------------------------------------------------
    // Remote event reconciliation
    // ---------------------------------------------------------------

    /// Spawn the long-poll reconciliation task.
    ///
    /// The pump never re-derives tree shape — shape changes travel only
    /// through the explicit reparent/orphan protocol. Abort the returned
    /// handle to stop polling.
    pub fn spawn_event_pump(self: &Arc<Self>, tree: Arc<Tree>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let value = match manager.workset.api_post("queue", json!({})).await {
                    Ok(value) => value,
                    Err(err) => {
                        log::warn!(
                            "workset {}: event poll failed: {err}",
                            manager.workset.id()
                        );
                        tokio::time::sleep(manager.poll_retry_delay).await;
                        continue;
                    }
                };
                match RemoteEvent::parse(&value) {
                    Ok(RemoteEvent::Nothing) => {}
                    Ok(RemoteEvent::StepUpdated { step }) => {
                        manager.reconcile_step_update(&tree, step).await;
                    }
                    Ok(RemoteEvent::Unknown(name)) => {
                        log::debug!(
                            "workset {}: ignoring unknown event `{name}`",
                            manager.workset.id()
                        );
                    }
                    Err(err) => {
                        log::warn!(
                            "workset {}: malformed event payload: {err}",
                            manager.workset.id()
                        );
                    }
                }
            }
        })
    }

    /// Re-fetch a remotely-updated step and refresh the local cache.
    async fn reconcile_step_update(&self, tree: &Tree, step: StepId) {
        let Some(node) = self.local_node(step) else {
            log::debug!(
                "workset {}: update for unbound step {step}",
                self.workset.id()
            );
            return;
        };
        let data = match self.workset.get_step(step).await {
            Ok(data) => data,
            Err(err) => {
                log::warn!(
                    "workset {}: re-fetch of step {step} failed: {err}",
                    self.workset.id()
                );
                return;
            }
        };
        // The event may race with local destruction of the node.
        if !tree.contains(node) {
            return;
        }
        tree.set_state(
            node,
            self.index.get(),
            StepState {
                remote_id: step,
                sentence: data.sentence,
            },
        );
        let _ = self.event_tx.send(WorksetEvent::StepUpdated { node, step });
    }
}

#[async_trait]
impl TreeManager for WorksetManager {
    fn index(&self) -> &ManagerIndex {
        &self.index
    }

    /// Bind a freshly created node to a remote step.
    ///
    /// In loading mode this is a discovery, not a creation: the step
    /// already exists remotely and the import loop binds the ids. When
    /// not loading, a remote step is created first (seeded from `extra`
    /// when it carries a dump) and the binding recorded on success.
    async fn creating_node(
        &self,
        tree: &Tree,
        node: NodeId,
        extra: Option<&Value>,
    ) -> Result<(), ManagerError> {
        if self.is_loading() {
            return Ok(());
        }
        let (remote, sentence) = match extra {
            Some(value) => {
                let dump: StepDump =
                    serde_json::from_value(value.clone()).map_err(SyncError::from)?;
                let sentence = dump.sentence.clone();
                let remote = self.workset.create_step_from_dump(&dump).await?;
                (remote, sentence)
            }
            None => (self.workset.create_step().await?, String::new()),
        };
        self.remote_map.write().unwrap().bind(node, remote);
        tree.set_state(
            node,
            self.index.get(),
            StepState {
                remote_id: remote,
                sentence,
            },
        );
        log::debug!(
            "workset {}: node {node} bound to new remote step {remote}",
            self.workset.id()
        );
        Ok(())
    }

    /// Mirror a local destroy to the remote store.
    ///
    /// Drains the queue first so every queued mutation referencing this
    /// step reaches the wire before the destroy. The binding is removed
    /// only after the remote acknowledges success; a rejection is logged
    /// and surfaced as a desync, never rolled back.
    async fn destroying_node(&self, _tree: &Tree, node: NodeId) -> Result<(), ManagerError> {
        assert!(
            !self.is_loading(),
            "destroying node {node} during bulk import"
        );
        let remote = self
            .remote_map
            .read()
            .unwrap()
            .remote(node)
            .unwrap_or_else(|| panic!("destroying node {node} with no remote binding"));

        self.queue.drain().await;

        let transport = self.workset.transport();
        let path = self.workset.step_path(remote, "destroy");
        let done = self
            .queue
            .enqueue(format!("destroy step {remote}"), move || async move {
                let value = transport.post(&path, &json!({})).await?;
                let ack: Ack = serde_json::from_value(value)?;
                if !ack.success {
                    return Err(SyncError::RemoteRejected {
                        op: "destroy",
                        id: remote.0,
                    });
                }
                Ok(())
            });

        match done.await {
            Ok(Ok(())) => {
                self.remote_map.write().unwrap().unbind(node);
                Ok(())
            }
            Ok(Err(err)) => {
                log::error!(
                    "workset {}: remote destroy of step {remote} failed: {err}",
                    self.workset.id()
                );
                let _ = self.event_tx.send(WorksetEvent::Desynchronized {
                    op: "destroy",
                    step: remote,
                });
                Ok(())
            }
            Err(_) => Err(SyncError::QueueClosed.into()),
        }
    }

    /// Mirror a local reparent to the remote store.
    ///
    /// Uses *after* timing: the remote call carries the new parent and
    /// index, which only exist once the local mutation is applied.
    fn after_reparenting(&self, _tree: &Tree, parent: NodeId, child: NodeId, index: usize) {
        if self.is_loading() {
            return;
        }
        let (parent_remote, child_remote) = {
            let map = self.remote_map.read().unwrap();
            let parent_remote = map
                .remote(parent)
                .unwrap_or_else(|| panic!("reparent target {parent} has no remote binding"));
            let child_remote = map
                .remote(child)
                .unwrap_or_else(|| panic!("reparented node {child} has no remote binding"));
            (parent_remote, child_remote)
        };

        let transport = self.workset.transport();
        let path = self.workset.step_path(child_remote, "reparent");
        let event_tx = self.event_tx.clone();
        let workset_id = self.workset.id();
        let _ = self
            .queue
            .enqueue(format!("reparent step {child_remote}"), move || async move {
                let body = json!({ "parent": parent_remote, "index": index });
                let value = transport.post(&path, &body).await?;
                let ack: Ack = serde_json::from_value(value)?;
                if !ack.success {
                    log::error!(
                        "workset {workset_id}: remote rejected reparent of step {child_remote}"
                    );
                    let _ = event_tx.send(WorksetEvent::Desynchronized {
                        op: "reparent",
                        step: child_remote,
                    });
                    return Err(SyncError::RemoteRejected {
                        op: "reparent",
                        id: child_remote.0,
                    });
                }
                Ok(())
            });
    }

    /// Mirror a local orphan to the remote store.
    ///
    /// Uses *before* timing: the call must reference the child's old
    /// remote parent association, which the local mutation is about to
    /// dissolve. Do not normalize this to match `after_reparenting`.
    fn before_orphaning(&self, _tree: &Tree, parent: NodeId, child: NodeId, index: usize) {
        if self.is_loading() {
            return;
        }
        let child_remote = self
            .remote_map
            .read()
            .unwrap()
            .remote(child)
            .unwrap_or_else(|| panic!("orphaned node {child} has no remote binding"));
        log::debug!(
            "workset {}: orphaning step {child_remote} from node {parent} at {index}",
            self.workset.id()
        );

        let transport = self.workset.transport();
        let path = self.workset.step_path(child_remote, "orphan");
        let event_tx = self.event_tx.clone();
        let workset_id = self.workset.id();
        let _ = self
            .queue
            .enqueue(format!("orphan step {child_remote}"), move || async move {
                let value = transport.post(&path, &json!({})).await?;
                let ack: Ack = serde_json::from_value(value)?;
                if !ack.success {
                    log::error!(
                        "workset {workset_id}: remote rejected orphan of step {child_remote}"
                    );
                    let _ = event_tx.send(WorksetEvent::Desynchronized {
                        op: "orphan",
                        step: child_remote,
                    });
                    return Err(SyncError::RemoteRejected {
                        op: "orphan",
                        id: child_remote.0,
                    });
                }
                Ok(())
            });
    }
}
