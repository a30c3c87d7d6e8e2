//! End-to-end tests for the remote-sync observer.
//!
//! An in-memory backend implements `ApiTransport` and records every
//! mutation request, so the tests can assert exactly which remote calls
//! a local mutation produced, and in which order.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio::time::timeout;

use steptree_core::{Insert, NodeId, Tree, TreeManager};
use steptree_sync::{
    check_version, list_worksets, load_workset, ApiTransport, StepDump, StepId, SyncConfig,
    SyncError, WorksetEvent, WorksetManager,
};

const WORKSET_ID: u64 = 7;

struct FakeStep {
    sentence: String,
    children: Vec<u64>,
}

/// In-memory workset store speaking the JSON API.
struct FakeBackend {
    steps: Mutex<HashMap<u64, FakeStep>>,
    root: u64,
    next_step: AtomicU64,
    min_version: AtomicU64,
    max_version: AtomicU64,
    /// Recorded `POST` requests (path, body), queue polls excluded.
    posts: Mutex<Vec<(String, Value)>>,
    /// Injected event queue payloads.
    events: Mutex<VecDeque<Value>>,
    /// Operation suffixes answered with `success: false`.
    reject: Mutex<Vec<&'static str>>,
}

impl FakeBackend {
    fn new() -> Arc<Self> {
        let backend = Self {
            steps: Mutex::new(HashMap::new()),
            root: 1,
            next_step: AtomicU64::new(100),
            min_version: AtomicU64::new(1),
            max_version: AtomicU64::new(1),
            posts: Mutex::new(Vec::new()),
            events: Mutex::new(VecDeque::new()),
            reject: Mutex::new(Vec::new()),
        };
        backend.steps.lock().unwrap().insert(
            1,
            FakeStep {
                sentence: String::new(),
                children: Vec::new(),
            },
        );
        Arc::new(backend)
    }

    fn add_step(&self, id: u64, sentence: &str, children: &[u64]) {
        self.steps.lock().unwrap().insert(
            id,
            FakeStep {
                sentence: sentence.to_string(),
                children: children.to_vec(),
            },
        );
    }

    fn set_children(&self, id: u64, children: &[u64]) {
        self.steps.lock().unwrap().get_mut(&id).unwrap().children = children.to_vec();
    }

    fn set_sentence(&self, id: u64, sentence: &str) {
        self.steps.lock().unwrap().get_mut(&id).unwrap().sentence = sentence.to_string();
    }

    fn push_event(&self, event: Value) {
        self.events.lock().unwrap().push_back(event);
    }

    fn reject_op(&self, op: &'static str) {
        self.reject.lock().unwrap().push(op);
    }

    fn posts(&self) -> Vec<(String, Value)> {
        self.posts.lock().unwrap().clone()
    }

    fn posts_with_suffix(&self, suffix: &str) -> Vec<(String, Value)> {
        self.posts()
            .into_iter()
            .filter(|(path, _)| path.ends_with(suffix))
            .collect()
    }

    fn ack_for(&self, op: &'static str) -> Value {
        let success = !self.reject.lock().unwrap().contains(&op);
        json!({ "success": success })
    }
}

#[async_trait]
impl ApiTransport for FakeBackend {
    async fn get(&self, path: &str) -> Result<Value, SyncError> {
        let parts: Vec<&str> = path.split('/').collect();
        match parts.as_slice() {
            ["api", "version"] => Ok(json!({
                "application": "steptree",
                "min_version": self.min_version.load(Ordering::Relaxed),
                "max_version": self.max_version.load(Ordering::Relaxed),
            })),
            ["api", "1", "workset", "create"] => Ok(json!({ "id": WORKSET_ID })),
            ["api", "1", "workset", "list"] => Ok(json!({
                "worksets": [{ "id": WORKSET_ID, "name": "default" }]
            })),
            ["api", "1", "workset", _, "get_context"] => Ok(json!({
                "name": "default",
                "status": "loaded",
                "root_step_id": self.root,
            })),
            ["api", "1", "workset", _, "step", raw_id, "get"] => {
                let id: u64 = raw_id.parse().unwrap();
                let steps = self.steps.lock().unwrap();
                let step = steps.get(&id).ok_or_else(|| SyncError::UnexpectedPayload {
                    path: path.to_string(),
                    detail: "no such step".to_string(),
                })?;
                Ok(json!({ "sentence": step.sentence, "children": step.children }))
            }
            _ => Err(SyncError::UnexpectedPayload {
                path: path.to_string(),
                detail: "unhandled GET".to_string(),
            }),
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, SyncError> {
        let parts: Vec<&str> = path.split('/').collect();
        if parts.last() != Some(&"queue") {
            self.posts
                .lock()
                .unwrap()
                .push((path.to_string(), body.clone()));
        }
        match parts.as_slice() {
            [.., "queue"] => {
                if let Some(event) = self.events.lock().unwrap().pop_front() {
                    return Ok(event);
                }
                // Empty queue: simulate the server's long-poll timeout.
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(json!({ "event": "nothing" }))
            }
            [.., "step", "create"] => {
                let id = self.next_step.fetch_add(1, Ordering::Relaxed);
                self.add_step(id, "", &[]);
                Ok(json!({ "id": id }))
            }
            [.., "step", "create_from_dump"] => {
                let raw = body.get("dump").and_then(Value::as_str).unwrap();
                let dump: StepDump = serde_json::from_str(raw).unwrap();
                let id = self.next_step.fetch_add(1, Ordering::Relaxed);
                self.add_step(id, &dump.sentence, &[]);
                Ok(json!({ "id": id }))
            }
            [.., "step", raw_id, "reparent"] => {
                let id: u64 = raw_id.parse().unwrap();
                let ack = self.ack_for("reparent");
                if ack["success"].as_bool().unwrap() {
                    let parent = body["parent"].as_u64().unwrap();
                    let index = body["index"].as_u64().unwrap() as usize;
                    let mut steps = self.steps.lock().unwrap();
                    let children = &mut steps.get_mut(&parent).unwrap().children;
                    children.insert(index, id);
                }
                Ok(ack)
            }
            [.., "step", raw_id, "orphan"] => {
                let id: u64 = raw_id.parse().unwrap();
                let ack = self.ack_for("orphan");
                if ack["success"].as_bool().unwrap() {
                    let mut steps = self.steps.lock().unwrap();
                    for step in steps.values_mut() {
                        step.children.retain(|child| *child != id);
                    }
                }
                Ok(ack)
            }
            [.., "step", raw_id, "destroy"] => {
                let id: u64 = raw_id.parse().unwrap();
                let ack = self.ack_for("destroy");
                if ack["success"].as_bool().unwrap() {
                    self.steps.lock().unwrap().remove(&id);
                }
                Ok(ack)
            }
            [.., "step", raw_id, "set_sentence"] => {
                let id: u64 = raw_id.parse().unwrap();
                let sentence = body["sentence"].as_str().unwrap();
                self.set_sentence(id, sentence);
                Ok(json!({}))
            }
            [.., "destroy"] => Ok(json!({ "success": true })),
            _ => Err(SyncError::UnexpectedPayload {
                path: path.to_string(),
                detail: "unhandled POST".to_string(),
            }),
        }
    }
}

/// Attach a workset manager to a fresh tree and run the bulk import.
async fn setup(backend: Arc<FakeBackend>) -> (Arc<Tree>, Arc<WorksetManager>) {
    let workset = load_workset(backend as Arc<dyn ApiTransport>, WORKSET_ID)
        .await
        .unwrap();
    let manager = WorksetManager::new(Arc::new(workset), &SyncConfig::default());
    let tree = Arc::new(Tree::new(
        1,
        vec![manager.clone() as Arc<dyn TreeManager>],
    ));
    manager.load_data(&tree).await.unwrap();
    (tree, manager)
}

#[tokio::test]
async fn test_version_handshake() {
    let backend = FakeBackend::new();
    check_version(backend.as_ref()).await.unwrap();

    backend.min_version.store(2, Ordering::Relaxed);
    backend.max_version.store(3, Ordering::Relaxed);
    let result = check_version(backend.as_ref()).await;
    assert!(matches!(
        result,
        Err(SyncError::VersionMismatch { client: 1, .. })
    ));
}

#[tokio::test]
async fn test_workset_session() {
    let backend = FakeBackend::new();
    let summaries = list_worksets(backend.as_ref()).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].id, WORKSET_ID);

    let workset = load_workset(backend as Arc<dyn ApiTransport>, WORKSET_ID)
        .await
        .unwrap();
    assert_eq!(workset.name().as_deref(), Some("default"));
    assert!(workset.is_loaded());
    assert_eq!(workset.root_step_id(), Some(StepId(1)));
}

#[tokio::test]
async fn test_bulk_import_builds_matching_tree() {
    let backend = FakeBackend::new();
    backend.set_children(1, &[10, 11]);
    backend.add_step(10, "|- ph", &[12]);
    backend.add_step(11, "|- ps", &[]);
    backend.add_step(12, "|- ch", &[]);

    let (tree, manager) = setup(backend.clone()).await;

    assert!(!manager.is_loading());
    assert_eq!(manager.bound_count(), 4);

    let root = tree.root().unwrap();
    assert_eq!(manager.remote_id(root), Some(StepId(1)));

    // Children in remote sibling order.
    let children = tree.children(root);
    assert_eq!(children.len(), 2);
    assert_eq!(manager.remote_id(children[0]), Some(StepId(10)));
    assert_eq!(manager.remote_id(children[1]), Some(StepId(11)));

    let grandchildren = tree.children(children[0]);
    assert_eq!(grandchildren.len(), 1);
    assert_eq!(manager.remote_id(grandchildren[0]), Some(StepId(12)));

    // Payloads were cached on the way in.
    let state = manager.step_state(&tree, children[0]).unwrap();
    assert_eq!(state.sentence, "|- ph");

    // The import mirrors remote state; it must not issue any mutation.
    assert!(backend.posts().is_empty());
}

#[tokio::test]
async fn test_import_failure_leaves_loading() {
    let backend = FakeBackend::new();
    backend.set_children(1, &[99]); // 99 does not exist

    let workset = load_workset(backend as Arc<dyn ApiTransport>, WORKSET_ID)
        .await
        .unwrap();
    let manager = WorksetManager::new(Arc::new(workset), &SyncConfig::default());
    let tree = Arc::new(Tree::new(
        1,
        vec![manager.clone() as Arc<dyn TreeManager>],
    ));

    let result = manager.load_data(&tree).await;
    assert!(result.is_err());
    assert!(manager.is_loading());
}

#[tokio::test]
async fn test_create_node_creates_remote_step() {
    let backend = FakeBackend::new();
    let (tree, manager) = setup(backend.clone()).await;

    let node = tree
        .create_node(NodeId(steptree_core::next_serial()), false, None)
        .await
        .unwrap();

    let remote = manager.remote_id(node).expect("node must be bound");
    assert_eq!(manager.local_node(remote), Some(node));
    assert_eq!(backend.posts_with_suffix("step/create").len(), 1);
}

#[tokio::test]
async fn test_create_node_from_dump_seeds_sentence() {
    let backend = FakeBackend::new();
    let (tree, manager) = setup(backend.clone()).await;

    let dump = serde_json::to_value(StepDump {
        sentence: "|- ph".to_string(),
        children: Vec::new(),
    })
    .unwrap();
    let node = tree
        .create_node(NodeId(steptree_core::next_serial()), false, Some(dump))
        .await
        .unwrap();

    let state = manager.step_state(&tree, node).unwrap();
    assert_eq!(state.sentence, "|- ph");
    assert_eq!(backend.posts_with_suffix("step/create_from_dump").len(), 1);
}

#[tokio::test]
async fn test_reparent_enqueues_exact_remote_call() {
    let backend = FakeBackend::new();
    let (tree, manager) = setup(backend.clone()).await;
    let root = tree.root().unwrap();

    let node = tree
        .create_node(NodeId(steptree_core::next_serial()), false, None)
        .await
        .unwrap();
    let remote = manager.remote_id(node).unwrap();

    tree.reparent(node, root, Insert::At(0));
    manager.drain().await;

    let calls = backend.posts_with_suffix(&format!("step/{}/reparent", remote.0));
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, json!({ "parent": 1, "index": 0 }));
}

#[tokio::test]
async fn test_orphan_enqueues_remote_call() {
    let backend = FakeBackend::new();
    let (tree, manager) = setup(backend.clone()).await;
    let root = tree.root().unwrap();

    let node = tree
        .create_node(NodeId(steptree_core::next_serial()), false, None)
        .await
        .unwrap();
    let remote = manager.remote_id(node).unwrap();
    tree.reparent(node, root, Insert::End);
    tree.orphan(node);
    manager.drain().await;

    assert_eq!(
        backend
            .posts_with_suffix(&format!("step/{}/orphan", remote.0))
            .len(),
        1
    );
}

#[tokio::test]
async fn test_destroy_flushes_queue_then_destroys_remotely() {
    let backend = FakeBackend::new();
    let (tree, manager) = setup(backend.clone()).await;
    let root = tree.root().unwrap();

    let node = tree
        .create_node(NodeId(steptree_core::next_serial()), false, None)
        .await
        .unwrap();
    let remote = manager.remote_id(node).unwrap();

    tree.reparent(node, root, Insert::At(0));
    tree.orphan(node);
    tree.destroy_node(node).await.unwrap();

    // Program order on the wire: reparent, orphan, destroy last.
    let suffixes: Vec<String> = backend
        .posts()
        .iter()
        .map(|(path, _)| path.rsplit('/').next().unwrap().to_string())
        .collect();
    assert_eq!(suffixes, vec!["create", "reparent", "orphan", "destroy"]);

    // The binding is gone once the remote acknowledged.
    assert_eq!(manager.remote_id(node), None);
    assert_eq!(manager.local_node(remote), None);
    assert!(!tree.contains(node));
}

#[tokio::test]
async fn test_destroy_non_leaf_panics_and_stays_local() {
    let backend = FakeBackend::new();
    let (tree, _manager) = setup(backend.clone()).await;

    let parent = tree
        .create_node(NodeId(steptree_core::next_serial()), false, None)
        .await
        .unwrap();
    let child = tree
        .create_node(NodeId(steptree_core::next_serial()), false, None)
        .await
        .unwrap();
    tree.reparent(child, parent, Insert::End);

    let result = AssertUnwindSafe(tree.destroy_node(parent)).catch_unwind().await;
    assert!(result.is_err());

    // The precondition fired before any remote call was issued.
    assert!(backend.posts_with_suffix("/destroy").is_empty());
    assert!(tree.contains(parent));
}

#[tokio::test]
async fn test_set_sentence_updates_cache_and_remote() {
    let backend = FakeBackend::new();
    let (tree, manager) = setup(backend.clone()).await;
    let root = tree.root().unwrap();

    let node = tree
        .create_node(NodeId(steptree_core::next_serial()), false, None)
        .await
        .unwrap();
    tree.reparent(node, root, Insert::End);
    let remote = manager.remote_id(node).unwrap();

    let done = manager.set_sentence(&tree, node, "|- et".to_string());
    done.await.unwrap().unwrap();

    let state = manager.step_state(&tree, node).unwrap();
    assert_eq!(state.sentence, "|- et");
    let calls = backend.posts_with_suffix(&format!("step/{}/set_sentence", remote.0));
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, json!({ "sentence": "|- et" }));
}

#[tokio::test]
async fn test_event_pump_reconciles_remote_update() {
    let backend = FakeBackend::new();
    backend.set_children(1, &[10]);
    backend.add_step(10, "|- ph", &[]);

    let (tree, manager) = setup(backend.clone()).await;
    let mut events = manager.take_event_rx().unwrap();

    backend.set_sentence(10, "|- ph updated");
    backend.push_event(json!({ "event": "step_updated", "step_id": 10 }));

    let pump = manager.spawn_event_pump(tree.clone());

    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event within timeout")
        .expect("channel open");
    let node = manager.local_node(StepId(10)).unwrap();
    assert_eq!(
        event,
        WorksetEvent::StepUpdated {
            node,
            step: StepId(10)
        }
    );

    let state = manager.step_state(&tree, node).unwrap();
    assert_eq!(state.sentence, "|- ph updated");

    pump.abort();
}

#[tokio::test]
async fn test_event_pump_skips_unknown_and_unbound_events() {
    let backend = FakeBackend::new();
    let (tree, manager) = setup(backend.clone()).await;
    let mut events = manager.take_event_rx().unwrap();

    backend.push_event(json!({ "event": "workset_renamed" }));
    backend.push_event(json!({ "event": "step_updated", "step_id": 555 }));
    backend.set_sentence(1, "|- root");
    backend.push_event(json!({ "event": "step_updated", "step_id": 1 }));

    let pump = manager.spawn_event_pump(tree.clone());

    // Only the bound step produces an application event.
    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event within timeout")
        .expect("channel open");
    let root = tree.root().unwrap();
    assert_eq!(
        event,
        WorksetEvent::StepUpdated {
            node: root,
            step: StepId(1)
        }
    );

    pump.abort();
}

#[tokio::test]
async fn test_rejected_reparent_surfaces_desync() {
    let backend = FakeBackend::new();
    let (tree, manager) = setup(backend.clone()).await;
    let root = tree.root().unwrap();
    let mut events = manager.take_event_rx().unwrap();

    backend.reject_op("reparent");

    let node = tree
        .create_node(NodeId(steptree_core::next_serial()), false, None)
        .await
        .unwrap();
    let remote = manager.remote_id(node).unwrap();
    tree.reparent(node, root, Insert::At(0));
    manager.drain().await;

    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event within timeout")
        .expect("channel open");
    assert_eq!(
        event,
        WorksetEvent::Desynchronized {
            op: "reparent",
            step: remote
        }
    );

    // The local mutation is not rolled back.
    assert_eq!(tree.parent(node), Some(root));
}

#[tokio::test]
async fn test_rejected_destroy_keeps_binding_and_surfaces_desync() {
    let backend = FakeBackend::new();
    let (tree, manager) = setup(backend.clone()).await;
    let mut events = manager.take_event_rx().unwrap();

    backend.reject_op("destroy");

    let node = tree
        .create_node(NodeId(steptree_core::next_serial()), false, None)
        .await
        .unwrap();
    let remote = manager.remote_id(node).unwrap();

    tree.destroy_node(node).await.unwrap();
    assert!(!tree.contains(node));

    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event within timeout")
        .expect("channel open");
    assert_eq!(
        event,
        WorksetEvent::Desynchronized {
            op: "destroy",
            step: remote
        }
    );

    // Unbinding happens only on success.
    assert_eq!(manager.local_node(remote), Some(node));
}
