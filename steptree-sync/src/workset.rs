//! Remote workset session layer.
//!
//! A workset is the remote store's backing session for one tree. This
//! module covers the workset lifecycle (version handshake, create, list,
//! attach, load, destroy) and the path-building helpers the sync
//! observer uses for step-scoped requests.

use std::sync::{Arc, RwLock};

use serde_json::{json, Value};

use crate::error::SyncError;
use crate::protocol::{
    Ack, CreatedStep, CreatedWorkset, LoadStatus, StepData, StepDump, StepId, VersionInfo,
    WorksetContext, WorksetList, WorksetSummary, API_VERSION,
};
use crate::transport::ApiTransport;

/// Check that the server announces a compatible API revision.
pub async fn check_version(transport: &dyn ApiTransport) -> Result<(), SyncError> {
    let value = transport.get("api/version").await?;
    let info: VersionInfo = serde_json::from_value(value)?;
    if info.compatible() {
        Ok(())
    } else {
        Err(SyncError::VersionMismatch {
            application: info.application,
            min_version: info.min_version,
            max_version: info.max_version,
            client: API_VERSION,
        })
    }
}

/// Create a fresh workset on the server and fetch its context.
pub async fn create_workset(transport: Arc<dyn ApiTransport>) -> Result<Workset, SyncError> {
    let value = transport
        .get(&format!("api/{API_VERSION}/workset/create"))
        .await?;
    let created: CreatedWorkset = serde_json::from_value(value)?;
    log::info!("created workset {}", created.id);
    let workset = Workset::new(transport, created.id);
    workset.refresh_context().await?;
    Ok(workset)
}

/// List the worksets the server currently holds.
pub async fn list_worksets(
    transport: &dyn ApiTransport,
) -> Result<Vec<WorksetSummary>, SyncError> {
    let value = transport
        .get(&format!("api/{API_VERSION}/workset/list"))
        .await?;
    let list: WorksetList = serde_json::from_value(value)?;
    Ok(list.worksets)
}

/// Attach to an existing workset and fetch its context.
pub async fn load_workset(
    transport: Arc<dyn ApiTransport>,
    id: u64,
) -> Result<Workset, SyncError> {
    let workset = Workset::new(transport, id);
    workset.refresh_context().await?;
    Ok(workset)
}

/// Handle to one remote workset.
pub struct Workset {
    transport: Arc<dyn ApiTransport>,
    id: u64,
    context: RwLock<Option<WorksetContext>>,
}

impl Workset {
    fn new(transport: Arc<dyn ApiTransport>, id: u64) -> Self {
        Self {
            transport,
            id,
            context: RwLock::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The workset's display name, once the context is known.
    pub fn name(&self) -> Option<String> {
        self.context
            .read()
            .unwrap()
            .as_ref()
            .map(|context| context.name.clone())
    }

    pub fn is_loaded(&self) -> bool {
        self.context
            .read()
            .unwrap()
            .as_ref()
            .is_some_and(|context| context.status == LoadStatus::Loaded)
    }

    /// Remote id of the workset's root step, once loaded.
    pub fn root_step_id(&self) -> Option<StepId> {
        self.context
            .read()
            .unwrap()
            .as_ref()
            .and_then(|context| context.root_step_id)
    }

    /// Shared transport handle, for operations that outlive a borrow of
    /// the workset (queued remote calls, the event pump).
    pub(crate) fn transport(&self) -> Arc<dyn ApiTransport> {
        Arc::clone(&self.transport)
    }

    /// `api/1/workset/{id}/{suffix}`
    fn path(&self, suffix: &str) -> String {
        format!("api/{API_VERSION}/workset/{}/{suffix}", self.id)
    }

    /// `api/1/workset/{id}/step/{step}/{suffix}`
    pub(crate) fn step_path(&self, step: StepId, suffix: &str) -> String {
        self.path(&format!("step/{step}/{suffix}"))
    }

    pub(crate) async fn api_get(&self, suffix: &str) -> Result<Value, SyncError> {
        self.transport.get(&self.path(suffix)).await
    }

    pub(crate) async fn api_post(&self, suffix: &str, body: Value) -> Result<Value, SyncError> {
        self.transport.post(&self.path(suffix), &body).await
    }

    /// Re-fetch and cache the workset context.
    pub async fn refresh_context(&self) -> Result<WorksetContext, SyncError> {
        let value = self.api_get("get_context").await?;
        let context: WorksetContext = serde_json::from_value(value)?;
        *self.context.write().unwrap() = Some(context.clone());
        Ok(context)
    }

    /// Ask the server to load the workset's backing database, then
    /// refresh the context.
    pub async fn load(&self) -> Result<WorksetContext, SyncError> {
        self.api_get("load").await?;
        self.refresh_context().await
    }

    /// Destroy the workset on the server.
    pub async fn destroy(&self) -> Result<(), SyncError> {
        let value = self.api_post("destroy", json!({})).await?;
        let ack: Ack = serde_json::from_value(value)?;
        if ack.success {
            Ok(())
        } else {
            Err(SyncError::RemoteRejected {
                op: "destroy_workset",
                id: self.id,
            })
        }
    }

    // ---------------------------------------------------------------
    // Step-scoped requests used by the sync observer
    // ---------------------------------------------------------------

    /// Create an empty remote step.
    pub(crate) async fn create_step(&self) -> Result<StepId, SyncError> {
        let value = self.api_post("step/create", json!({})).await?;
        let created: CreatedStep = serde_json::from_value(value)?;
        Ok(created.id)
    }

    /// Create a remote step subtree from a dump.
    pub(crate) async fn create_step_from_dump(&self, dump: &StepDump) -> Result<StepId, SyncError> {
        let body = json!({ "dump": serde_json::to_string(dump)? });
        let value = self.api_post("step/create_from_dump", body).await?;
        let created: CreatedStep = serde_json::from_value(value)?;
        Ok(created.id)
    }

    /// Fetch a step's current payload and children.
    pub(crate) async fn get_step(&self, step: StepId) -> Result<StepData, SyncError> {
        let value = self.transport.get(&self.step_path(step, "get")).await?;
        Ok(serde_json::from_value(value)?)
    }
}
