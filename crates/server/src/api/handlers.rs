use super::links::Link;
use super::ApiResult;
use crate::config::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use ruleflow_core::events::Event;
use ruleflow_core::storage::FileEntry;
use ruleflow_core::workflow::ReportOutcome;
use ruleflow_core::{
    AppliedRule, Context, Edge, Node, NodeId, NodeState, OffsetRule, RuleId, TaskEvent, Workflow,
    WorkflowDescriptor, WorkflowId, WorkflowStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Service root
pub async fn root(State(state): State<Arc<AppState>>) -> Json<RootResponse> {
    Json(RootResponse {
        service: "ruleflow".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        links: state.urls.root_links(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RootResponse {
    pub service: String,
    pub version: String,
    pub links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
pub struct ListWorkflowsQuery {
    pub status: Option<WorkflowStatus>,
}

/// List workflows, optionally filtered by status
pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListWorkflowsQuery>,
) -> ApiResult<Json<ListWorkflowsResponse>> {
    let workflows = state
        .engine
        .list_workflows(query.status)
        .await?
        .into_iter()
        .map(|descriptor| WorkflowSummary {
            links: state.urls.workflow_summary_links(&descriptor.id),
            descriptor,
        })
        .collect();

    Ok(Json(ListWorkflowsResponse {
        workflows,
        links: vec![
            Link::new("self", state.urls.workflows()),
            Link::new("workflow-stats", state.urls.workflow_stats()),
        ],
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowSummary {
    #[serde(flatten)]
    pub descriptor: WorkflowDescriptor,
    pub links: Vec<Link>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListWorkflowsResponse {
    pub workflows: Vec<WorkflowSummary>,
    pub links: Vec<Link>,
}

/// Number of workflows per status
pub async fn workflow_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<WorkflowStatsResponse>> {
    let stats = state.engine.workflow_stats().await?;
    Ok(Json(WorkflowStatsResponse {
        total: stats.total,
        by_status: stats.by_status,
        links: vec![
            Link::new("self", state.urls.workflow_stats()),
            Link::new("workflows", state.urls.workflows()),
        ],
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowStatsResponse {
    pub total: usize,
    pub by_status: BTreeMap<WorkflowStatus, usize>,
    pub links: Vec<Link>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub key: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateWorkflowRequest {
    pub template: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

/// Create a workflow from a template reference
pub async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateWorkflowRequest>,
) -> ApiResult<impl IntoResponse> {
    let parameters: Context = req
        .parameters
        .into_iter()
        .map(|p| (p.key, p.value))
        .collect();

    let workflow = state
        .engine
        .create_workflow(&req.template, req.name.as_deref(), &parameters)
        .await?;

    let mut headers = HeaderMap::new();
    if let Ok(location) = HeaderValue::from_str(&state.urls.workflow(&workflow.id)) {
        headers.insert(header::LOCATION, location);
    }
    Ok((StatusCode::CREATED, headers, Json(WorkflowView::new(&state, workflow))))
}

/// Full workflow state
pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<WorkflowId>,
) -> ApiResult<Json<WorkflowView>> {
    let workflow = state.engine.get_workflow(workflow_id).await?;
    Ok(Json(WorkflowView::new(&state, workflow)))
}

pub async fn delete_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<WorkflowId>,
) -> ApiResult<StatusCode> {
    state.engine.delete_workflow(workflow_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApplyRulesRequest {
    pub rules: Vec<RuleId>,
}

pub async fn apply_rules(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<WorkflowId>,
    Json(req): Json<ApplyRulesRequest>,
) -> ApiResult<Json<WorkflowView>> {
    let workflow = state.engine.apply_rules(workflow_id, &req.rules).await?;
    Ok(Json(WorkflowView::new(&state, workflow)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitNodesRequest {
    pub nodes: Vec<NodeId>,
}

pub async fn submit_nodes(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<WorkflowId>,
    Json(req): Json<SubmitNodesRequest>,
) -> ApiResult<Json<WorkflowView>> {
    let workflow = state.engine.submit_nodes(workflow_id, &req.nodes).await?;
    Ok(Json(WorkflowView::new(&state, workflow)))
}

/// Progress report from a remote execution backend
pub async fn report_result(
    State(state): State<Arc<AppState>>,
    Path((workflow_id, node_id)): Path<(WorkflowId, NodeId)>,
    Json(event): Json<TaskEvent>,
) -> ApiResult<Json<ReportResponse>> {
    let (accepted, state_after) = match state.engine.report_result(workflow_id, &node_id, event).await? {
        ReportOutcome::Applied(node_state) => (true, node_state),
        ReportOutcome::Ignored(node_state) => (false, node_state),
    };

    Ok(Json(ReportResponse {
        links: vec![Link::new("workflow", state.urls.workflow(&workflow_id))],
        node: node_id,
        accepted,
        state: state_after,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportResponse {
    pub node: NodeId,
    /// False when the report did not fit the node state and was ignored
    pub accepted: bool,
    pub state: NodeState,
    pub links: Vec<Link>,
}

/// Working directory listing
pub async fn list_files(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<WorkflowId>,
) -> ApiResult<Json<ListFilesResponse>> {
    let files = state
        .engine
        .list_files(workflow_id)
        .await?
        .into_iter()
        .map(|entry| FileView {
            links: vec![Link::new("download", state.urls.file(&workflow_id, &entry.path))],
            entry,
        })
        .collect();

    Ok(Json(ListFilesResponse {
        files,
        links: vec![
            Link::new("self", state.urls.files(&workflow_id)),
            Link::new("workflow", state.urls.workflow(&workflow_id)),
        ],
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileView {
    #[serde(flatten)]
    pub entry: FileEntry,
    pub links: Vec<Link>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListFilesResponse {
    pub files: Vec<FileView>,
    pub links: Vec<Link>,
}

/// Download one file from a workflow working directory
pub async fn download_file(
    State(state): State<Arc<AppState>>,
    Path((workflow_id, path)): Path<(WorkflowId, String)>,
) -> ApiResult<impl IntoResponse> {
    let data = state.engine.read_file(workflow_id, &path).await?;
    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    Ok(([(header::CONTENT_TYPE, mime.to_string())], data))
}

pub async fn get_workflow_events(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<WorkflowId>,
) -> ApiResult<Json<GetWorkflowEventsResponse>> {
    let events = state.engine.workflow_events(workflow_id).await?;
    Ok(Json(GetWorkflowEventsResponse {
        events,
        links: vec![
            Link::new("self", state.urls.events(&workflow_id)),
            Link::new("workflow", state.urls.workflow(&workflow_id)),
        ],
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetWorkflowEventsResponse {
    pub events: Vec<Event>,
    pub links: Vec<Link>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeView {
    #[serde(flatten)]
    pub node: Node,
    pub links: Vec<Link>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DagView {
    pub nodes: Vec<NodeView>,
    pub edges: Vec<Edge>,
}

/// Workflow as exposed over HTTP
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowView {
    pub id: WorkflowId,
    pub name: String,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub context: Context,
    pub dag: DagView,
    pub rules: Vec<OffsetRule>,
    pub applied: Vec<AppliedRule>,
    pub applicable_rules: Vec<RuleId>,
    pub submittable_nodes: Vec<NodeId>,
    pub revision: u64,
    pub links: Vec<Link>,
}

impl WorkflowView {
    pub fn new(state: &AppState, workflow: Workflow) -> Self {
        let submittable_nodes = workflow.submittable_nodes();
        let id = workflow.id;
        let nodes = workflow
            .dag
            .nodes
            .into_iter()
            .map(|node| NodeView {
                links: state.urls.node_links(&id, &node.id),
                node,
            })
            .collect();

        Self {
            id,
            name: workflow.name,
            status: workflow.status,
            created_at: workflow.created_at,
            context: workflow.context,
            dag: DagView {
                nodes,
                edges: workflow.dag.edges,
            },
            rules: workflow.rules,
            applied: workflow.applied,
            applicable_rules: workflow.applicable,
            submittable_nodes,
            revision: workflow.revision,
            links: state.urls.workflow_links(&id),
        }
    }
}
