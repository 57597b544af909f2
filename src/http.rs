/// HTTP admin API.
///
/// Exposes the topology of a node and accepts change requests.
///
/// # Example
///
/// ```ignore
/// use clustertopo::http::HttpServer;
///
/// let node = Arc::new(ClusterNode::open(config, ChangeExecutors::noop()).await?);
/// node.start().await?;
/// HttpServer::new(node).bind("0.0.0.0:9600").await?;
/// ```
///
/// # API Endpoints
///
/// ## Queries
/// - `GET /api/v1/topology` - Full cluster configuration
/// - `GET /api/v1/partitions` - Replicas and preferred leader per partition
/// - `GET /api/v1/status` - Node status
///
/// ## Changes
/// - `POST /api/v1/operations` - Apply an explicit operation list
/// - `POST /api/v1/members` - Add members
/// - `DELETE /api/v1/members/:id` - Remove a member
/// - `POST /api/v1/partitions/scale` - Increase the partition count
/// - `POST /api/v1/partitions/reassign` - Redistribute partitions over a member set
/// - `POST /api/v1/partitions/:id/replicas` - Add a replica
/// - `PUT /api/v1/partitions/:id/replicas/:member` - Change a replica's priority
/// - `DELETE /api/v1/partitions/:id/replicas/:member` - Remove a replica
/// - `POST /api/v1/exporters/:name/enable` - Enable an exporter everywhere
/// - `POST /api/v1/exporters/:name/disable` - Disable an exporter everywhere
/// - `POST /api/v1/changes/cancel` - Cancel a failed change
/// - `POST /api/v1/changes/retry` - Retry a failed change
///
/// Change endpoints accept `dry_run` (return the expected result without
/// committing) and `wait` (default true; false returns right after commit).
/// Only the coordinator accepts changes; other members answer
/// `421 Misdirected Request` naming the coordinator.
use crate::configuration::{ChangeStatus, ClusterConfiguration};
use crate::error::{TopologyError, TopologyResult};
use crate::node::{ClusterNode, NodeStatus};
use crate::operations::ClusterChangeOperation;
use crate::requests::{self, ChangeRequest};
use crate::types::{MemberId, PartitionId, PartitionMetadata};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// HTTP server for a cluster node.
pub struct HttpServer {
    node: Arc<ClusterNode>,
}

impl HttpServer {
    pub fn new(node: Arc<ClusterNode>) -> Self {
        Self { node }
    }

    /// Serve on `addr` until the process exits.
    pub async fn bind(self, addr: &str) -> TopologyResult<()> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| TopologyError::invalid(format!("Invalid address: {}", e)))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| TopologyError::Network(format!("Failed to bind: {}", e)))?;
        info!(%addr, "Admin API listening");
        axum::serve(listener, create_router(self.node))
            .await
            .map_err(|e| TopologyError::Network(format!("Server error: {}", e)))?;
        Ok(())
    }
}

/// Create the Axum router with all routes.
pub fn create_router(node: Arc<ClusterNode>) -> axum::Router {
    use axum::Router;
    use axum::routing::{delete, get, post, put};

    Router::new()
        .route("/api/v1/topology", get(handle_topology))
        .route("/api/v1/partitions", get(handle_partitions))
        .route("/api/v1/status", get(handle_status))
        .route("/api/v1/operations", post(handle_operations))
        .route("/api/v1/members", post(handle_add_members))
        .route("/api/v1/members/:id", delete(handle_remove_member))
        .route("/api/v1/partitions/scale", post(handle_scale))
        .route("/api/v1/partitions/reassign", post(handle_reassign))
        .route("/api/v1/partitions/:id/replicas", post(handle_join_partition))
        .route(
            "/api/v1/partitions/:id/replicas/:member",
            put(handle_reconfigure_priority).delete(handle_leave_partition),
        )
        .route("/api/v1/exporters/:name/enable", post(handle_enable_exporter))
        .route("/api/v1/exporters/:name/disable", post(handle_disable_exporter))
        .route("/api/v1/changes/cancel", post(handle_cancel))
        .route("/api/v1/changes/retry", post(handle_retry))
        .with_state(node)
}

/// Error body: `{"error": "...", "message": "..."}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

struct ApiError(TopologyError);

impl From<TopologyError> for ApiError {
    fn from(error: TopologyError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match &self.0 {
            TopologyError::InvalidRequest { .. } => (StatusCode::BAD_REQUEST, "invalid_request"),
            TopologyError::ChangeInProgress { .. } => (StatusCode::CONFLICT, "change_in_progress"),
            TopologyError::ConcurrentModification { .. } => {
                (StatusCode::CONFLICT, "concurrent_modification")
            }
            TopologyError::NotCoordinator { .. } => {
                (StatusCode::MISDIRECTED_REQUEST, "not_coordinator")
            }
            TopologyError::NoChangeToCancel => (StatusCode::CONFLICT, "no_change"),
            TopologyError::NotInitialized => (StatusCode::SERVICE_UNAVAILABLE, "not_initialized"),
            TopologyError::OperationFailed { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "operation_failed")
            }
            TopologyError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        let body = ErrorResponse {
            error: error.to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// How a change endpoint should behave.
#[derive(Debug, Clone, Copy, Deserialize)]
struct ChangeOptions {
    #[serde(default)]
    dry_run: bool,
    #[serde(default = "default_wait")]
    wait: bool,
}

fn default_wait() -> bool {
    true
}

/// Request body for `POST /api/v1/operations`.
#[derive(Debug, Deserialize)]
struct OperationsRequest {
    operations: Vec<ClusterChangeOperation>,
    #[serde(default)]
    dry_run: bool,
    #[serde(default = "default_wait")]
    wait: bool,
}

/// Request body for `POST /api/v1/members`.
#[derive(Debug, Deserialize)]
struct AddMembersRequest {
    members: BTreeSet<MemberId>,
    #[serde(default)]
    dry_run: bool,
    #[serde(default = "default_wait")]
    wait: bool,
}

/// Request body for `POST /api/v1/partitions/scale`.
#[derive(Debug, Deserialize)]
struct ScaleRequest {
    partition_count: u32,
    #[serde(default)]
    dry_run: bool,
    #[serde(default = "default_wait")]
    wait: bool,
}

/// Request body for `POST /api/v1/partitions/reassign`.
#[derive(Debug, Deserialize)]
struct ReassignRequest {
    members: BTreeSet<MemberId>,
    #[serde(default)]
    replication_factor: Option<u32>,
    #[serde(default)]
    dry_run: bool,
    #[serde(default = "default_wait")]
    wait: bool,
}

/// Request body for `POST /api/v1/partitions/:id/replicas`.
#[derive(Debug, Deserialize)]
struct JoinPartitionRequest {
    member: MemberId,
    #[serde(default = "default_priority")]
    priority: u32,
    #[serde(default)]
    dry_run: bool,
    #[serde(default = "default_wait")]
    wait: bool,
}

fn default_priority() -> u32 {
    1
}

/// Request body for `PUT /api/v1/partitions/:id/replicas/:member`.
#[derive(Debug, Deserialize)]
struct PriorityRequest {
    priority: u32,
    #[serde(default)]
    dry_run: bool,
    #[serde(default = "default_wait")]
    wait: bool,
}

/// Response of every change endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChangeResponse {
    /// Id of the committed change; `None` for dry runs and empty plans.
    pub change_id: Option<u64>,
    /// Operations of the plan, in execution order.
    pub planned: Vec<ClusterChangeOperation>,
    /// Whether the change has been fully applied.
    pub completed: bool,
    /// The resulting (or, for a dry run, expected) configuration.
    pub configuration: ClusterConfiguration,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PartitionsResponse {
    pub partitions: Vec<PartitionMetadata>,
}

// Handler implementations

async fn handle_topology(State(node): State<Arc<ClusterNode>>) -> Json<ClusterConfiguration> {
    Json((*node.configuration()).clone())
}

async fn handle_partitions(State(node): State<Arc<ClusterNode>>) -> Json<PartitionsResponse> {
    Json(PartitionsResponse {
        partitions: node.configuration().partition_metadata(),
    })
}

async fn handle_status(State(node): State<Arc<ClusterNode>>) -> Json<NodeStatus> {
    Json(node.status().await)
}

async fn handle_operations(
    State(node): State<Arc<ClusterNode>>,
    Json(request): Json<OperationsRequest>,
) -> Result<Json<ChangeResponse>, ApiError> {
    let options = ChangeOptions {
        dry_run: request.dry_run,
        wait: request.wait,
    };
    run_change(&node, requests::operations(request.operations), options).await
}

async fn handle_add_members(
    State(node): State<Arc<ClusterNode>>,
    Json(request): Json<AddMembersRequest>,
) -> Result<Json<ChangeResponse>, ApiError> {
    let options = ChangeOptions {
        dry_run: request.dry_run,
        wait: request.wait,
    };
    run_change(&node, requests::add_members(request.members), options).await
}

async fn handle_remove_member(
    State(node): State<Arc<ClusterNode>>,
    Path(id): Path<String>,
    Query(options): Query<ChangeOptions>,
) -> Result<Json<ChangeResponse>, ApiError> {
    let members = BTreeSet::from([MemberId::new(id)]);
    run_change(&node, requests::remove_members(members), options).await
}

async fn handle_scale(
    State(node): State<Arc<ClusterNode>>,
    Json(request): Json<ScaleRequest>,
) -> Result<Json<ChangeResponse>, ApiError> {
    let options = ChangeOptions {
        dry_run: request.dry_run,
        wait: request.wait,
    };
    let coordinator = node
        .configuration()
        .coordinator()
        .cloned()
        .ok_or(TopologyError::NotInitialized)?;
    run_change(
        &node,
        requests::scale_partitions(coordinator, request.partition_count),
        options,
    )
    .await
}

async fn handle_reassign(
    State(node): State<Arc<ClusterNode>>,
    Json(request): Json<ReassignRequest>,
) -> Result<Json<ChangeResponse>, ApiError> {
    let options = ChangeOptions {
        dry_run: request.dry_run,
        wait: request.wait,
    };
    run_change(
        &node,
        requests::reassign_partitions(request.members, request.replication_factor),
        options,
    )
    .await
}

async fn handle_join_partition(
    State(node): State<Arc<ClusterNode>>,
    Path(partition): Path<PartitionId>,
    Json(request): Json<JoinPartitionRequest>,
) -> Result<Json<ChangeResponse>, ApiError> {
    let options = ChangeOptions {
        dry_run: request.dry_run,
        wait: request.wait,
    };
    run_change(
        &node,
        requests::join_partition(request.member, partition, request.priority),
        options,
    )
    .await
}

async fn handle_reconfigure_priority(
    State(node): State<Arc<ClusterNode>>,
    Path((partition, member)): Path<(PartitionId, String)>,
    Json(request): Json<PriorityRequest>,
) -> Result<Json<ChangeResponse>, ApiError> {
    let options = ChangeOptions {
        dry_run: request.dry_run,
        wait: request.wait,
    };
    run_change(
        &node,
        requests::reconfigure_priority(MemberId::new(member), partition, request.priority),
        options,
    )
    .await
}

async fn handle_leave_partition(
    State(node): State<Arc<ClusterNode>>,
    Path((partition, member)): Path<(PartitionId, String)>,
    Query(options): Query<ChangeOptions>,
) -> Result<Json<ChangeResponse>, ApiError> {
    run_change(&node, requests::leave_partition(MemberId::new(member), partition), options).await
}

async fn handle_enable_exporter(
    State(node): State<Arc<ClusterNode>>,
    Path(name): Path<String>,
    Query(options): Query<ChangeOptions>,
) -> Result<Json<ChangeResponse>, ApiError> {
    run_change(&node, requests::enable_exporter(name), options).await
}

async fn handle_disable_exporter(
    State(node): State<Arc<ClusterNode>>,
    Path(name): Path<String>,
    Query(options): Query<ChangeOptions>,
) -> Result<Json<ChangeResponse>, ApiError> {
    run_change(&node, requests::disable_exporter(name), options).await
}

async fn handle_cancel(
    State(node): State<Arc<ClusterNode>>,
) -> Result<Json<ChangeResponse>, ApiError> {
    let configuration = node.coordinator().cancel_failed_change().await?;
    Ok(Json(ChangeResponse {
        change_id: configuration.last_change.as_ref().map(|change| change.id),
        planned: Vec::new(),
        completed: true,
        configuration: (*configuration).clone(),
    }))
}

async fn handle_retry(
    State(node): State<Arc<ClusterNode>>,
) -> Result<Json<ChangeResponse>, ApiError> {
    let change_id = node
        .configuration()
        .pending_changes
        .as_ref()
        .map(|plan| plan.id);
    let configuration = node.coordinator().retry_failed_change().await?;
    Ok(Json(ChangeResponse {
        change_id,
        planned: Vec::new(),
        completed: !configuration.has_pending_changes(),
        configuration: (*configuration).clone(),
    }))
}

async fn run_change(
    node: &ClusterNode,
    request: ChangeRequest,
    options: ChangeOptions,
) -> Result<Json<ChangeResponse>, ApiError> {
    let coordinator = node.coordinator();

    if options.dry_run {
        let mut planned = Vec::new();
        let configuration = coordinator
            .simulate_operations(|config| {
                let operations = request(config)?;
                planned = operations.clone();
                Ok(operations)
            })
            .await?;
        return Ok(Json(ChangeResponse {
            change_id: None,
            planned,
            completed: false,
            configuration,
        }));
    }

    let committed = coordinator.submit_operations(request).await?;
    let planned = committed
        .pending_changes
        .as_ref()
        .map(|plan| plan.pending.clone())
        .unwrap_or_default();
    let change_id = committed.pending_changes.as_ref().map(|plan| plan.id);

    let configuration = match change_id {
        Some(id) if options.wait => wait_for_change(node, id).await?,
        _ => committed,
    };

    Ok(Json(ChangeResponse {
        change_id,
        planned,
        completed: !configuration.has_pending_changes(),
        configuration: (*configuration).clone(),
    }))
}

/// Wait until change `id` is no longer pending, or fails.
async fn wait_for_change(node: &ClusterNode, id: u64) -> TopologyResult<Arc<ClusterConfiguration>> {
    let mut updates = node.store().subscribe();
    loop {
        let current = updates.borrow_and_update().clone();
        let status = current
            .pending_changes
            .as_ref()
            .filter(|plan| plan.id == id)
            .map(|plan| plan.status.clone());
        match status {
            None => return Ok(current),
            Some(ChangeStatus::Failed { operation, reason }) => {
                return Err(TopologyError::OperationFailed {
                    operation: operation.to_string(),
                    reason,
                });
            }
            Some(ChangeStatus::InProgress) => {}
        }
        updates
            .changed()
            .await
            .map_err(|_| TopologyError::invalid("configuration store closed"))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        let response = ApiError(TopologyError::invalid("bad")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = ApiError(TopologyError::ChangeInProgress { change_id: 1 }).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = ApiError(TopologyError::NotInitialized).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = ApiError(TopologyError::NotCoordinator {
            coordinator: Some(MemberId::from("0")),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::MISDIRECTED_REQUEST);
    }

    #[test]
    fn test_change_options_default_to_waiting() {
        let options: ChangeOptions = serde_json::from_str("{}").unwrap();
        assert!(options.wait);
        assert!(!options.dry_run);
    }
}
