//! HTTP API over the environment coordinator
//!
//! JSON bodies use the camelCase field names course tooling already sends
//! (`courseName`, `assignmentName`, `netIDs`). Every error response is
//! `{"error": message}` with a status derived from the error kind.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::environment::{Environment, EnvironmentDescriptor, EnvironmentId};
use crate::lifecycle::EnvironmentCoordinator;
use crate::routing::RoutingSnapshot;
use crate::Error;

/// Request to create one environment per listed student
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEnvironmentRequest {
    /// Course display name
    pub course_name: String,
    /// Assignment display name
    pub assignment_name: String,
    /// Students to create environments for
    #[serde(rename = "netIDs")]
    pub net_ids: Vec<String>,
    /// Image every environment runs
    pub image: String,
    /// Replicas per environment (default 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

impl CreateEnvironmentRequest {
    /// Validate and expand into one descriptor per student
    pub fn descriptors(&self) -> Result<Vec<EnvironmentDescriptor>, Error> {
        if self.net_ids.is_empty() {
            return Err(Error::validation_for_field(
                "netIDs",
                "at least one student is required",
            ));
        }
        self.net_ids
            .iter()
            .map(|student| {
                let id = EnvironmentId::new(&self.course_name, &self.assignment_name, student)?;
                EnvironmentDescriptor::with_replicas(id, &self.image, self.replicas.unwrap_or(1))
            })
            .collect()
    }
}

/// Request to delete one student's environment
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteEnvironmentRequest {
    /// Course display name
    pub course_name: String,
    /// Assignment display name
    pub assignment_name: String,
    /// Student whose environment is deleted
    #[serde(rename = "netID")]
    pub net_id: String,
}

/// Result of creating one student's environment
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentOutcome {
    /// Student id as sent
    #[serde(rename = "netID")]
    pub net_id: String,
    /// The environment, when creation succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    /// Failure message, when creation failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response to [`CreateEnvironmentRequest`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateEnvironmentResponse {
    /// One entry per requested student, in request order
    pub environments: Vec<StudentOutcome>,
}

/// Response to `GET /proxy`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyAddressResponse {
    /// Externally reachable address of the shared proxy
    pub address: String,
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Validation { .. } | Error::InvalidRoute { .. } => StatusCode::BAD_REQUEST,
        Error::ResourceNotFound { .. } => StatusCode::NOT_FOUND,
        Error::Conflict { .. } => StatusCode::CONFLICT,
        Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        let message = match &self {
            Error::Internal { .. } => {
                error!(error = %self, "internal error");
                "internal error".to_string()
            }
            _ => self.to_string(),
        };

        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

/// Build the API router
pub fn router(coordinator: Arc<EnvironmentCoordinator>) -> Router {
    Router::new()
        .route("/environment", post(create_environments))
        .route("/environment/delete", post(delete_environment))
        .route("/environments", get(list_environments))
        .route("/routes", get(routes))
        .route("/proxy", get(proxy_address))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(coordinator)
}

async fn create_environments(
    State(coordinator): State<Arc<EnvironmentCoordinator>>,
    Json(request): Json<CreateEnvironmentRequest>,
) -> Result<Response, Error> {
    let descriptors = request.descriptors()?;
    info!(
        course = %request.course_name,
        assignment = %request.assignment_name,
        students = descriptors.len(),
        "creating environments"
    );

    let results = join_all(
        descriptors
            .iter()
            .map(|descriptor| coordinator.create_environment(descriptor)),
    )
    .await;

    let mut status = StatusCode::CREATED;
    let environments = request
        .net_ids
        .iter()
        .zip(results)
        .map(|(net_id, result)| match result {
            Ok(environment) => StudentOutcome {
                net_id: net_id.clone(),
                environment: Some(environment),
                error: None,
            },
            Err(e) => {
                if status == StatusCode::CREATED {
                    status = status_for(&e);
                }
                StudentOutcome {
                    net_id: net_id.clone(),
                    environment: None,
                    error: Some(e.to_string()),
                }
            }
        })
        .collect();

    Ok((status, Json(CreateEnvironmentResponse { environments })).into_response())
}

async fn delete_environment(
    State(coordinator): State<Arc<EnvironmentCoordinator>>,
    Json(request): Json<DeleteEnvironmentRequest>,
) -> Result<StatusCode, Error> {
    let id = EnvironmentId::new(
        &request.course_name,
        &request.assignment_name,
        &request.net_id,
    )?;
    coordinator.delete_environment(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_environments(
    State(coordinator): State<Arc<EnvironmentCoordinator>>,
) -> Json<Vec<Environment>> {
    Json(coordinator.environments())
}

async fn routes(State(coordinator): State<Arc<EnvironmentCoordinator>>) -> Json<RoutingSnapshot> {
    Json(coordinator.routing().snapshot())
}

async fn proxy_address(
    State(coordinator): State<Arc<EnvironmentCoordinator>>,
) -> Result<Json<ProxyAddressResponse>, Error> {
    let address = coordinator.proxy_address().await?;
    Ok(Json(ProxyAddressResponse { address }))
}
