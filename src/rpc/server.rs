//! HTTP transport for the router: one POST route per project plus the
//! read-only discovery endpoints, served by actix-web.

use super::protocol::{JsonRpcError, JsonRpcResponse, INVALID_REQUEST};
use super::router::RpcRouter;
use crate::config::{ControlPlaneConfig, ServerConfig};
use actix_web::dev::Server;
use actix_web::{web, App, HttpResponse, HttpServer};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

const SERVER_WORKERS: usize = 2;

#[derive(Error, Debug)]
pub enum RpcServerError {
    #[error("could not bind http server: `{0}`")]
    Bind(String),
}

/// Shared per-worker state.
pub struct ServerState {
    pub router: Arc<RpcRouter>,
    /// Configuration source re-read on `/reload`.
    pub config_path: PathBuf,
}

/// Builds and starts the HTTP server, returning its handle so the run
/// loop can stop it gracefully.
pub fn run_server(
    server_config: &ServerConfig,
    state: Arc<ServerState>,
) -> Result<Server, RpcServerError> {
    info!(
        "starting HTTP server at http://{}:{}",
        server_config.host, server_config.port
    );
    let state_data = web::Data::new(state);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state_data.clone())
            .route("/mcp/{project}", web::post().to(project_endpoint_handler))
            .route("/health", web::get().to(health_handler))
            .route("/stats", web::get().to(stats_handler))
            .route("/endpoints", web::get().to(endpoints_handler))
            .route("/reload", web::post().to(reload_handler))
    })
    .workers(SERVER_WORKERS)
    .bind((server_config.host.to_string(), server_config.port))
    .map_err(|err| RpcServerError::Bind(err.to_string()))?
    .run();

    Ok(server)
}

async fn project_endpoint_handler(
    state: web::Data<Arc<ServerState>>,
    path: web::Path<String>,
    body: web::Bytes,
) -> HttpResponse {
    let project = path.into_inner();
    let Some(endpoint) = state.router.endpoint(&project) else {
        let known = state.router.project_names().join(", ");
        let error = JsonRpcError::new(
            INVALID_REQUEST,
            format!("unknown project `{project}`"),
        )
        .with_recommendation(format!("known projects: {known}"));
        return HttpResponse::NotFound().json(JsonRpcResponse::failure(Value::Null, error));
    };

    match endpoint.handle_body(&body).await {
        Some(response) => HttpResponse::Ok().json(response),
        // Notification: acknowledged with an empty body.
        None => HttpResponse::NoContent().finish(),
    }
}

async fn health_handler(state: web::Data<Arc<ServerState>>) -> HttpResponse {
    HttpResponse::Ok().json(state.router.health())
}

async fn stats_handler(state: web::Data<Arc<ServerState>>) -> HttpResponse {
    HttpResponse::Ok().json(state.router.stats())
}

async fn endpoints_handler(state: web::Data<Arc<ServerState>>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "endpoints": state.router.project_names(),
    }))
}

/// Rebuilds the endpoint set from the configuration source. In-flight
/// requests on existing endpoints are unaffected.
async fn reload_handler(state: web::Data<Arc<ServerState>>) -> HttpResponse {
    match ControlPlaneConfig::load(&state.config_path) {
        Ok(config) => {
            state.router.reload(&config.projects);
            info!("configuration reloaded");
            HttpResponse::Ok().json(serde_json::json!({
                "reloaded": true,
                "endpoints": state.router.project_names(),
            }))
        }
        Err(err) => {
            error!(error_msg = %err, "reloading configuration");
            HttpResponse::UnprocessableEntity().json(serde_json::json!({
                "reloaded": false,
                "error": err.to_string(),
            }))
        }
    }
}
