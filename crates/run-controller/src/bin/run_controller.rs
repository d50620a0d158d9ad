/*
 * Run Controller - Controller Service
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Run Controller Service
//!
//! Wires the run lifecycle engine against the cluster it runs in:
//! - Loads the mounted configuration
//! - Runs the background sweeper that archives logs and cleans up finished runs
//! - Serves health and readiness endpoints

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use run_controller::cluster::{KubeClusterClient, KubeLogSource};
use run_controller::memory::{FileLogArchive, MemoryRepository};
use run_controller::{ControllerConfig, RunManager, RunSweeper};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

#[derive(Clone)]
struct AppState {
    manager: Arc<RunManager>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting Run Controller v{}", env!("CARGO_PKG_VERSION"));

    let config = load_controller_config();
    config.validate()?;
    let config = Arc::new(config);

    let client = kube_client(&config).await?;
    info!(
        namespace = config.namespace(),
        "Connected to Kubernetes cluster"
    );

    let repository = Arc::new(MemoryRepository::new());
    let cluster = Arc::new(KubeClusterClient::new(client.clone(), config.namespace()));
    let log_source = Arc::new(KubeLogSource::new(client, config.namespace()));
    let log_archive = Arc::new(FileLogArchive::new(&config.log_archive.directory));

    let manager = Arc::new(RunManager::new(
        repository.clone(),
        cluster.clone(),
        log_source.clone(),
        log_archive.clone(),
    ));

    let sweeper = Arc::new(RunSweeper::new(
        &config.sweeper,
        repository,
        cluster,
        log_source,
        log_archive,
    ))
    .start();

    let app = router(AppState { manager });

    let listener = tokio::net::TcpListener::bind(&config.server.listen_address).await?;
    info!(
        "Run controller HTTP server listening on {}",
        config.server.listen_address
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.stop(config.sweeper.shutdown_timeout()).await;
    info!("Run controller stopped");

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    Duration::from_secs(30),
                )),
        )
        .with_state(state)
}

fn init_tracing() {

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json = std::env::var("LOG_FORMAT")
        .is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn load_controller_config() -> ControllerConfig {
    let override_path = std::env::var("RUN_CONTROLLER_CONFIG_PATH").ok();
    let config_path = override_path
        .as_deref()
        .filter(|path| Path::new(path).exists())
        .unwrap_or(DEFAULT_CONFIG_PATH);

    match ControllerConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            info!("Loaded controller configuration from {}", config_path);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load configuration from {}: {}. Using defaults.",
                config_path, err
            );
            ControllerConfig::default()
        }
    }
}

async fn kube_client(
    config: &ControllerConfig,
) -> Result<kube::Client, Box<dyn std::error::Error>> {
    let Some(path) = config.kubernetes.kubeconfig_path.as_deref() else {
        return Ok(kube::Client::try_default().await?);
    };

    let kubeconfig = kube::config::Kubeconfig::read_from(path)?;
    let client_config = kube::Config::from_custom_kubeconfig(
        kubeconfig,
        &kube::config::KubeConfigOptions::default(),
    )
    .await?;
    Ok(kube::Client::try_from(client_config)?)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "run-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    // The run store must answer before traffic is routed here.
    if let Err(e) = state.manager.list_runs(Some(1), None, None).await {
        error!(error = %e, "Readiness check failed");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(json!({
        "status": "ready",
        "service": "run-controller",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use k8s_openapi::api::apps::v1::StatefulSet;
    use k8s_openapi::api::batch::v1::Job;
    use k8s_openapi::api::core::v1::{Pod, Secret, Service};
    use run_controller::cluster::{ClusterClient, JobPage, ResourceKind};
    use run_controller::memory::{MemoryLogArchive, MemoryLogSource};
    use run_controller::{Error, Result};
    use tower::ServiceExt;

    /// The health endpoints never reach the cluster.
    struct OfflineCluster;

    fn offline<T>() -> Result<T> {
        Err(Error::ConfigError("no cluster in tests".to_string()))
    }

    #[async_trait]
    impl ClusterClient for OfflineCluster {
        async fn create_job(&self, _job: &Job) -> Result<Job> {
            offline()
        }

        async fn create_stateful_set(&self, _stateful_set: &StatefulSet) -> Result<StatefulSet> {
            offline()
        }

        async fn create_service(&self, _service: &Service) -> Result<Service> {
            offline()
        }

        async fn create_secret(&self, _secret: &Secret) -> Result<Secret> {
            offline()
        }

        async fn get_job(&self, _name: &str) -> Result<Option<Job>> {
            offline()
        }

        async fn list_jobs(&self, _selector: &str, _continuation: Option<&str>) -> Result<JobPage> {
            offline()
        }

        async fn list_pods(&self, _selector: &str) -> Result<Vec<Pod>> {
            offline()
        }

        async fn patch_pod_finalizers(&self, _name: &str, _finalizers: Vec<String>) -> Result<()> {
            offline()
        }

        async fn delete_collection(&self, _kind: ResourceKind, _selector: &str) -> Result<()> {
            offline()
        }
    }

    fn app() -> Router {
        let manager = RunManager::new(
            Arc::new(MemoryRepository::new()),
            Arc::new(OfflineCluster),
            Arc::new(MemoryLogSource::new()),
            Arc::new(MemoryLogArchive::new()),
        );
        router(AppState {
            manager: Arc::new(manager),
        })
    }

    async fn get_json(uri: &str) -> (StatusCode, Value) {
        let response = app()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (status, body) = get_json("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "run-controller");
    }

    #[tokio::test]
    async fn test_ready_endpoint_queries_run_store() {
        let (status, body) = get_json("/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let response = app()
            .oneshot(Request::builder().uri("/runs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
