//! JSON API exposing the ingestion core to the surrounding application:
//! source listing, extraction triggers, queue stats and scheduler control.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use jobfeed_engine::{
    ExtractionManager, Scheduler, SchedulerError, TaskQueue, JOB_EXTRACT_ALL, JOB_EXTRACT_SOURCE,
};
use jobfeed_storage::ListingRepository;
use serde_json::json;
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "jobfeed-web";

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ExtractionManager>,
    pub queue: Arc<TaskQueue>,
    pub scheduler: Arc<Scheduler>,
    pub repository: Arc<dyn ListingRepository>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/sources", get(sources_handler))
        .route("/extract", post(extract_all_handler))
        .route("/extract/{source}", post(extract_source_handler))
        .route("/queue/stats", get(queue_stats_handler))
        .route("/scheduler", get(scheduler_status_handler))
        .route("/scheduler/{name}/trigger", post(scheduler_trigger_handler))
        .route("/scheduler/{name}/enable", post(scheduler_enable_handler))
        .route("/scheduler/{name}/disable", post(scheduler_disable_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "http api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.repository.count_active().await {
        Ok(active) => Json(json!({ "status": "ok", "activeListings": active })).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.manager.available_sources()).into_response()
}

async fn extract_all_handler(State(state): State<Arc<AppState>>) -> Response {
    let max_attempts = state.queue.config().default_max_attempts;
    let job_id = state.queue.enqueue(JOB_EXTRACT_ALL, json!({}), max_attempts).await;
    Json(json!({ "jobId": job_id, "status": "queued" })).into_response()
}

async fn extract_source_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(source): AxumPath<String>,
) -> Response {
    let available = state.manager.available_sources();
    if !available.iter().any(|s| s == &source) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": format!("unknown source `{source}`"),
                "available": available,
            })),
        )
            .into_response();
    }
    let max_attempts = state.queue.config().default_max_attempts;
    let job_id = state
        .queue
        .enqueue(JOB_EXTRACT_SOURCE, json!({ "source": source }), max_attempts)
        .await;
    Json(json!({ "jobId": job_id, "status": "queued" })).into_response()
}

async fn queue_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.queue.stats().await).into_response()
}

async fn scheduler_status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.scheduler.status().await).into_response()
}

async fn scheduler_trigger_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    match state.scheduler.trigger(&name).await {
        Ok(()) => Json(json!({ "task": name, "status": "triggered" })).into_response(),
        Err(err) => scheduler_error(err),
    }
}

async fn scheduler_enable_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    set_enabled(state, name, true).await
}

async fn scheduler_disable_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    set_enabled(state, name, false).await
}

async fn set_enabled(state: Arc<AppState>, name: String, enabled: bool) -> Response {
    match state.scheduler.set_enabled(&name, enabled).await {
        Ok(()) => Json(json!({ "task": name, "enabled": enabled })).into_response(),
        Err(err) => scheduler_error(err),
    }
}

fn scheduler_error(err: SchedulerError) -> Response {
    match err {
        SchedulerError::UnknownTask(name) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown task `{name}`") })),
        )
            .into_response(),
        other => server_error(other.into()),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use jobfeed_engine::{
        register_default_handlers, register_default_tasks, EngineConfig, ManagerConfig,
        MemoryAuditSink, TaskQueueConfig, TASK_EXTRACT_ALL,
    };
    use jobfeed_extractors::testing::{job_card, listing_page, test_profile, ScriptedBrowser};
    use jobfeed_extractors::{Extractor, SourceExtractor};
    use jobfeed_storage::MemoryListingRepository;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.set_page(
            "https://scripted.test/alpha",
            listing_page(&[job_card(Some("Alpha Job"), "Org", "/a")], None),
        );
        let repository = Arc::new(MemoryListingRepository::new());
        let extractor: Arc<dyn SourceExtractor> = Arc::new(Extractor::new(
            test_profile("alpha", "https://scripted.test/alpha", 1),
            browser.clone(),
            repository.clone(),
        ));
        let manager = Arc::new(ExtractionManager::new(
            vec![extractor],
            Arc::new(MemoryAuditSink::new()),
            ManagerConfig {
                source_delay: Duration::ZERO,
                chunk_delay: Duration::ZERO,
            },
        ));
        let queue = Arc::new(TaskQueue::new(TaskQueueConfig::default()));
        register_default_handlers(&queue, manager.clone(), repository.clone(), 30).await;
        let scheduler = Arc::new(Scheduler::new());
        register_default_tasks(&scheduler, queue.clone(), &EngineConfig::default()).await;
        AppState {
            manager,
            queue,
            scheduler,
            repository,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(method: &str, uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn sources_endpoint_lists_registered_sources() {
        let app = app(test_state().await);
        let response = app.oneshot(request("GET", "/sources")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body, serde_json::json!(["alpha"]));
    }

    #[tokio::test]
    async fn extract_unknown_source_is_not_found_and_names_available() {
        let app = app(test_state().await);
        let response = app.oneshot(request("POST", "/extract/ghost")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("ghost"));
        assert_eq!(body["available"], serde_json::json!(["alpha"]));
    }

    #[tokio::test]
    async fn extract_source_enqueues_a_job() {
        let state = test_state().await;
        let queue = state.queue.clone();
        let app = app(state);

        let response = app.oneshot(request("POST", "/extract/alpha")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "queued");

        let stats = queue.stats().await;
        assert_eq!(stats.by_type.get(JOB_EXTRACT_SOURCE), Some(&1));
        assert_eq!(stats.by_status.get("pending"), Some(&1));
    }

    #[tokio::test]
    async fn queue_stats_and_healthz_respond() {
        let app = app(test_state().await);
        let response = app
            .clone()
            .oneshot(request("GET", "/queue/stats"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(request("GET", "/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn scheduler_trigger_and_toggle_round_trip() {
        let app = app(test_state().await);

        let response = app
            .clone()
            .oneshot(request("POST", &format!("/scheduler/{TASK_EXTRACT_ALL}/trigger")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(request("POST", &format!("/scheduler/{TASK_EXTRACT_ALL}/disable")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(request("GET", "/scheduler")).await.unwrap();
        let body = body_json(response).await;
        let task = body
            .as_array()
            .unwrap()
            .iter()
            .find(|t| t["name"] == TASK_EXTRACT_ALL)
            .unwrap();
        assert_eq!(task["enabled"], false);
        assert!(!task["last_run"].is_null());

        let response = app
            .oneshot(request("POST", "/scheduler/no-such-task/trigger"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
