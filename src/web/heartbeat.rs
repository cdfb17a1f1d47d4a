use axum::{
    Json, Router,
    extract::{Path, State},
    routing::post,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::monitoring::coordinator::HeartbeatOutcome;
use crate::web::{AppError, AppState};

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
    pub monitor_id: i32,
}

pub fn heartbeat_router() -> Router<Arc<AppState>> {
    // GET is accepted for senders that can only issue simple requests.
    Router::new().route("/heartbeat/{key}", post(receive_heartbeat).get(receive_heartbeat))
}

async fn receive_heartbeat(
    State(app_state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<HeartbeatResponse>, AppError> {
    let outcome = app_state.coordinator.run_heartbeat(&key).await?;
    match outcome {
        HeartbeatOutcome::Accepted { monitor_id } => {
            debug!(monitor_id, "Heartbeat accepted.");
            Ok(Json(HeartbeatResponse { ok: true, monitor_id }))
        }
        HeartbeatOutcome::UnknownKey => Err(AppError::NotFound("Unknown heartbeat key".to_string())),
        HeartbeatOutcome::Inactive => Err(AppError::Conflict("Monitor is disabled or paused".to_string())),
        HeartbeatOutcome::Busy => Err(AppError::Conflict("Monitor is being checked; retry later".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::incident_service::IncidentService;
    use crate::alerting::incident_service::test_support::RecordingNotifier;
    use crate::db::enums::MonitorStatus;
    use crate::db::memory::{MemoryCheckHistoryStore, MemoryIncidentStore, MemoryMonitorStore};
    use crate::db::models::{MonitorConfig, NewMonitor, PushConfig};
    use crate::db::repository::MonitorStore;
    use crate::monitoring::coordinator::CheckCoordinator;
    use crate::monitoring::coordinator::test_support::{FixedValidator, RecordingScheduler, ScriptedProbe};
    use crate::monitoring::lock::LocalLockMap;
    use crate::web::create_axum_router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct Fixture {
        monitors: Arc<MemoryMonitorStore>,
        locks: LocalLockMap,
        router: Router,
    }

    fn fixture() -> Fixture {
        let monitors = Arc::new(MemoryMonitorStore::new());
        let history = Arc::new(MemoryCheckHistoryStore::new());
        let locks = LocalLockMap::new();
        let incidents = Arc::new(IncidentService::new(
            monitors.clone(),
            Arc::new(MemoryIncidentStore::new()),
            history.clone(),
            Arc::new(RecordingNotifier::default()),
        ));
        let coordinator = Arc::new(CheckCoordinator::new(
            monitors.clone(),
            history,
            Arc::new(ScriptedProbe::up()),
            Arc::new(FixedValidator(None)),
            Arc::new(locks.clone()),
            incidents,
            Arc::new(RecordingScheduler::default()),
        ));
        Fixture {
            monitors,
            locks,
            router: create_axum_router(coordinator),
        }
    }

    async fn push_monitor(f: &Fixture) -> (i32, String) {
        let monitor = f
            .monitors
            .create(NewMonitor::new("nightly-backup", "", MonitorConfig::Push(PushConfig {})))
            .await
            .unwrap();
        (monitor.id, monitor.push_token.unwrap())
    }

    async fn post(router: &Router, path: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .clone()
            .oneshot(Request::builder().method("POST").uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn test_health() {
        let f = fixture();
        let response = f
            .router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"OK");
    }

    #[tokio::test]
    async fn test_heartbeat_accepted() {
        let f = fixture();
        let (id, token) = push_monitor(&f).await;

        let (status, body) = post(&f.router, &format!("/heartbeat/{token}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["monitor_id"], id);

        let stored = f.monitors.get(id).await.unwrap().unwrap();
        assert_eq!(stored.last_status, MonitorStatus::Up);
        assert!(stored.last_heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_key_is_not_found() {
        let f = fixture();
        let (status, body) = post(&f.router, "/heartbeat/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_inactive_or_busy_is_conflict() {
        let f = fixture();
        let (id, token) = push_monitor(&f).await;

        let guard = f.locks.try_lock(id).unwrap();
        let (status, _) = post(&f.router, &format!("/heartbeat/{token}")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        guard.release().await;

        f.monitors.set_enabled(id, false).await.unwrap();
        let (status, _) = post(&f.router, &format!("/heartbeat/{token}")).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
