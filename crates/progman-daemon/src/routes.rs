//! HTTP routes exposing the supervisor.
//!
//! The route set mirrors the supervisor's operations one-to-one: status
//! snapshot, start/stop, log snapshot (optionally filtered by a `since`
//! timestamp), an SSE live stream, and log clearing. Control operations
//! answer 400 when the supervisor refuses; the refusal details are in the
//! program's log buffer and the daemon log.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use chrono::{Local, NaiveDateTime};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;

use progman_core::logbuf::TIMESTAMP_FORMAT;
use progman_core::Supervisor;

/// Build the API router over a shared supervisor.
pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/api/programs/status", get(programs_status))
        .route("/api/programs/{id}/start", post(start_program))
        .route("/api/programs/{id}/stop", post(stop_program))
        .route("/api/programs/{id}/logs", get(program_logs))
        .route("/api/programs/{id}/logs/stream", get(stream_logs))
        .route("/api/programs/{id}/clear_logs", post(clear_logs))
        .with_state(supervisor)
}

async fn programs_status(State(supervisor): State<Arc<Supervisor>>) -> impl IntoResponse {
    Json(supervisor.status_snapshot().await)
}

async fn start_program(
    State(supervisor): State<Arc<Supervisor>>,
    Path(id): Path<u32>,
) -> impl IntoResponse {
    if supervisor.start(id).await {
        control_response(StatusCode::OK, format!("program {id} started"))
    } else {
        control_response(
            StatusCode::BAD_REQUEST,
            format!("failed to start program {id}"),
        )
    }
}

async fn stop_program(
    State(supervisor): State<Arc<Supervisor>>,
    Path(id): Path<u32>,
) -> impl IntoResponse {
    if supervisor.stop(id).await {
        control_response(StatusCode::OK, format!("program {id} stopped"))
    } else {
        control_response(
            StatusCode::BAD_REQUEST,
            format!("failed to stop program {id}"),
        )
    }
}

async fn clear_logs(
    State(supervisor): State<Arc<Supervisor>>,
    Path(id): Path<u32>,
) -> impl IntoResponse {
    if supervisor.clear_logs(id).await {
        control_response(StatusCode::OK, format!("logs cleared for program {id}"))
    } else {
        control_response(
            StatusCode::BAD_REQUEST,
            format!("failed to clear logs for program {id}"),
        )
    }
}

fn control_response(code: StatusCode, message: String) -> (StatusCode, Json<serde_json::Value>) {
    let status = if code == StatusCode::OK { "success" } else { "error" };
    (code, Json(json!({ "status": status, "message": message })))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    since: Option<String>,
}

async fn program_logs(
    State(supervisor): State<Arc<Supervisor>>,
    Path(id): Path<u32>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let since = query.since.as_deref().and_then(parse_since);
    let logs = match since {
        Some(since) => supervisor.logs_since(id, since).await,
        // Absent or malformed `since` falls back to the full snapshot.
        None => supervisor.logs(id).await,
    };
    Json(json!({
        "logs": logs,
        "timestamp": Local::now().format(TIMESTAMP_FORMAT).to_string(),
    }))
}

/// Accept the log-line timestamp format and its `T`-separated variant.
fn parse_since(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}

/// Server-sent events: backlog replay followed by live lines, one `data:`
/// event per log line, until the client disconnects or the supervisor shuts
/// down.
async fn stream_logs(
    State(supervisor): State<Arc<Supervisor>>,
    Path(id): Path<u32>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let stream = supervisor.stream(id).await.ok_or(StatusCode::NOT_FOUND)?;
    let events = futures::stream::unfold(stream, |mut stream| async move {
        stream
            .next_line()
            .await
            .map(|line| (Ok(Event::default().data(line)), stream))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use progman_core::{ManagerConfig, Program, SupervisorConfig};
    use tower::ServiceExt;

    use super::*;

    fn test_router() -> Router {
        let config = ManagerConfig {
            supervisor: SupervisorConfig::default(),
            programs: vec![Program {
                id: 1,
                name: "demo".into(),
                dir: "/".into(),
                command: "/bin/sh".into(),
                args: vec!["-c".into(), "echo hello".into()],
            }],
        };
        router(Arc::new(Supervisor::new(config)))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_status_lists_configured_programs() {
        let app = test_router();
        let response = app
            .oneshot(
                Request::get("/api/programs/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["1"]["name"], "demo");
        assert_eq!(body["1"]["status"], "stopped");
        assert!(body["1"]["pid"].is_null());
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_start_unknown_program_is_bad_request() {
        let app = test_router();
        let response = app
            .oneshot(
                Request::post("/api/programs/99/start")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_stop_never_started_is_ok() {
        let app = test_router();
        let response = app
            .oneshot(
                Request::post("/api/programs/1/stop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_logs_unknown_program_is_empty() {
        let app = test_router();
        let response = app
            .oneshot(
                Request::get("/api/programs/99/logs")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["logs"], serde_json::json!([]));
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_logs_since_malformed_falls_back_to_full() {
        let app = test_router();
        let response = app
            .oneshot(
                Request::get("/api/programs/1/logs?since=not-a-timestamp")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_clear_logs_round_trip() {
        let config = ManagerConfig {
            supervisor: SupervisorConfig::default(),
            programs: vec![Program {
                id: 1,
                name: "demo".into(),
                dir: "/".into(),
                command: "/bin/sh".into(),
                args: vec![],
            }],
        };
        let supervisor = Arc::new(Supervisor::new(config));
        let app = router(Arc::clone(&supervisor));

        let response = app
            .oneshot(
                Request::post("/api/programs/1/clear_logs")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let logs = supervisor.logs(1).await;
        assert_eq!(logs.len(), 1);
        assert!(logs[0].contains("logs cleared"));
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_stream_unknown_program_is_not_found() {
        let app = test_router();
        let response = app
            .oneshot(
                Request::get("/api/programs/99/logs/stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_stream_known_program_is_event_stream() {
        let app = test_router();
        let response = app
            .oneshot(
                Request::get("/api/programs/1/logs/stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap();
        assert!(content_type.starts_with("text/event-stream"));
    }

    #[test]
    fn test_parse_since_formats() {
        assert!(parse_since("2024-06-01 12:00:00").is_some());
        assert!(parse_since("2024-06-01T12:00:00").is_some());
        assert!(parse_since("noon-ish").is_none());
    }
}
