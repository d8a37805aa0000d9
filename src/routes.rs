use std::path::Path;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path as UrlPath, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::session::ClientSession;
use crate::task::{Task, TaskId};
use crate::AppState;

pub fn router(state: AppState, document_root: impl AsRef<Path>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/:id", get(get_task))
        .fallback_service(ServeDir::new(document_root))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn list_tasks(State(state): State<AppState>) -> Result<Json<Vec<Task>>, StatusCode> {
    match state.store.recent_history(state.history_limit) {
        Ok(tasks) => Ok(Json(tasks)),
        Err(e) => {
            tracing::error!("Failed to list tasks: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn get_task(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<TaskId>,
) -> Result<Json<Task>, StatusCode> {
    match state.store.get_task(id) {
        Ok(Some(task)) => Ok(Json(task)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(task_id = id, "Failed to get task: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one browser connection until either direction fails.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (session, mut outbox) = ClientSession::open(&state);
    let conn_id = session.id();
    let (mut sink, mut stream) = socket.split();

    // Writer: a failed write drops `outbox`, so the hub prunes this
    // connection on its next delivery.
    let mut send_task = tokio::spawn(async move {
        while let Some(payload) = outbox.recv().await {
            if sink.send(Message::Text(payload.to_string())).await.is_err() {
                tracing::debug!(conn_id, "WebSocket sink closed");
                break;
            }
        }
    });

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => session.handle_text(&text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(conn_id, error = %e, "WebSocket receive error");
                    break;
                }
            },
            _ = &mut send_task => break,
        }
    }

    send_task.abort();
    drop(session);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{SqliteTaskStore, TaskStore};
    use crate::hub::BroadcastHub;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    fn app(dir: &TempDir) -> (Arc<SqliteTaskStore>, Router) {
        let store = Arc::new(SqliteTaskStore::open(dir.path().join("queue.db")).unwrap());
        let www = dir.path().join("www");
        std::fs::create_dir_all(&www).unwrap();
        std::fs::write(www.join("index.html"), "<h1>queue</h1>").unwrap();

        let state = AppState {
            store: store.clone(),
            hub: BroadcastHub::start(),
            wake: Arc::new(Notify::new()),
            history_limit: 20,
        };
        (store, router(state, www))
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let dir = TempDir::new().unwrap();
        let (_store, app) = app(&dir);
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "OK");
    }

    #[tokio::test]
    async fn task_lookup_and_listing() {
        let dir = TempDir::new().unwrap();
        let (store, app) = app(&dir);
        let task = store.enqueue("lighthouse at dusk").unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/api/tasks/{}", task.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(value["prompt"], "lighthouse at dusk");
        assert_eq!(value["status"], "Pending");

        let response = app
            .clone()
            .oneshot(Request::get("/api/tasks/999").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(Request::get("/api/tasks").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_paths_fall_back_to_static_files() {
        let dir = TempDir::new().unwrap();
        let (_store, app) = app(&dir);
        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("queue"));
    }
}
