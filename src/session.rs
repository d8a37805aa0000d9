use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use crate::db::{StoreError, TaskStore};
use crate::events::{ClientMessage, ServerMessage};
use crate::hub::{BroadcastHub, Connection, ConnectionId, Payload};
use crate::AppState;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("connection closed")]
    Closed,
}

/// Protocol handler for one browser connection.
///
/// Registered with the hub for as long as it lives; dropping it unregisters.
pub struct ClientSession {
    conn: Connection,
    store: Arc<dyn TaskStore>,
    hub: BroadcastHub,
    wake: Arc<Notify>,
    history_limit: usize,
}

impl ClientSession {
    /// Register a new connection. The receiver carries every message for
    /// this connection, broadcast and private alike.
    pub fn open(state: &AppState) -> (Self, mpsc::UnboundedReceiver<Payload>) {
        let (conn, rx) = state.hub.register();
        tracing::info!(conn_id = conn.id(), "Client connected");
        let session = Self {
            conn,
            store: state.store.clone(),
            hub: state.hub.clone(),
            wake: state.wake.clone(),
            history_limit: state.history_limit,
        };
        (session, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    /// Whether the hub still delivers to this session.
    pub fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    /// Handle one inbound text frame. Errors are logged here and never
    /// reach the client.
    pub fn handle_text(&self, text: &str) {
        if let Err(e) = self.dispatch(text) {
            match e {
                SessionError::Malformed(_) => {
                    tracing::warn!(conn_id = self.id(), "Ignoring message: {}", e)
                }
                SessionError::Closed => {
                    tracing::debug!(conn_id = self.id(), "Dropping request on closed connection")
                }
                SessionError::Store(_) => {
                    tracing::error!(conn_id = self.id(), "Request failed: {}", e)
                }
            }
        }
    }

    fn dispatch(&self, text: &str) -> Result<(), SessionError> {
        if !self.conn.is_open() {
            return Err(SessionError::Closed);
        }
        match serde_json::from_str::<ClientMessage>(text)? {
            ClientMessage::GetHistory => self.send_history(),
            ClientMessage::CreateTask { prompt } => self.create_task(&prompt),
        }
    }

    fn send_history(&self) -> Result<(), SessionError> {
        let history = self.store.recent_history(self.history_limit)?;
        if self.conn.send_private(&ServerMessage::History(history)) {
            Ok(())
        } else {
            Err(SessionError::Closed)
        }
    }

    fn create_task(&self, prompt: &str) -> Result<(), SessionError> {
        let task = self.store.enqueue(prompt)?;
        tracing::info!(conn_id = self.id(), task_id = task.id, "Task queued");
        self.hub.publish(&ServerMessage::NewTask(task));
        self.wake.notify_one();
        Ok(())
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        tracing::info!(conn_id = self.conn.id(), "Client disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteTaskStore;
    use std::time::Duration;
    use tempfile::TempDir;

    fn state(dir: &TempDir) -> AppState {
        AppState {
            store: Arc::new(SqliteTaskStore::open(dir.path().join("queue.db")).unwrap()),
            hub: BroadcastHub::start(),
            wake: Arc::new(Notify::new()),
            history_limit: 2,
        }
    }

    #[tokio::test]
    async fn malformed_input_is_ignored() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let (session, mut rx) = ClientSession::open(&state);

        session.handle_text("not json");
        session.handle_text(r#"{"type":"delete_everything"}"#);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(state.hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn create_task_wakes_the_worker() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let (session, _rx) = ClientSession::open(&state);

        session.handle_text(r#"{"type":"create_task","prompt":"fox"}"#);

        // notify_one stores a permit, so this resolves immediately.
        tokio::time::timeout(Duration::from_secs(1), state.wake.notified())
            .await
            .expect("enqueue did not wake the worker");
    }

    #[tokio::test]
    async fn history_respects_the_limit() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        for prompt in ["a", "b", "c"] {
            state.store.enqueue(prompt).unwrap();
        }
        let (session, mut rx) = ClientSession::open(&state);

        session.handle_text(r#"{"type":"get_history"}"#);
        let payload = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        let prompts: Vec<_> = value["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["prompt"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(prompts, ["c", "b"]);
    }

    #[tokio::test]
    async fn closed_session_stops_accepting_tasks() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let (session, mut rx) = ClientSession::open(&state);
        state.hub.shutdown().await;

        session.handle_text(r#"{"type":"create_task","prompt":"late"}"#);
        assert!(!session.is_open());
        assert!(state.store.recent_history(10).unwrap().is_empty());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_a_session_unregisters_it() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let (session, _rx) = ClientSession::open(&state);
        assert_eq!(state.hub.connection_count(), 1);
        drop(session);
        assert_eq!(state.hub.connection_count(), 0);
    }
}
