use serde::{Deserialize, Serialize};

use crate::task::Task;

/// Requests a browser sends over its socket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    GetHistory,
    CreateTask { prompt: String },
}

/// Messages pushed to browsers.
///
/// `History` is a private reply; `NewTask` and `Update` go through the hub
/// to every connection. `Update` covers both the processing and the
/// finished transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    History(Vec<Task>),
    NewTask(Task),
    Update(Task),
}
