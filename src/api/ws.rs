//! WebSocket session: translates client frames into manager commands and
//! relays subscribed event streams back.
//!
//! Each connection owns a writer task fed by an mpsc channel plus one
//! forwarder task per subscribed task. Forwarders replay history from the
//! requested sequence number, then follow the live broadcast, de-duplicating
//! on `seq` across the replay/live seam.

use super::types::{ClientMessage, ServerMessage};
use super::AppState;
use crate::error::ErrorKind;
use crate::llm::Role;
use crate::task::{ResumeDecision, ResumeInput, TaskError};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);

    // Writer task: everything the session says goes through one channel so
    // forwarders and the command loop never interleave partial frames.
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    // Greet with the current task list.
    send_task_list(&state, &out_tx).await;

    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let parsed: Result<ClientMessage, _> = serde_json::from_str(&text);
        match parsed {
            Ok(msg) => handle_message(&state, &out_tx, &mut forwarders, msg).await,
            Err(e) => {
                send(
                    &out_tx,
                    ServerMessage::Error {
                        error: ErrorKind::InvalidArguments,
                        detail: format!("unparseable frame: {e}"),
                        task_id: None,
                    },
                )
                .await;
            }
        }
    }

    for (_, handle) in forwarders {
        handle.abort();
    }
    writer.abort();
}

async fn handle_message(
    state: &AppState,
    out: &mpsc::Sender<String>,
    forwarders: &mut HashMap<String, JoinHandle<()>>,
    msg: ClientMessage,
) {
    match msg {
        ClientMessage::TaskCreate { task_id, name } => {
            match state.manager.create_task(task_id, name) {
                Ok(record) => {
                    send_ack(out, "task_create", Some(record.id.clone())).await;
                    send_task_list(state, out).await;
                }
                Err(e) => send_task_error(out, "task_create", None, &e).await,
            }
        }

        ClientMessage::TaskDelete { task_id } => {
            if let Some(handle) = forwarders.remove(&task_id) {
                handle.abort();
            }
            match state.manager.delete_task(&task_id).await {
                Ok(()) => {
                    send_ack(out, "task_delete", Some(task_id)).await;
                    send_task_list(state, out).await;
                }
                Err(e) => send_task_error(out, "task_delete", Some(task_id), &e).await,
            }
        }

        ClientMessage::TaskRename { task_id, name } => {
            match state.manager.rename_task(&task_id, &name) {
                Ok(()) => {
                    send_ack(out, "task_rename", Some(task_id)).await;
                    send_task_list(state, out).await;
                }
                Err(e) => send_task_error(out, "task_rename", Some(task_id), &e).await,
            }
        }

        ClientMessage::RunAgent {
            task_id,
            prompt,
            llm_config,
            enabled_tools,
        } => {
            let mut role_models = HashMap::new();
            for (label, model_id) in llm_config {
                let Some(role) = Role::parse(&label) else {
                    send(
                        out,
                        ServerMessage::Error {
                            error: ErrorKind::InvalidArguments,
                            detail: format!("unknown role label '{label}' in llm_config"),
                            task_id: Some(task_id),
                        },
                    )
                    .await;
                    return;
                };
                role_models.insert(role, model_id);
            }

            // Running a task implies wanting its events.
            ensure_subscribed(state, out, forwarders, &task_id, None).await;

            match state
                .manager
                .run_agent(&task_id, &prompt, role_models, enabled_tools)
                .await
            {
                Ok(()) => send_ack(out, "run_agent", Some(task_id)).await,
                Err(e) => send_task_error(out, "run_agent", Some(task_id), &e).await,
            }
        }

        ClientMessage::Resume {
            task_id,
            decision,
            modified_plan,
            feedback,
        } => {
            let decision = match decision.as_str() {
                "approve" => ResumeDecision::Approve,
                "reject" => ResumeDecision::Reject,
                "modify" => ResumeDecision::Modify,
                other => {
                    send(
                        out,
                        ServerMessage::Error {
                            error: ErrorKind::InvalidArguments,
                            detail: format!("unknown resume decision '{other}'"),
                            task_id: Some(task_id),
                        },
                    )
                    .await;
                    return;
                }
            };
            let input = ResumeInput {
                decision,
                modified_plan,
                feedback,
            };
            match state.manager.resume(&task_id, input).await {
                Ok(()) => send_ack(out, "resume", Some(task_id)).await,
                Err(e) => send_task_error(out, "resume", Some(task_id), &e).await,
            }
        }

        ClientMessage::Stop { task_id } => match state.manager.stop(&task_id).await {
            Ok(()) => send_ack(out, "stop", Some(task_id)).await,
            Err(e) => send_task_error(out, "stop", Some(task_id), &e).await,
        },

        ClientMessage::Subscribe { task_id, from_seq } => {
            ensure_subscribed(state, out, forwarders, &task_id, from_seq).await;
            send_ack(out, "subscribe", Some(task_id)).await;
        }
    }
}

/// Spawn (or replace) the forwarder for a task.
async fn ensure_subscribed(
    state: &AppState,
    out: &mpsc::Sender<String>,
    forwarders: &mut HashMap<String, JoinHandle<()>>,
    task_id: &str,
    from_seq: Option<i64>,
) {
    // An explicit subscribe restarts the stream from the requested point;
    // an implicit one (run_agent) keeps an existing forwarder.
    if from_seq.is_none() && forwarders.contains_key(task_id) {
        return;
    }
    if let Some(previous) = forwarders.remove(task_id) {
        previous.abort();
    }

    let handle = tokio::spawn(forward_events(
        state.clone(),
        out.clone(),
        task_id.to_string(),
        from_seq.unwrap_or(1),
    ));
    forwarders.insert(task_id.to_string(), handle);
}

async fn forward_events(
    state: AppState,
    out: mpsc::Sender<String>,
    task_id: String,
    from_seq: i64,
) {
    let mut next_seq = from_seq.max(1);

    loop {
        let (history, mut rx) = match state.manager.bus().subscribe(&task_id, next_seq).await {
            Ok(pair) => pair,
            Err(e) => {
                send(
                    &out,
                    ServerMessage::Error {
                        error: ErrorKind::TaskNotFound,
                        detail: e.to_string(),
                        task_id: Some(task_id.clone()),
                    },
                )
                .await;
                return;
            }
        };

        for event in history {
            if event.seq < next_seq {
                continue;
            }
            next_seq = event.seq + 1;
            if send(&out, ServerMessage::Event { event }).await.is_err() {
                return;
            }
        }

        loop {
            match rx.recv().await {
                Ok(event) => {
                    // The live stream overlaps the history read; skip
                    // anything already delivered.
                    if event.seq < next_seq {
                        continue;
                    }
                    next_seq = event.seq + 1;
                    if send(&out, ServerMessage::Event { event }).await.is_err() {
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        task_id = %task_id,
                        skipped,
                        "subscriber lagged; replaying from the store"
                    );
                    break; // outer loop re-subscribes from next_seq
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

async fn send(
    out: &mpsc::Sender<String>,
    msg: ServerMessage,
) -> Result<(), mpsc::error::SendError<String>> {
    out.send(msg.to_frame()).await
}

async fn send_ack(out: &mpsc::Sender<String>, request: &str, task_id: Option<String>) {
    let _ = send(
        out,
        ServerMessage::Ack {
            request: request.to_string(),
            task_id,
        },
    )
    .await;
}

async fn send_task_error(
    out: &mpsc::Sender<String>,
    request: &str,
    task_id: Option<String>,
    e: &TaskError,
) {
    tracing::debug!(request, error = %e, "command rejected");
    let _ = send(
        out,
        ServerMessage::Error {
            error: e.kind,
            detail: e.detail.clone(),
            task_id,
        },
    )
    .await;
}

async fn send_task_list(state: &AppState, out: &mpsc::Sender<String>) {
    match state.manager.list_tasks() {
        Ok(tasks) => {
            let _ = send(out, ServerMessage::TaskList { tasks }).await;
        }
        Err(e) => {
            let _ = send(
                out,
                ServerMessage::Error {
                    error: e.kind,
                    detail: e.detail,
                    task_id: None,
                },
            )
            .await;
        }
    }
}
