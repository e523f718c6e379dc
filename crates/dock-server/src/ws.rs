use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use dock_core::{AdmitError, SessionError};
use dock_types::{
    AgentKind, CommandEnvelope, CommandKind, ErrorCode, PROTOCOL_VERSION,
};
use dock_workspace::{validate_workdir, GitVerb, PullRequestOptions, WorktreeInfo};

use crate::codec::MessageCodec;
use crate::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_GRACE: Duration = Duration::from_secs(90);

pub fn router(state: AppState) -> Router {
    Router::new().route("/", get(upgrade)).with_state(state)
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    ws.on_upgrade(move |socket| client_connection(socket, state, origin))
}

struct ConnCtx {
    session_id: Arc<RwLock<Option<String>>>,
    token: Option<String>,
    workdir: Option<PathBuf>,
    agent_kind: Option<AgentKind>,
    worktrees: Vec<WorktreeInfo>,
    signature_failures: u32,
}

/// One task pair per client: this reader task plus a writer task that is the
/// single serialisation point for everything outbound (replies, bus events,
/// pings).
async fn client_connection(socket: WebSocket, state: AppState, origin: Option<String>) {
    let (mut sink, mut stream) = socket.split();

    // The origin check is unconditional; a missing or unknown origin is
    // closed with the policy-violation code before any state is touched.
    let allowed = origin
        .as_deref()
        .map(|o| state.config.origin_allowed(o))
        .unwrap_or(false);
    if !allowed {
        warn!(origin = origin.as_deref().unwrap_or("<none>"), "origin rejected");
        let _ = sink
            .send(WsMessage::Close(Some(CloseFrame {
                code: 1008,
                reason: "Origin not allowed".into(),
            })))
            .await;
        return;
    }

    let connection_id = Uuid::new_v4().to_string();
    info!(%connection_id, "client connected");

    let (out_tx, mut out_rx) = mpsc::channel::<Value>(256);
    let last_pong = Arc::new(Mutex::new(tokio::time::Instant::now()));

    let writer_pong = last_pong.clone();
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                outbound = out_rx.recv() => {
                    let Some(outbound) = outbound else { break };
                    if sink
                        .send(WsMessage::Text(outbound.to_string().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if writer_pong.lock().await.elapsed() > PONG_GRACE {
                        debug!("peer unresponsive; closing");
                        break;
                    }
                    if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut conn = ConnCtx {
        session_id: Arc::new(RwLock::new(None)),
        token: None,
        workdir: None,
        agent_kind: None,
        worktrees: Vec::new(),
        signature_failures: 0,
    };

    let _ = out_tx
        .send(json!({"type": "connected", "version": PROTOCOL_VERSION}))
        .await;

    // Bus consumer: forwards this session's events in emission order.
    let bus_session = conn.session_id.clone();
    let bus_tx = out_tx.clone();
    let mut bus_rx = state.bus.subscribe();
    let bus_task = tokio::spawn(async move {
        loop {
            match bus_rx.recv().await {
                Ok(event) => {
                    let matches = bus_session
                        .read()
                        .await
                        .as_deref()
                        .map(|id| id == event.session_id)
                        .unwrap_or(false);
                    if !matches {
                        continue;
                    }
                    if bus_tx.send(event.to_wire()).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event consumer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(incoming) = stream.next().await {
        match incoming {
            Ok(WsMessage::Text(raw)) => {
                let replies = handle_message(&state, &mut conn, raw.as_str(), &out_tx).await;
                let mut closed = false;
                for reply in replies {
                    if out_tx.send(reply).await.is_err() {
                        closed = true;
                        break;
                    }
                }
                if closed {
                    break;
                }
            }
            Ok(WsMessage::Pong(_)) => {
                *last_pong.lock().await = tokio::time::Instant::now();
            }
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    bus_task.abort();
    writer.abort();

    // Owned subprocesses die with the connection; the session itself lives
    // on until its own expiry so a reconnect can resume it.
    let session_id = conn.session_id.read().await.clone();
    if let Some(session_id) = session_id {
        state.coordinator.cancel_session(&session_id).await;
    }
    info!(%connection_id, "client disconnected");
}

fn error_reply(code: ErrorCode, message: impl Into<String>, id: Option<String>) -> Value {
    let mut value = json!({
        "type": "error",
        "error": message.into(),
        "code": code.as_str(),
    });
    if let Some(id) = id {
        value["id"] = json!(id);
    }
    value
}

async fn handle_message(
    state: &AppState,
    conn: &mut ConnCtx,
    raw: &str,
    out_tx: &mpsc::Sender<Value>,
) -> Vec<Value> {
    let fallback_id = serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(String::from));

    let (envelope, kind) = match state.codec.parse(raw) {
        Ok(parsed) => parsed,
        Err(error) => return vec![error_reply(error.code(), error.to_string(), fallback_id)],
    };

    match kind {
        CommandKind::Pair => handle_pair(state, conn, envelope).await,
        CommandKind::Authenticate => handle_authenticate(state, conn, envelope).await,
        CommandKind::HealthCheck => handle_health_check(state, conn, envelope).await,
        kind => handle_session_command(state, conn, envelope, kind, out_tx).await,
    }
}

async fn handle_pair(state: &AppState, conn: &mut ConnCtx, envelope: CommandEnvelope) -> Vec<Value> {
    let data = envelope.data_or_empty();
    let (Some(code), Some(client_key)) = (
        data.get("code").and_then(Value::as_str),
        data.get("clientPublicKey").and_then(Value::as_str),
    ) else {
        return vec![error_reply(
            ErrorCode::InvalidMessageFormat,
            "pair requires code and clientPublicKey",
            Some(envelope.id),
        )];
    };

    // The presented key is the signing key for this one message.
    if MessageCodec::verify_signature(&envelope, client_key).is_err() {
        return vec![error_reply(
            ErrorCode::InvalidSignature,
            "signature verification failed",
            Some(envelope.id),
        )];
    }

    let Some(redemption) = state.pairing.redeem(code, client_key).await else {
        return vec![error_reply(
            ErrorCode::NotAuthenticated,
            "Invalid or expired pairing code",
            Some(envelope.id),
        )];
    };

    let session = state.sessions.create(redemption).await;
    *conn.session_id.write().await = Some(session.id.clone());
    conn.token = Some(session.token.clone());

    vec![json!({
        "type": "pairing-success",
        "id": envelope.id,
        "sessionId": session.id,
        "token": session.token,
        "bridgePublicKey": state.identity.public_key_pem(),
        "expiresAt": session.expires_at.to_rfc3339(),
    })]
}

async fn handle_authenticate(
    state: &AppState,
    conn: &mut ConnCtx,
    envelope: CommandEnvelope,
) -> Vec<Value> {
    let data = envelope.data_or_empty();
    let Some(token) = data.get("token").and_then(Value::as_str) else {
        return vec![error_reply(
            ErrorCode::InvalidMessageFormat,
            "authenticate requires token",
            Some(envelope.id),
        )];
    };

    let auth_failed = |reason: &str| {
        vec![json!({
            "type": "auth-failed",
            "id": envelope.id,
            "reason": reason,
        })]
    };

    // Key selection: the key recorded in the session the token names.
    let peek = match state.sessions.peek_by_token(token).await {
        Ok(peek) => peek,
        Err(SessionError::Expired) => return auth_failed("session expired"),
        Err(SessionError::NotAuthenticated) => return auth_failed("invalid token"),
    };
    if MessageCodec::verify_signature(&envelope, &peek.client_public_key).is_err() {
        state
            .audit
            .append(
                "signature_verification_failed",
                json!({"sessionId": peek.id, "command": "authenticate"}),
            )
            .await;
        return auth_failed("signature verification failed");
    }

    let resolved = match state.sessions.resolve_by_token(token).await {
        Ok(resolved) => resolved,
        Err(SessionError::Expired) => return auth_failed("session expired"),
        Err(SessionError::NotAuthenticated) => return auth_failed("invalid token"),
    };

    *conn.session_id.write().await = Some(resolved.id.clone());
    conn.token = Some(resolved.token.clone());

    let agents = state.coordinator.supervisor().catalog().list_installed().await;
    vec![
        json!({
            "type": "auth-success",
            "id": envelope.id,
            "sessionId": resolved.id,
            // Always the latest token, rotated or not.
            "token": resolved.token,
        }),
        json!({"type": "agents-available", "agents": agents}),
    ]
}

async fn handle_health_check(
    state: &AppState,
    conn: &mut ConnCtx,
    envelope: CommandEnvelope,
) -> Vec<Value> {
    // Health checks from an authenticated session still count against its
    // rate budget and replay cache.
    let session_id = conn.session_id.read().await.clone();
    if let Some(session_id) = session_id {
        if let Err(error) = state
            .sessions
            .admit_command(&session_id, &envelope.id, &envelope.data_or_empty())
            .await
        {
            return vec![admit_error_reply(error, envelope.id)];
        }
    }
    vec![json!({
        "type": "health-check",
        "id": envelope.id,
        "status": "ok",
        "ts": Utc::now().to_rfc3339(),
    })]
}

fn admit_error_reply(error: AdmitError, id: String) -> Value {
    match error {
        AdmitError::RateLimited { retry_after_secs } => {
            let mut value = error_reply(
                ErrorCode::RateLimitExceeded,
                format!("rate limit exceeded; retry in {retry_after_secs}s"),
                Some(id),
            );
            value["retryAfterSeconds"] = json!(retry_after_secs);
            value
        }
        AdmitError::Replay => error_reply(ErrorCode::ReplayDetected, "replayed command", Some(id)),
        AdmitError::UnknownSession => {
            error_reply(ErrorCode::NotAuthenticated, "unknown session", Some(id))
        }
    }
}

async fn handle_session_command(
    state: &AppState,
    conn: &mut ConnCtx,
    envelope: CommandEnvelope,
    kind: CommandKind,
    out_tx: &mpsc::Sender<Value>,
) -> Vec<Value> {
    let Some(token) = conn.token.clone() else {
        return vec![error_reply(
            ErrorCode::NotAuthenticated,
            "authenticate first",
            Some(envelope.id),
        )];
    };

    // Refresh the session; this slides the window and may rotate the token.
    let resolved = match state.sessions.resolve_by_token(&token).await {
        Ok(resolved) => resolved,
        Err(SessionError::Expired) => {
            *conn.session_id.write().await = None;
            conn.token = None;
            return vec![error_reply(
                ErrorCode::SessionExpired,
                "session expired",
                Some(envelope.id),
            )];
        }
        Err(SessionError::NotAuthenticated) => {
            *conn.session_id.write().await = None;
            conn.token = None;
            return vec![error_reply(
                ErrorCode::NotAuthenticated,
                "session no longer valid",
                Some(envelope.id),
            )];
        }
    };

    let mut replies = Vec::new();
    if resolved.rotated {
        conn.token = Some(resolved.token.clone());
        // The rotated token is always relayed before the command's own
        // response.
        replies.push(json!({
            "type": "token-refreshed",
            "token": resolved.token,
            "expiresAt": resolved.expires_at.to_rfc3339(),
        }));
    }

    if MessageCodec::verify_signature(&envelope, &resolved.client_public_key).is_err() {
        conn.signature_failures += 1;
        if conn.signature_failures >= 3 {
            state
                .audit
                .append(
                    "signature_verification_failed",
                    json!({"sessionId": resolved.id, "failures": conn.signature_failures}),
                )
                .await;
        }
        replies.push(error_reply(
            ErrorCode::InvalidSignature,
            "signature verification failed",
            Some(envelope.id),
        ));
        return replies;
    }
    conn.signature_failures = 0;

    if let Err(error) = state
        .sessions
        .admit_command(&resolved.id, &envelope.id, &envelope.data_or_empty())
        .await
    {
        replies.push(admit_error_reply(error, envelope.id));
        return replies;
    }

    let session_id = resolved.id.clone();
    let outcome = dispatch(state, conn, &session_id, &envelope, kind, out_tx).await;
    match outcome {
        Ok(mut direct) => replies.append(&mut direct),
        Err(reply) => replies.push(reply),
    }
    replies
}

/// Per-type handlers. Long-running work is spawned so the connection loop
/// keeps pumping streamed events; results and errors arrive as events.
async fn dispatch(
    state: &AppState,
    conn: &mut ConnCtx,
    session_id: &str,
    envelope: &CommandEnvelope,
    kind: CommandKind,
    out_tx: &mpsc::Sender<Value>,
) -> Result<Vec<Value>, Value> {
    let data = envelope.data_or_empty();
    let id = envelope.id.clone();
    let invalid =
        |message: &str, id: &str| error_reply(ErrorCode::InvalidMessageFormat, message, Some(id.to_string()));

    match kind {
        CommandKind::InitSession => {
            let workdir = data
                .get("workdir")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("init-session requires workdir", &id))?;
            let workdir = PathBuf::from(workdir);
            validate_workdir(&workdir)
                .map_err(|error| error_reply(error.code(), error.to_string(), Some(id.clone())))?;
            if let Some(agent) = data.get("agentType").and_then(Value::as_str) {
                conn.agent_kind = Some(
                    AgentKind::parse(agent).ok_or_else(|| invalid("unknown agentType", &id))?,
                );
            }
            conn.workdir = Some(workdir.clone());
            let status = state.coordinator.workspace().status(&workdir).await.ok();
            Ok(vec![json!({
                "type": "git-status",
                "id": id,
                "workdir": workdir.to_string_lossy(),
                "status": status,
            })])
        }
        CommandKind::StartAgentSession => {
            let agents = state.coordinator.supervisor().catalog().list_installed().await;
            Ok(vec![json!({"type": "agents-available", "id": id, "agents": agents})])
        }
        CommandKind::GitStatus => {
            let workdir = data
                .get("workdir")
                .and_then(Value::as_str)
                .map(PathBuf::from)
                .or_else(|| conn.workdir.clone())
                .ok_or_else(|| invalid("git-status requires workdir", &id))?;
            let status = state
                .coordinator
                .workspace()
                .status(&workdir)
                .await
                .map_err(|error| error_reply(error.code(), error.to_string(), Some(id.clone())))?;
            Ok(vec![json!({
                "type": "git-status",
                "id": id,
                "workdir": workdir.to_string_lossy(),
                "status": status,
            })])
        }
        CommandKind::GitCommand => {
            let verb = data
                .get("command")
                .and_then(Value::as_str)
                .and_then(GitVerb::parse)
                .ok_or_else(|| invalid("unsupported git command", &id))?;
            let workdir = data
                .get("workdir")
                .and_then(Value::as_str)
                .map(PathBuf::from)
                .or_else(|| conn.workdir.clone())
                .ok_or_else(|| invalid("git-command requires workdir", &id))?;
            let args: Vec<String> = data
                .get("args")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            state
                .coordinator
                .workspace()
                .git_command(&workdir, verb, &args)
                .await
                .map_err(|error| error_reply(error.code(), error.to_string(), Some(id.clone())))?;
            let status = state.coordinator.workspace().status(&workdir).await.ok();
            Ok(vec![json!({
                "type": "git-status",
                "id": id,
                "workdir": workdir.to_string_lossy(),
                "status": status,
            })])
        }
        CommandKind::CreateWorktree => {
            let workdir = conn
                .workdir
                .clone()
                .ok_or_else(|| invalid("init-session before create-worktree", &id))?;
            let base = data
                .get("baseBranch")
                .and_then(Value::as_str)
                .unwrap_or("HEAD")
                .to_string();
            let metadata = std::collections::HashMap::from([(
                "sessionId".to_string(),
                json!(session_id),
            )]);
            let info = state
                .coordinator
                .workspace()
                .create_worktree(&workdir, &base, &metadata)
                .await
                .map_err(|error| error_reply(error.code(), error.to_string(), Some(id.clone())))?;
            conn.worktrees.push(info.clone());
            state.bus.publish(dock_types::SessionEvent::new(
                session_id,
                dock_types::BridgeEvent::WorktreeCreated {
                    path: info.path,
                    branch: info.branch,
                    base_branch: base,
                },
            ));
            Ok(Vec::new())
        }
        CommandKind::CleanupWorktree => {
            let execution_id = data
                .get("executionId")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("cleanup-worktree requires executionId", &id))?;
            let workdir = conn
                .workdir
                .clone()
                .ok_or_else(|| invalid("init-session before cleanup-worktree", &id))?;
            let exec_workdir = state.coordinator.execution_workdir(execution_id).await;
            let position = conn.worktrees.iter().position(|wt| {
                exec_workdir
                    .as_ref()
                    .map(|wd| wd.to_string_lossy() == wt.path)
                    .unwrap_or(false)
            });
            let Some(position) = position.or(if conn.worktrees.is_empty() {
                None
            } else {
                Some(conn.worktrees.len() - 1)
            }) else {
                return Err(error_reply(
                    ErrorCode::WorkspaceError,
                    "no worktree to clean up",
                    Some(id),
                ));
            };
            let worktree = conn.worktrees.remove(position);
            state
                .coordinator
                .workspace()
                .delete_worktree(
                    &workdir,
                    std::path::Path::new(&worktree.path),
                    &worktree.branch,
                    true,
                )
                .await
                .map_err(|error| error_reply(error.code(), error.to_string(), Some(id.clone())))?;
            state.bus.publish(dock_types::SessionEvent::new(
                session_id,
                dock_types::BridgeEvent::WorktreeDeleted {
                    path: worktree.path,
                    branch: worktree.branch,
                },
            ));
            Ok(Vec::new())
        }
        CommandKind::ExecutePrompt => {
            let prompt = data
                .get("prompt")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("execute-prompt requires prompt", &id))?
                .to_string();
            let mode = data
                .get("mode")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("execute-prompt requires mode", &id))?;
            let options = data.get("options").cloned().unwrap_or_else(|| json!({}));

            match mode {
                "plan" => {
                    let workdir = options
                        .get("workdir")
                        .and_then(Value::as_str)
                        .map(PathBuf::from)
                        .or_else(|| conn.workdir.clone())
                        .ok_or_else(|| invalid("no working directory; init-session first", &id))?;
                    let kind = options
                        .get("agentType")
                        .and_then(Value::as_str)
                        .and_then(AgentKind::parse)
                        .or(conn.agent_kind)
                        .or_else(|| {
                            state
                                .config
                                .agents
                                .preferred
                                .as_deref()
                                .and_then(AgentKind::parse)
                        })
                        .unwrap_or(AgentKind::ClaudeCode);

                    // Planning streams output; run it off the connection
                    // loop and let the agent-plan event carry the result.
                    let coordinator = state.coordinator.clone();
                    let session = session_id.to_string();
                    let reply_id = id.clone();
                    let errors = out_tx.clone();
                    tokio::spawn(async move {
                        if let Err(error) = coordinator
                            .submit_plan_request(&session, &prompt, &workdir, kind)
                            .await
                        {
                            let _ = errors
                                .send(error_reply(
                                    error.code(),
                                    error.to_string(),
                                    Some(reply_id),
                                ))
                                .await;
                        }
                    });
                    Ok(Vec::new())
                }
                "execute" => {
                    let plan_id = options
                        .get("planId")
                        .and_then(Value::as_str)
                        .ok_or_else(|| invalid("execute mode requires options.planId", &id))?;
                    state
                        .coordinator
                        .execute_plan(session_id, plan_id)
                        .await
                        .map_err(|error| {
                            error_reply(error.code(), error.to_string(), Some(id.clone()))
                        })?;
                    Ok(Vec::new())
                }
                _ => Err(invalid("mode must be plan or execute", &id)),
            }
        }
        CommandKind::ApprovePlan => {
            let plan_id = data
                .get("planId")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("approve-plan requires planId", &id))?;
            state
                .coordinator
                .approve_plan(session_id, plan_id)
                .await
                .map_err(|error| error_reply(error.code(), error.to_string(), Some(id.clone())))?;
            Ok(Vec::new())
        }
        CommandKind::RejectPlan => {
            let plan_id = data
                .get("planId")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("reject-plan requires planId", &id))?;
            let reason = data
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("rejected")
                .to_string();
            state
                .coordinator
                .reject_plan(session_id, plan_id, &reason)
                .await
                .map_err(|error| error_reply(error.code(), error.to_string(), Some(id.clone())))?;
            Ok(Vec::new())
        }
        CommandKind::AbortExecution => {
            let execution_id = data
                .get("executionId")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("abort-execution requires executionId", &id))?;
            state
                .coordinator
                .abort(session_id, execution_id)
                .await
                .map_err(|error| error_reply(error.code(), error.to_string(), Some(id.clone())))?;
            Ok(Vec::new())
        }
        CommandKind::AgentInteraction => {
            let message = data
                .get("message")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("agent-interaction requires message", &id))?;
            state
                .coordinator
                .interact(session_id, message)
                .await
                .map_err(|error| error_reply(error.code(), error.to_string(), Some(id.clone())))?;
            Ok(Vec::new())
        }
        CommandKind::AgentFeedback => {
            let execution_id = data
                .get("executionId")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("agent-feedback requires executionId", &id))?;
            let feedback = data
                .get("feedback")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("agent-feedback requires feedback", &id))?;
            state
                .coordinator
                .feedback(session_id, execution_id, feedback)
                .await
                .map_err(|error| error_reply(error.code(), error.to_string(), Some(id.clone())))?;
            Ok(Vec::new())
        }
        CommandKind::GeneratePr => {
            let execution_id = data
                .get("executionId")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("generate-pr requires executionId", &id))?
                .to_string();
            let workdir = state
                .coordinator
                .execution_workdir(&execution_id)
                .await
                .ok_or_else(|| {
                    error_reply(ErrorCode::ExecutionNotFound, "execution not found", Some(id.clone()))
                })?;
            let options = PullRequestOptions {
                title: data.get("title").and_then(Value::as_str).map(String::from),
                description: data
                    .get("description")
                    .and_then(Value::as_str)
                    .map(String::from),
                base_branch: data
                    .get("baseBranch")
                    .and_then(Value::as_str)
                    .map(String::from),
            };
            let info = state
                .coordinator
                .workspace()
                .generate_pull_request(&workdir, &options)
                .await
                .map_err(|error| error_reply(error.code(), error.to_string(), Some(id.clone())))?;
            state.bus.publish(dock_types::SessionEvent::new(
                session_id,
                dock_types::BridgeEvent::PrCreated {
                    execution_id,
                    url: info.url,
                    branch: info.branch,
                },
            ));
            Ok(Vec::new())
        }
        CommandKind::EmergencyKill => {
            let reason = data
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("emergency kill")
                .to_string();
            let aborted = state.coordinator.emergency_stop(&reason).await;
            let terminated = state.sessions.emergency_kill(&reason).await;
            *conn.session_id.write().await = None;
            conn.token = None;
            Ok(vec![json!({
                "type": "emergency-kill-confirmed",
                "id": id,
                "abortedExecutions": aborted,
                "terminatedSessions": terminated,
            })])
        }
        // pair / authenticate / health-check are handled before dispatch.
        CommandKind::Pair | CommandKind::Authenticate | CommandKind::HealthCheck => Ok(Vec::new()),
    }
}
