//! HTTP server: WebSocket chat endpoint plus REST chat/database management.

use crate::agent::{AgentEvent, AgentRunner, ChatBackend};
use crate::config::ScoutConfig;
use crate::protocol::{ClientEnvelope, ServerEvent};
use crate::session::Session;
use crate::store::{ChatStore, DEFAULT_CHAT_TITLE};
use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use scout_tools::{OpRegistry, SqlConnector};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub store: Arc<ChatStore>,
    pub registry: Arc<OpRegistry>,
    pub runner: Arc<AgentRunner>,
}

pub async fn serve(cfg: ScoutConfig, connector: Arc<dyn SqlConnector>) -> Result<()> {
    let addr = cfg.server.bind_addr()?;
    let store = Arc::new(ChatStore::open(&cfg.server.store_path())?);
    let registry = Arc::new(OpRegistry::new(connector));
    let backend = cfg
        .llm
        .client()
        .map(|client| Arc::new(client) as Arc<dyn ChatBackend>);
    tracing::info!(
        bind = %addr,
        store_path = %cfg.server.store_path().display(),
        model = ?cfg.llm.model,
        llm_configured = backend.is_some(),
        role = ?cfg.agent.role,
        max_rounds = cfg.agent.max_rounds,
        max_observation_chars = cfg.agent.max_observation_chars,
        "server configuration loaded"
    );

    let runner = Arc::new(AgentRunner::new(
        backend,
        registry.clone(),
        store.clone(),
        &cfg.agent,
    ));
    let state = Arc::new(AppState {
        store,
        registry,
        runner,
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "sqlscout serving");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/databases", get(api_databases))
        .route(
            "/api/databases/{name}/description",
            get(api_get_description).put(api_set_description),
        )
        .route("/api/chats", get(api_list_chats).post(api_create_chat))
        .route("/api/chats/{id}", delete(api_delete_chat))
        .route("/api/chats/{id}/messages", get(api_chat_messages))
        .route("/api/chats/{id}/star", post(api_star_chat))
        .route("/api/chats/{id}/title", post(api_rename_chat))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// REST handlers
// ---------------------------------------------------------------------------

async fn api_databases(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    match state.registry.connector().list_databases().await {
        Ok(databases) => Json(json!({ "databases": databases })),
        Err(e) => {
            tracing::error!(error = %e, "failed to list databases");
            Json(json!({ "databases": [], "error": e.to_string() }))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatsQuery {
    database: String,
}

async fn api_list_chats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChatsQuery>,
) -> Response {
    match state.store.list_chats(&query.database) {
        Ok(chats) => Json(json!({ "chats": chats })).into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct CreateChatBody {
    database: String,
    #[serde(default)]
    title: Option<String>,
}

async fn api_create_chat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateChatBody>,
) -> Response {
    match state.store.create_chat(&body.database, body.title.as_deref()) {
        Ok(chat) => Json(chat).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn api_chat_messages(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
) -> Response {
    match state.store.chat(chat_id) {
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Ok(Some(_)) => match state.store.messages(chat_id) {
            Ok(messages) => Json(json!({ "messages": messages })).into_response(),
            Err(e) => internal_error(e),
        },
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct StarBody {
    starred: bool,
}

async fn api_star_chat(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    Json(body): Json<StarBody>,
) -> Response {
    match state.store.set_starred(chat_id, body.starred) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct TitleBody {
    title: String,
}

async fn api_rename_chat(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    Json(body): Json<TitleBody>,
) -> Response {
    match state.store.rename(chat_id, &body.title) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e),
    }
}

async fn api_delete_chat(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
) -> Response {
    match state.store.delete_chat(chat_id) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e),
    }
}

async fn api_get_description(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.store.description(&name) {
        Ok(description) => Json(json!({ "name": name, "description": description })).into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct DescriptionBody {
    description: String,
}

async fn api_set_description(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<DescriptionBody>,
) -> Response {
    match state.store.set_description(&name, &body.description) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => internal_error(e),
    }
}

type Response = axum::response::Response;

fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

// ---------------------------------------------------------------------------
// WebSocket chat
// ---------------------------------------------------------------------------

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(state, socket))
}

#[tracing::instrument(level = "info", skip_all)]
async fn handle_socket(state: Arc<AppState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut session = Session::default();

    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else {
            continue;
        };

        let envelope = match serde_json::from_str::<ClientEnvelope>(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable client envelope");
                if !send_event(&mut sender, &ServerEvent::error(format!("invalid message: {e}")))
                    .await
                {
                    break;
                }
                continue;
            }
        };

        match envelope {
            ClientEnvelope::SetDatabase { database } => {
                session.select_database(database.clone());
                let notice = ServerEvent::system(format!("Connected to database: {database}"));
                if !send_event(&mut sender, &notice).await {
                    break;
                }
            }
            ClientEnvelope::NewChat { title } => {
                let Some(database) = session.database.clone() else {
                    if !send_error(&mut sender, "Please select a database first.").await {
                        break;
                    }
                    continue;
                };
                match state.store.create_chat(&database, title.as_deref()) {
                    Ok(chat) => {
                        session.select_chat(chat.id, database, Vec::new());
                        if !send_event(&mut sender, &ServerEvent::ChatCreated { chat }).await {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "chat creation failed");
                        if !send_error(&mut sender, format!("store error: {e}")).await {
                            break;
                        }
                    }
                }
            }
            ClientEnvelope::SelectChat { chat_id } => {
                let chat = match state.store.chat(chat_id) {
                    Ok(Some(chat)) => chat,
                    Ok(None) => {
                        if !send_error(&mut sender, "Chat not found.").await {
                            break;
                        }
                        continue;
                    }
                    Err(e) => {
                        if !send_error(&mut sender, format!("store error: {e}")).await {
                            break;
                        }
                        continue;
                    }
                };
                let messages = match state.store.messages(chat_id) {
                    Ok(messages) => messages,
                    Err(e) => {
                        if !send_error(&mut sender, format!("store error: {e}")).await {
                            break;
                        }
                        continue;
                    }
                };
                session.select_chat(chat_id, chat.database_name.clone(), messages.clone());
                if !send_event(&mut sender, &ServerEvent::History { chat_id, messages }).await {
                    break;
                }
            }
            ClientEnvelope::Message { content } => {
                if session.database.is_none() {
                    if !send_error(&mut sender, "Please select a database first.").await {
                        break;
                    }
                    continue;
                }
                if session.chat_id.is_none() {
                    if !send_error(&mut sender, "Please create or select a chat first.").await {
                        break;
                    }
                    continue;
                }

                maybe_autotitle(&state.store, &session, &content);

                let (events_tx, mut events_rx) = mpsc::unbounded_channel();
                {
                    let run = state.runner.run(&mut session, &content, &events_tx);
                    tokio::pin!(run);
                    let mut running = true;
                    while running {
                        tokio::select! {
                            _ = &mut run => {
                                running = false;
                            }
                            Some(event) = events_rx.recv() => {
                                if !send_event(&mut sender, &to_server_event(event)).await {
                                    return;
                                }
                            }
                        }
                    }
                }
                while let Ok(event) = events_rx.try_recv() {
                    if !send_event(&mut sender, &to_server_event(event)).await {
                        return;
                    }
                }
            }
        }
    }

    tracing::info!("client disconnected");
}

fn to_server_event(event: AgentEvent) -> ServerEvent {
    match event {
        AgentEvent::Delta(content) => ServerEvent::Stream { content },
        AgentEvent::ToolInvocation { name, args } => ServerEvent::ToolCall { tool: name, args },
        AgentEvent::StreamComplete => ServerEvent::StreamEnd,
        AgentEvent::Error(content) => ServerEvent::Error { content },
    }
}

async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &ServerEvent) -> bool {
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize server event");
            return false;
        }
    };
    sender.send(Message::Text(payload.into())).await.is_ok()
}

async fn send_error(
    sender: &mut SplitSink<WebSocket, Message>,
    content: impl Into<String>,
) -> bool {
    send_event(sender, &ServerEvent::error(content)).await
}

/// Name a default-titled chat after its first user message.
fn maybe_autotitle(store: &ChatStore, session: &Session, content: &str) {
    let Some(chat_id) = session.chat_id else {
        return;
    };
    if !session.history.is_empty() {
        return;
    }
    let Ok(Some(chat)) = store.chat(chat_id) else {
        return;
    };
    if chat.title != DEFAULT_CHAT_TITLE {
        return;
    }
    let title = derive_title(content);
    if title.is_empty() {
        return;
    }
    if let Err(e) = store.rename(chat_id, &title) {
        tracing::warn!(chat_id, error = %e, "auto-title failed");
    }
}

fn derive_title(content: &str) -> String {
    let first_line = content.trim().lines().next().unwrap_or("");
    first_line
        .chars()
        .take(60)
        .collect::<String>()
        .trim_end()
        .to_string()
}
