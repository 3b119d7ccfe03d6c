//! A small axum message service for exercising the HTTP adapter.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{patch, post},
    Json, Router,
};
use chrono::Utc;
use shared::{
    domain::MessageId,
    error::{ApiError, ErrorCode},
    protocol::{MessagePage, MessageQuery, RemoteMessage, SendMessageRequest, UpdateMessageRequest},
};
use tokio::net::TcpListener;

type ApiResult<T> = std::result::Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Default)]
pub struct ServerState {
    pub messages: Vec<(String, RemoteMessage)>,
    pub fail_sends: bool,
    pub send_requests: usize,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct TestServer {
    pub state: Arc<Mutex<ServerState>>,
}

impl TestServer {
    pub fn set_fail_sends(&self, fail: bool) {
        self.state.lock().expect("state").fail_sends = fail;
    }

    pub fn send_requests(&self) -> usize {
        self.state.lock().expect("state").send_requests
    }

    pub fn messages_in(&self, channel: &str) -> Vec<RemoteMessage> {
        self.state
            .lock()
            .expect("state")
            .messages
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

fn not_found(message_id: &str) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::NOT_FOUND,
        Json(ApiError::new(
            ErrorCode::NotFound,
            format!("message {message_id} not found"),
        )),
    )
}

async fn handle_send(
    State(server): State<TestServer>,
    Path(channel): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<(StatusCode, Json<RemoteMessage>)> {
    let mut state = server.state.lock().expect("state");
    state.send_requests += 1;
    if state.fail_sends {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Internal, "maintenance")),
        ));
    }
    if let Some((_, existing)) = state
        .messages
        .iter()
        .find(|(_, m)| m.client_operation_id.as_ref() == Some(&request.client_operation_id))
    {
        return Ok((StatusCode::OK, Json(existing.clone())));
    }
    state.next_id += 1;
    let message = RemoteMessage {
        id: MessageId::new(format!("m{}", state.next_id)),
        client_operation_id: Some(request.client_operation_id),
        text: request.text,
        updated_at: None,
        created_at: Some(Utc::now()),
        version: Some(0),
    };
    state.messages.push((channel, message.clone()));
    Ok((StatusCode::CREATED, Json(message)))
}

async fn handle_list(
    State(server): State<TestServer>,
    Path(channel): Path<String>,
    Query(query): Query<MessageQuery>,
) -> Json<MessagePage> {
    let mut messages = server.messages_in(&channel);
    let skip = messages.len().saturating_sub(query.limit as usize);
    Json(MessagePage {
        messages: messages.split_off(skip),
    })
}

async fn handle_update(
    State(server): State<TestServer>,
    Path((channel, message_id)): Path<(String, String)>,
    Json(request): Json<UpdateMessageRequest>,
) -> ApiResult<StatusCode> {
    let mut state = server.state.lock().expect("state");
    let (_, message) = state
        .messages
        .iter_mut()
        .find(|(c, m)| c == &channel && m.id.as_str() == message_id)
        .ok_or_else(|| not_found(&message_id))?;
    message.text = request.text;
    message.updated_at = Some(Utc::now());
    message.version = Some(message.version.unwrap_or(0) + 1);
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_delete(
    State(server): State<TestServer>,
    Path((channel, message_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let mut state = server.state.lock().expect("state");
    let before = state.messages.len();
    state
        .messages
        .retain(|(c, m)| !(c == &channel && m.id.as_str() == message_id));
    if state.messages.len() == before {
        return Err(not_found(&message_id));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn spawn_message_server() -> Result<(String, TestServer)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = TestServer::default();
    let app = Router::new()
        .route("/channels/:channel/messages", post(handle_send).get(handle_list))
        .route(
            "/channels/:channel/messages/:message_id",
            patch(handle_update).delete(handle_delete),
        )
        .with_state(server.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), server))
}
