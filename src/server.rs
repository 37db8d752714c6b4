//! Inbound interaction webhook: verify, authorize, dispatch.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ed25519_dalek::{Signature, VerifyingKey};
use futures_util::StreamExt;
use futures_util::stream;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::delivery::{
    AskRequest, Continuation, DeliveryPlan, Engine, HostCaps, Strategy, UNAUTHORIZED_NOTICE,
};
use crate::discord::{self, DiscordClient, InteractionTarget};
use crate::openrouter;
use crate::persona::Mode;

pub const ASK_COMMAND: &str = "ask";
pub const CONTEXT_COMMAND: &str = "AIで返信する";

const EMPTY_REFERENCE_NOTICE: &str = "⚠️ 参照メッセージにテキストがありません。";

// Interaction types.
const PING: u8 = 1;
const APPLICATION_COMMAND: u8 = 2;

/// Verifies `X-Signature-Ed25519` over `timestamp || body` against the
/// application's public key.
pub struct SignatureVerifier {
    key: VerifyingKey,
}

impl SignatureVerifier {
    pub fn from_hex(hex_key: &str) -> Result<Self, String> {
        let bytes = hex::decode(hex_key).map_err(|e| format!("public key is not hex: {e}"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "public key must be 32 bytes".to_string())?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| format!("public key is not a valid Ed25519 key: {e}"))?;
        Ok(Self { key })
    }

    pub fn verify(&self, timestamp: &str, body: &[u8], signature_hex: &str) -> bool {
        let Ok(bytes) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&bytes) else {
            return false;
        };
        let mut message = Vec::with_capacity(timestamp.len() + body.len());
        message.extend_from_slice(timestamp.as_bytes());
        message.extend_from_slice(body);
        self.key.verify_strict(&message, &signature).is_ok()
    }
}

pub struct AppState {
    pub engine: Engine<openrouter::Client, DiscordClient>,
    pub verifier: SignatureVerifier,
    pub allowed_user_id: String,
    pub caps: HostCaps,
    pub default_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health).post(interactions))
        .route("/interactions", post(interactions))
        .with_state(state)
}

async fn health() -> &'static str {
    "Summer Bot interactions endpoint is running."
}

#[derive(Deserialize)]
struct Interaction {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    data: Option<CommandData>,
    #[serde(default)]
    member: Option<Member>,
    #[serde(default)]
    user: Option<User>,
    #[serde(default)]
    token: String,
    #[serde(default)]
    application_id: String,
    #[serde(default)]
    channel_id: Option<String>,
}

#[derive(Deserialize)]
struct Member {
    user: User,
}

#[derive(Deserialize)]
struct User {
    id: String,
}

#[derive(Deserialize)]
struct CommandData {
    name: String,
    #[serde(default)]
    options: Vec<CommandOption>,
    #[serde(default)]
    target_id: Option<String>,
    #[serde(default)]
    resolved: Option<ResolvedData>,
}

#[derive(Deserialize)]
struct CommandOption {
    name: String,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct ResolvedData {
    #[serde(default)]
    messages: HashMap<String, ResolvedMessage>,
}

#[derive(Deserialize)]
struct ResolvedMessage {
    #[serde(default)]
    content: String,
}

fn option_str<'a>(data: &'a CommandData, name: &str) -> Option<&'a str> {
    data.options
        .iter()
        .find(|option| option.name == name)
        .and_then(|option| option.value.as_str())
}

fn signature_headers(headers: &HeaderMap) -> Option<(&str, &str)> {
    let timestamp = headers.get("X-Signature-Timestamp")?.to_str().ok()?;
    let signature = headers.get("X-Signature-Ed25519")?.to_str().ok()?;
    Some((timestamp, signature))
}

async fn interactions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some((timestamp, signature)) = signature_headers(&headers) else {
        return (StatusCode::UNAUTHORIZED, "missing request signature").into_response();
    };
    if !state.verifier.verify(timestamp, &body, signature) {
        return (StatusCode::UNAUTHORIZED, "invalid request signature").into_response();
    }

    let interaction: Interaction = match serde_json::from_slice(&body) {
        Ok(interaction) => interaction,
        Err(e) => {
            warn!("unparseable interaction payload: {e}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match interaction.kind {
        PING => Json(discord::pong()).into_response(),
        APPLICATION_COMMAND => handle_command(state, interaction).await,
        other => {
            warn!("unsupported interaction type {other}");
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}

async fn handle_command(state: Arc<AppState>, interaction: Interaction) -> Response {
    let Some(data) = interaction.data else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    // Identity check happens before anything touches the provider.
    let requester = interaction
        .member
        .as_ref()
        .map(|member| &member.user)
        .or(interaction.user.as_ref());
    if requester.map(|user| user.id.as_str()) != Some(state.allowed_user_id.as_str()) {
        info!(
            "⛔ unauthorized requester {}",
            requester.map(|user| user.id.as_str()).unwrap_or("<none>")
        );
        return Json(discord::ephemeral_message(UNAUTHORIZED_NOTICE)).into_response();
    }

    let target = InteractionTarget {
        application_id: interaction.application_id.clone(),
        token: interaction.token.clone(),
    };

    if data.name == ASK_COMMAND {
        let Some(question) = option_str(&data, "question").map(str::to_string) else {
            warn!("ask command without a question option");
            return StatusCode::BAD_REQUEST.into_response();
        };
        let mode = option_str(&data, "mode").and_then(Mode::parse);
        let model = option_str(&data, "custom_model")
            .or_else(|| option_str(&data, "model"))
            .unwrap_or(&state.default_model)
            .to_string();
        let request = AskRequest {
            question,
            mode,
            model,
            max_tokens: state.max_tokens,
            temperature: state.temperature,
        };
        let strategy = Strategy::select(&state.caps);
        let plan = state.engine.ask(strategy, request, target).await;
        respond(plan)
    } else if data.name == CONTEXT_COMMAND {
        let question = data
            .target_id
            .as_ref()
            .and_then(|id| Some(data.resolved.as_ref()?.messages.get(id)?.content.clone()));
        let (Some(question), Some(channel_id), Some(message_id)) =
            (question, interaction.channel_id.clone(), data.target_id.clone())
        else {
            warn!("context command without a resolved message");
            return StatusCode::BAD_REQUEST.into_response();
        };
        if question.is_empty() {
            return Json(discord::ephemeral_message(EMPTY_REFERENCE_NOTICE)).into_response();
        }
        let request = AskRequest {
            question,
            mode: Some(Mode::Strict),
            model: state.default_model.clone(),
            max_tokens: state.max_tokens,
            temperature: state.temperature,
        };
        let plan =
            state
                .engine
                .context_reply(request, channel_id, message_id, state.caps.long_running);
        respond(plan)
    } else {
        warn!("unknown command {}", data.name);
        StatusCode::BAD_REQUEST.into_response()
    }
}

/// Turns a delivery plan into the HTTP response. Detached continuations are
/// spawned; awaited ones are chained behind the acknowledgment frame so the
/// body is not final until the continuation resolves.
fn respond(plan: DeliveryPlan) -> Response {
    match plan.continuation {
        None => Json(plan.initial).into_response(),
        Some(Continuation { detach: true, run }) => {
            tokio::spawn(async move {
                let phase = run.await;
                debug!("detached delivery finished: {phase:?}");
            });
            Json(plan.initial).into_response()
        }
        Some(Continuation { detach: false, run }) => {
            let ack = match serde_json::to_vec(&plan.initial) {
                Ok(ack) => ack,
                Err(e) => {
                    warn!("unserializable acknowledgment: {e}");
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            };
            let frames = stream::once(async move { Ok::<_, Infallible>(ack) }).chain(
                stream::once(async move {
                    let phase = run.await;
                    debug!("awaited delivery finished: {phase:?}");
                    Ok(Vec::new())
                }),
            );
            match Response::builder()
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from_stream(frames))
            {
                Ok(response) => response,
                Err(e) => {
                    warn!("failed to build streaming response: {e}");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }
        }
    }
}
