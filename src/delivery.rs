//! Delivery strategies: how and when the answer reaches the channel.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::assembler::Assembler;
use crate::discord::{
    self, ChannelWriter, InteractionTarget, MAX_MESSAGE_LEN, split_chunks,
};
use crate::openrouter::{ChatRequest, Gateway, ProviderError, TokenFeed};
use crate::persona::{Mode, PersonaResolver};

/// Shown when the provider call exceeds its deadline.
pub const TIMEOUT_APOLOGY: &str =
    "⚠️ AIの応答が制限時間を超えました。もう一度試すか、短い質問にしてください。";
/// Shown for every other provider failure. Raw detail goes to the log only.
pub const GENERIC_FAILURE: &str = "⚠️ エラーが発生しました。";
/// Ephemeral rejection for a requester identity mismatch.
pub const UNAUTHORIZED_NOTICE: &str = "⚠️ Unauthorized";

/// Ephemeral acknowledgment for the message context command.
const CONTEXT_ACK: &str = "AIが返信を作成しています…";
/// Appended to non-final snapshots for a typing impression. Display-only.
const TYPING_CURSOR: &str = " ┃";

/// What the hosting environment can do after the initial HTTP response.
#[derive(Debug, Clone, Copy)]
pub struct HostCaps {
    /// The process keeps running; detached work is safe.
    pub long_running: bool,
    /// The process is frozen after the response completes, but the response
    /// body can be flushed early while a continuation is still awaited.
    pub background_continuation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Immediate,
    DeferredEdit,
    DeferredBackground,
}

impl Strategy {
    pub fn select(caps: &HostCaps) -> Self {
        if caps.long_running {
            Self::DeferredEdit
        } else if caps.background_continuation {
            Self::DeferredBackground
        } else {
            Self::Immediate
        }
    }
}

/// Lifecycle of one interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    SentInitial,
    Streaming,
    Completed,
    Failed,
}

/// One accepted question, immutable once built.
#[derive(Debug, Clone)]
pub struct AskRequest {
    pub question: String,
    pub mode: Option<Mode>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// The initial interaction response plus whatever work remains after it.
pub struct DeliveryPlan {
    pub initial: serde_json::Value,
    pub continuation: Option<Continuation>,
}

pub struct Continuation {
    /// Detached work is only safe on a long-running host; otherwise the
    /// HTTP layer must keep the response body open until `run` resolves.
    pub detach: bool,
    pub run: BoxFuture<'static, Phase>,
}

pub struct Engine<G, W> {
    gateway: Arc<G>,
    writer: Arc<W>,
    resolver: Arc<PersonaResolver>,
    throttle: Duration,
}

impl<G, W> Engine<G, W>
where
    G: Gateway + 'static,
    W: ChannelWriter + 'static,
{
    pub fn new(
        gateway: Arc<G>,
        writer: Arc<W>,
        resolver: Arc<PersonaResolver>,
        throttle: Duration,
    ) -> Self {
        Self { gateway, writer, resolver, throttle }
    }

    fn chat_request(&self, request: &AskRequest) -> ChatRequest {
        ChatRequest {
            model: request.model.clone(),
            system: self.resolver.resolve(request.mode),
            question: request.question.clone(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        }
    }

    /// Runs the `/ask` command under the given strategy.
    pub async fn ask(
        &self,
        strategy: Strategy,
        request: AskRequest,
        target: InteractionTarget,
    ) -> DeliveryPlan {
        info!(
            "❓ ask: strategy={strategy:?} mode={} model={}",
            request.mode.map(|m| m.as_str()).unwrap_or("-"),
            request.model
        );
        match strategy {
            Strategy::Immediate => self.ask_immediate(&request, target).await,
            Strategy::DeferredEdit => self.ask_deferred(&request, target, true),
            Strategy::DeferredBackground => self.ask_deferred(&request, target, false),
        }
    }

    /// Fetches the whole answer before acknowledging. The provider deadline
    /// is shorter than the platform's, so a failure still answers in time.
    async fn ask_immediate(&self, request: &AskRequest, target: InteractionTarget) -> DeliveryPlan {
        let chat = self.chat_request(request);
        match self.gateway.complete(&chat).await {
            Ok(answer) => {
                let mut chunks = split_chunks(&answer, MAX_MESSAGE_LEN).into_iter();
                let first = match chunks.next() {
                    Some(first) => first,
                    None => {
                        return DeliveryPlan {
                            initial: discord::channel_message(GENERIC_FAILURE),
                            continuation: None,
                        };
                    }
                };
                let rest: Vec<String> = chunks.collect();
                let initial = discord::channel_message(&first);
                if rest.is_empty() {
                    return DeliveryPlan { initial, continuation: None };
                }
                let writer = self.writer.clone();
                DeliveryPlan {
                    initial,
                    continuation: Some(Continuation {
                        detach: false,
                        run: Box::pin(async move {
                            for chunk in rest {
                                if let Err(e) = writer.follow_up(&target, &chunk).await {
                                    warn!("follow-up chunk failed: {e}");
                                }
                            }
                            Phase::Completed
                        }),
                    }),
                }
            }
            Err(e) => {
                warn!("provider call failed: {e}");
                DeliveryPlan {
                    initial: discord::channel_message(apology_for(&e)),
                    continuation: None,
                }
            }
        }
    }

    /// Acknowledges with a placeholder, then streams the answer into it.
    fn ask_deferred(
        &self,
        request: &AskRequest,
        target: InteractionTarget,
        detach: bool,
    ) -> DeliveryPlan {
        let chat = self.chat_request(request);
        let gateway = self.gateway.clone();
        let writer = self.writer.clone();
        let throttle = self.throttle;
        DeliveryPlan {
            initial: discord::deferred(),
            continuation: Some(Continuation {
                detach,
                run: Box::pin(async move {
                    stream_to_original(gateway, writer, chat, throttle, target).await
                }),
            }),
        }
    }

    /// Runs the message context command: ephemeral acknowledgment, then the
    /// answer as a reply to the referenced message.
    pub fn context_reply(
        &self,
        request: AskRequest,
        channel_id: String,
        message_id: String,
        detach: bool,
    ) -> DeliveryPlan {
        info!("💬 context reply for message {message_id}");
        let chat = self.chat_request(&request);
        let gateway = self.gateway.clone();
        let writer = self.writer.clone();
        DeliveryPlan {
            initial: discord::ephemeral_message(CONTEXT_ACK),
            continuation: Some(Continuation {
                detach,
                run: Box::pin(async move {
                    match gateway.complete(&chat).await {
                        Ok(answer) => {
                            for chunk in split_chunks(&answer, MAX_MESSAGE_LEN) {
                                if let Err(e) =
                                    writer.channel_reply(&channel_id, &message_id, &chunk).await
                                {
                                    warn!("channel reply chunk failed: {e}");
                                }
                            }
                            Phase::Completed
                        }
                        Err(e) => {
                            warn!("provider call failed: {e}");
                            if let Err(e) = writer
                                .channel_reply(&channel_id, &message_id, apology_for(&e))
                                .await
                            {
                                warn!("failed to deliver error notice: {e}");
                            }
                            Phase::Failed
                        }
                    }
                }),
            }),
        }
    }
}

fn apology_for(error: &ProviderError) -> &'static str {
    match error {
        ProviderError::Timeout => TIMEOUT_APOLOGY,
        _ => GENERIC_FAILURE,
    }
}

/// The deferred streaming loop: progressive edits of the placeholder while
/// deltas arrive, then the full answer in ordered chunks. Any provider
/// failure overwrites the placeholder instead of leaving it stale; text
/// already on screen before the failure stays there.
async fn stream_to_original<G, W>(
    gateway: Arc<G>,
    writer: Arc<W>,
    chat: ChatRequest,
    throttle: Duration,
    target: InteractionTarget,
) -> Phase
where
    G: Gateway,
    W: ChannelWriter + ?Sized,
{
    let mut phase = Phase::Pending;
    debug!("delivery phase: {phase:?}");
    // the placeholder ack is flushed by the HTTP layer before this runs
    phase = Phase::SentInitial;
    debug!("delivery phase: {phase:?}");

    let mut feed = match gateway.stream(&chat).await {
        Ok(feed) => feed,
        Err(e) => {
            warn!("provider stream failed to open: {e}");
            overwrite_placeholder(&*writer, &target, apology_for(&e)).await;
            return Phase::Failed;
        }
    };
    phase = Phase::Streaming;
    debug!("delivery phase: {phase:?}");

    let mut assembler = Assembler::new(throttle);
    loop {
        match feed.next_delta().await {
            Ok(Some(delta)) => {
                assembler.push_delta(&delta);
                if let Some(snapshot) = assembler.take_due() {
                    let shown = format!("{snapshot}{TYPING_CURSOR}");
                    if let Err(e) = writer.edit_original(&target, &shown).await {
                        warn!("progressive edit failed: {e}");
                    }
                    assembler.emission_done();
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("provider stream aborted: {e}");
                overwrite_placeholder(&*writer, &target, apology_for(&e)).await;
                return Phase::Failed;
            }
        }
    }

    let answer = assembler.finish();
    if answer.is_empty() {
        warn!("provider stream produced no content");
        overwrite_placeholder(&*writer, &target, GENERIC_FAILURE).await;
        return Phase::Failed;
    }
    for (index, chunk) in split_chunks(&answer, MAX_MESSAGE_LEN).iter().enumerate() {
        let result = if index == 0 {
            writer.edit_original(&target, chunk).await
        } else {
            writer.follow_up(&target, chunk).await
        };
        if let Err(e) = result {
            warn!("final chunk {index} failed: {e}");
        }
    }
    assembler.emission_done();
    phase = Phase::Completed;
    debug!("delivery phase: {phase:?}");
    phase
}

async fn overwrite_placeholder<W: ChannelWriter + ?Sized>(
    writer: &W,
    target: &InteractionTarget,
    notice: &str,
) {
    if let Err(e) = writer.edit_original(target, notice).await {
        warn!("failed to overwrite placeholder: {e}");
    }
}
