//! Per-chat streaming state machine.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::payload::{self, BusMessage};
use crate::bus::ConsumerHandle;
use crate::fanout::{base_event, fingerprint};
use crate::state::OrchestratorState;
use crate::stream::ChatError;
use crate::thinking::{ParserEvent, ThinkingParser};
use crate::upstream::{ChatFlags, ChatReply, ChatRequest};

/// Everything a chat submission carries.
#[derive(Debug, Clone)]
pub struct ChatParams {
    pub user_id: String,
    pub session_id: String,
    pub chat_id: String,
    pub instance_id: Option<String>,
    pub model_id: String,
    pub prompt: String,
    pub flags: ChatFlags,
    pub temp_file_paths: Vec<String>,
}

/// Why the driver loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// Canonical completion message from the bus, or quiescence after
    /// upstream reported the reply complete.
    Completed,
    /// A timeout gate expired without completion.
    TimedOut,
    /// Upstream HTTP failed and the drain window elapsed.
    Errored,
    /// Cancelled externally (stop, logout, or a newer submission).
    Cancelled,
    /// The consumer went away without a stop.
    ConsumerLost,
}

/// Result of the upstream HTTP trigger.
#[derive(Debug, Clone)]
enum ProducerOutcome {
    Ok(ChatReply),
    Failed(String),
}

/// Start a chat stream.
///
/// Validates admission, replays history, appends the prompt, and launches
/// the producer trigger and bus consumer. Returns the event stream; bus
/// or upstream trouble after admission surfaces as `error`/`complete`
/// events on the stream, not as an `Err`.
pub async fn start_chat(
    state: Arc<OrchestratorState>,
    params: ChatParams,
) -> Result<mpsc::UnboundedReceiver<Value>, ChatError> {
    let Some(user) = state.registry.current_user() else {
        return Err(ChatError::Unauthenticated);
    };
    if params.user_id.is_empty() || params.session_id.is_empty() || params.chat_id.is_empty() {
        return Err(ChatError::Validation(
            "user_id, session_id and chat_id are required".to_string(),
        ));
    }

    let prompt_cap = state.config.prompt_cap;
    if state
        .transcripts
        .prompt_count(&params.user_id, &params.session_id)
        >= prompt_cap
    {
        return Err(ChatError::LimitReached {
            session_id: params.session_id.clone(),
            limit: prompt_cap,
        });
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let room = fingerprint(
        &params.user_id,
        &params.session_id,
        &params.chat_id,
        params.instance_id.as_deref(),
    );

    // Replay before anything live.
    replay_history(&state, &params, &room, &tx);

    let temp_file_name = params
        .temp_file_paths
        .first()
        .and_then(|p| p.rsplit('/').next())
        .map(str::to_string);
    state.transcripts.append_user_prompt(
        &params.user_id,
        &params.session_id,
        &params.chat_id,
        &params.prompt,
        temp_file_name,
    );

    let outcome =
        state
            .catalog
            .upsert_for_chat(&params.user_id, &params.session_id, &params.chat_id);
    if let Some(evicted) = outcome.evicted {
        state.transcripts.drop_session(&params.user_id, &evicted.id);
        debug!(
            target: "catalog",
            user_id = %params.user_id,
            session_id = %evicted.id,
            "session evicted by sliding window"
        );
    }

    let cancel = state.begin_stream(
        &params.user_id,
        &params.session_id,
        &params.chat_id,
        params.instance_id.clone(),
    );

    // Subscribe before triggering upstream so no racing message is missed.
    let (bus_tx, bus_rx) = mpsc::channel(256);
    let tag = state.consumers.make_tag(
        &room,
        &params.user_id,
        &params.session_id,
        &params.chat_id,
    );
    let consumer = match state
        .consumers
        .acquire_stream(&state.config.queues.chat, tag, bus_tx)
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            warn!(target: "stream", error = %e, "bus unavailable, failing chat");
            emit(&state, &room, &tx, error_event(&params, "UNAVAILABLE", &e.to_string()));
            let mut complete = base_event(
                "complete",
                &params.chat_id,
                &params.session_id,
                params.instance_id.as_deref(),
            );
            complete["completion_type"] = json!("error");
            complete["total_tokens"] = json!(0);
            emit(&state, &room, &tx, complete);
            state
                .transcripts
                .scrub_incomplete(&params.user_id, &params.session_id, &params.chat_id);
            state.end_stream(&params.user_id, &params.session_id, &params.chat_id);
            return Ok(rx);
        }
    };

    // Producer trigger.
    let (reply_tx, reply_rx) = oneshot::channel();
    {
        let request = ChatRequest {
            user_id: params.user_id.clone(),
            chat_id: params.chat_id.clone(),
            session_id: params.session_id.clone(),
            llm_model_id: params.model_id.clone(),
            prompt: params.prompt.clone(),
            temp_file_paths: params.temp_file_paths.clone(),
            room_id: room.clone(),
            flags: params.flags,
        };
        let state = state.clone();
        let token = user.token.clone();
        tokio::spawn(async move {
            let outcome = match state.upstream.chat(&token, &request).await {
                Ok(reply) => ProducerOutcome::Ok(reply),
                Err(e) => ProducerOutcome::Failed(e.to_string()),
            };
            let _ = reply_tx.send(outcome);
        });
    }

    tokio::spawn(drive_stream(
        state,
        params,
        room,
        tx,
        bus_rx,
        reply_rx,
        cancel,
        consumer,
    ));

    Ok(rx)
}

/// Replay the existing transcript as history events. The brackets are
/// always emitted; a fresh session just has nothing between them.
fn replay_history(
    state: &Arc<OrchestratorState>,
    params: &ChatParams,
    room: &str,
    tx: &mpsc::UnboundedSender<Value>,
) {
    emit(
        state,
        room,
        tx,
        base_event(
            "history_start",
            &params.chat_id,
            &params.session_id,
            params.instance_id.as_deref(),
        ),
    );
    for msg in state
        .transcripts
        .history(&params.user_id, &params.session_id)
    {
        let mut event = base_event(
            "history",
            &msg.chat_id,
            &params.session_id,
            params.instance_id.as_deref(),
        );
        event["content"] = json!(msg.content);
        event["role"] = json!(msg.role.to_string());
        if let Some(thinking) = &msg.thinking_content {
            event["thinking_content"] = json!(thinking);
        }
        if let Some(name) = &msg.temp_file_name {
            event["temp_file_name"] = json!(name);
        }
        emit(state, room, tx, event);
    }
    emit(
        state,
        room,
        tx,
        base_event(
            "history_end",
            &params.chat_id,
            &params.session_id,
            params.instance_id.as_deref(),
        ),
    );
}

/// The driver loop: consumes bus messages through the thinking parser and
/// applies the timeout gates until the stream ends.
#[allow(clippy::too_many_arguments)]
async fn drive_stream(
    state: Arc<OrchestratorState>,
    params: ChatParams,
    room: String,
    tx: mpsc::UnboundedSender<Value>,
    mut bus_rx: mpsc::Receiver<Value>,
    reply_rx: oneshot::Receiver<ProducerOutcome>,
    cancel: CancellationToken,
    consumer: ConsumerHandle,
) {
    let timeouts = state.config.timeouts.clone();
    let profile = state.models.profile_for(&params.model_id);
    let mut parser = ThinkingParser::new(profile);

    let global_deadline = Instant::now() + timeouts.global();
    let mut last_activity = Instant::now();
    let mut producer: Option<ProducerOutcome> = None;
    let mut producer_rx = Some(reply_rx);
    let mut drain_deadline: Option<Instant> = None;
    let mut first_message = false;
    let mut token_number: u64 = 0;

    let end = loop {
        let idle_gate = match (&producer, first_message) {
            (Some(ProducerOutcome::Ok(reply)), false) if reply.is_complete => {
                timeouts.first_message_complete()
            }
            (Some(ProducerOutcome::Ok(reply)), true) if reply.is_complete => {
                timeouts.quiescence_complete()
            }
            (Some(ProducerOutcome::Ok(_)), false) => timeouts.first_message_pending(),
            _ => timeouts.quiescence_pending(),
        };
        let mut deadline = last_activity + idle_gate;
        if let Some(drain) = drain_deadline {
            deadline = deadline.min(drain);
        }
        deadline = deadline.min(global_deadline);

        tokio::select! {
            _ = cancel.cancelled() => break StreamEnd::Cancelled,

            outcome = recv_producer(&mut producer_rx), if producer.is_none() => {
                if let ProducerOutcome::Failed(ref message) = outcome {
                    warn!(
                        target: "stream",
                        chat_id = %params.chat_id,
                        error = %message,
                        "upstream chat call failed; draining bus"
                    );
                    emit(&state, &room, &tx, error_event(&params, "UPSTREAM", message));
                    drain_deadline = Some(Instant::now() + timeouts.error_drain());
                } else if let ProducerOutcome::Ok(ref reply) = outcome {
                    handle_producer_reply(&state, &params, reply);
                }
                producer = Some(outcome);
            }

            delivery = bus_rx.recv() => {
                match delivery {
                    Some(value) => {
                        if let Some(done) = handle_delivery(
                            &state, &params, &room, &tx,
                            &mut parser, &mut first_message, &mut token_number,
                            &value,
                        ) {
                            break done;
                        }
                        last_activity = Instant::now();
                    }
                    None => break StreamEnd::ConsumerLost,
                }
            }

            _ = tokio::time::sleep_until(deadline) => {
                let now = Instant::now();
                if drain_deadline.is_some_and(|d| now >= d) {
                    break StreamEnd::Errored;
                }
                if now >= global_deadline {
                    break StreamEnd::TimedOut;
                }
                match &producer {
                    Some(ProducerOutcome::Ok(reply)) if reply.is_complete => {
                        break StreamEnd::Completed;
                    }
                    _ => break StreamEnd::TimedOut,
                }
            }
        }
    };

    // Whatever the parser still withholds is ordinary text.
    if matches!(end, StreamEnd::Completed | StreamEnd::TimedOut) {
        for event in parser.finish() {
            apply_parser_event(&state, &params, &room, &tx, &mut token_number, event);
        }
    }

    finish_stream(&state, &params, &room, &tx, end, token_number);
    state.consumers.cancel(consumer.id);
    state.end_stream(&params.user_id, &params.session_id, &params.chat_id);
}

/// Await the producer result once; pend forever afterwards.
async fn recv_producer(rx: &mut Option<oneshot::Receiver<ProducerOutcome>>) -> ProducerOutcome {
    match rx {
        Some(receiver) => {
            let outcome = receiver
                .await
                .unwrap_or_else(|_| ProducerOutcome::Failed("producer task dropped".to_string()));
            *rx = None;
            outcome
        }
        None => std::future::pending().await,
    }
}

/// Session-title reconciliation on the first chat of a session. The
/// re-sync runs detached; the stream never blocks on it.
fn handle_producer_reply(state: &Arc<OrchestratorState>, params: &ChatParams, reply: &ChatReply) {
    if params.chat_id != "1" {
        return;
    }
    let Some(ref name) = reply.session_name else {
        return;
    };
    state
        .catalog
        .set_title_from_upstream(&params.user_id, &params.session_id, name);
    let state = state.clone();
    let user_id = params.user_id.clone();
    tokio::spawn(async move {
        if let Err(e) = crate::stream::sync_session_index(&state, &user_id).await {
            debug!(target: "catalog", error = %e, "post-chat session index sync failed");
        }
    });
}

/// Process one bus delivery. Returns `Some` when the stream should end.
#[allow(clippy::too_many_arguments)]
fn handle_delivery(
    state: &Arc<OrchestratorState>,
    params: &ChatParams,
    room: &str,
    tx: &mpsc::UnboundedSender<Value>,
    parser: &mut ThinkingParser,
    first_message: &mut bool,
    token_number: &mut u64,
    value: &Value,
) -> Option<StreamEnd> {
    let message = payload::decode(value);
    match message {
        BusMessage::Token { text, chat_id } | BusMessage::Content { text, chat_id } => {
            // Other chats share the queue; their payloads are not ours.
            if chat_id.as_deref().is_some_and(|c| c != params.chat_id) {
                return None;
            }
            if !*first_message {
                *first_message = true;
                state.transcripts.ensure_assistant(
                    &params.user_id,
                    &params.session_id,
                    &params.chat_id,
                );
            }
            for event in parser.push(&text) {
                apply_parser_event(state, params, room, tx, token_number, event);
            }
            None
        }
        BusMessage::Completion => Some(StreamEnd::Completed),
        _ => None,
    }
}

/// Translate a parser event into transcript updates and push events.
fn apply_parser_event(
    state: &Arc<OrchestratorState>,
    params: &ChatParams,
    room: &str,
    tx: &mpsc::UnboundedSender<Value>,
    token_number: &mut u64,
    event: ParserEvent,
) {
    match event {
        ParserEvent::Stream {
            text,
            message_id,
            is_pending_thinking,
        } => {
            *token_number += 1;
            state.transcripts.append_assistant_token(
                &params.user_id,
                &params.session_id,
                &params.chat_id,
                &text,
            );
            let mut out = base_event(
                "stream",
                &params.chat_id,
                &params.session_id,
                params.instance_id.as_deref(),
            );
            out["content"] = json!(text);
            out["token_number"] = json!(*token_number);
            if is_pending_thinking {
                out["messageId"] = json!(message_id);
                out["isPendingThinking"] = json!(true);
            }
            emit(state, room, tx, out);
        }
        ParserEvent::MoveToThinking {
            content,
            message_id,
            pending_tokens,
        } => {
            let retract: usize = pending_tokens.iter().map(String::len).sum();
            state.transcripts.retract_assistant_tail(
                &params.user_id,
                &params.session_id,
                &params.chat_id,
                retract,
            );
            state.transcripts.set_thinking(
                &params.user_id,
                &params.session_id,
                &params.chat_id,
                &content,
            );
            let mut out = base_event(
                "move_to_thinking",
                &params.chat_id,
                &params.session_id,
                params.instance_id.as_deref(),
            );
            out["content"] = json!(content);
            out["messageId"] = json!(message_id);
            out["pendingTokens"] = json!(pending_tokens);
            emit(state, room, tx, out);
        }
        ParserEvent::ThinkingComplete => {
            emit(
                state,
                room,
                tx,
                base_event(
                    "thinking_complete",
                    &params.chat_id,
                    &params.session_id,
                    params.instance_id.as_deref(),
                ),
            );
        }
    }
}

/// Close out the stream: settle the transcript and emit the terminal event.
fn finish_stream(
    state: &Arc<OrchestratorState>,
    params: &ChatParams,
    room: &str,
    tx: &mpsc::UnboundedSender<Value>,
    end: StreamEnd,
    total_tokens: u64,
) {
    let mut complete = base_event(
        "complete",
        &params.chat_id,
        &params.session_id,
        params.instance_id.as_deref(),
    );
    complete["total_tokens"] = json!(total_tokens);

    match end {
        StreamEnd::Completed => {
            settle_transcript(state, params, total_tokens);
            complete["completion_type"] = json!("complete");
            emit(state, room, tx, complete);
        }
        StreamEnd::TimedOut => {
            settle_transcript(state, params, total_tokens);
            complete["completion_type"] = json!("timeout");
            complete["reason"] = json!("timeout");
            emit(state, room, tx, complete);
        }
        StreamEnd::Errored => {
            settle_transcript(state, params, total_tokens);
            complete["completion_type"] = json!("error");
            complete["reason"] = json!("upstream_error");
            emit(state, room, tx, complete);
        }
        // Stop and slot-takeover paths own their terminal signalling.
        StreamEnd::Cancelled | StreamEnd::ConsumerLost => {
            debug!(
                target: "stream",
                chat_id = %params.chat_id,
                end = ?end,
                "stream closed without terminal event"
            );
        }
    }
}

/// A reply that produced tokens is finalized; a silent chat leaves no
/// incomplete tail behind.
fn settle_transcript(state: &Arc<OrchestratorState>, params: &ChatParams, total_tokens: u64) {
    if total_tokens > 0 {
        state.transcripts.finalize(
            &params.user_id,
            &params.session_id,
            &params.chat_id,
            total_tokens,
        );
    } else {
        state
            .transcripts
            .scrub_incomplete(&params.user_id, &params.session_id, &params.chat_id);
    }
}

fn error_event(params: &ChatParams, code: &str, message: &str) -> Value {
    let mut event = base_event(
        "error",
        &params.chat_id,
        &params.session_id,
        params.instance_id.as_deref(),
    );
    event["error_code"] = json!(code);
    event["content"] = json!(message);
    event
}

/// Deliver an event to the HTTP stream and mirror it to the chat room.
fn emit(
    state: &Arc<OrchestratorState>,
    room: &str,
    tx: &mpsc::UnboundedSender<Value>,
    event: Value,
) {
    state.rooms.emit(room, &event);
    let _ = tx.send(event);
}
