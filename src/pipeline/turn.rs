//! One assistant turn: LLM → segment parser → TTS fan-out
//!
//! The LLM token stream is fed through the segment parser; each completed
//! segment is spoken through streaming TTS while its text deltas and audio
//! chunks interleave on the wire in a fixed order per segment:
//! `segment_start`, `ai_text_delta`/`audio_chunk` (one shared sequence),
//! `audio_end`, then `board` when present. A turn ends with exactly one
//! `done` envelope and a transition back to LISTENING.
//!
//! Interrupt handling: the in-memory flag is polled between emissions, the
//! shared-store flag at segment boundaries. An interrupted turn emits no
//! further segment envelopes and appends no assistant message.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::SessionActor;
use crate::prompts::{build_question_context, render_prompt};
use crate::protocol::{DoneReason, ServerEnvelope, ERR_INTERNAL, ERR_PROVIDER};
use crate::providers::{ChatTurn, LlmEvent, LlmRequest, TtsEvent};
use crate::segment::{Segment, SegmentParser};
use crate::types::{ConversationState, MessageKind, Role};

const SESSION_EXPIRED_SPEECH: &str = "抱歉，会话已过期，请重新开始。";
const SESSION_EXPIRED_BOARD: &str = ":::note{color=yellow}\n会话已过期，请重新开始\n:::";

/// What happened while emitting one segment
enum EmitOutcome {
    Emitted,
    Interrupted,
    /// A provider failed; the error envelope has already been sent
    Failed,
}

/// How the whole turn ended
#[derive(PartialEq)]
enum TurnOutcome {
    Completed,
    Interrupted,
    Failed,
}

pub(crate) async fn run_turn(actor: Arc<SessionActor>, user_text: String) {
    let conv_id = actor.conv_id();
    info!(conv_id, "user turn: {}", user_text);

    actor.set_state(ConversationState::Processing).await;

    // The session record is the turn's ground truth; if it expired mid-turn
    // the client still gets a graceful spoken apology
    let session = match actor.store().load_session(conv_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            warn!(conv_id, "session record missing, sending apology segment");
            emit_expired_apology(&actor).await;
            return;
        }
        Err(e) => {
            error!(conv_id, "session load failed: {}", e);
            actor
                .send(ServerEnvelope::error(conv_id, ERR_INTERNAL, "内部错误，请稍后再试", false))
                .await;
            finish_turn(&actor, 0, TurnOutcome::Failed).await;
            return;
        }
    };

    // Prompt inputs: context vars, cached system prompt, trimmed history,
    // and the provider resume cursor. History is loaded before appending the
    // current user message so the prompt does not repeat it.
    let vars = actor.store().context_vars(conv_id).await.unwrap_or_default();
    let system_prompt = match actor.store().cached_prompt(conv_id).await.ok().flatten() {
        Some(prompt) => prompt,
        None => {
            let mut render_vars = vars.clone();
            render_vars
                .insert("question_context".to_string(), build_question_context(&vars));
            let prompt = render_prompt(session.kind, &render_vars);
            if let Err(e) = actor.store().cache_prompt(conv_id, &prompt).await {
                warn!(conv_id, "failed to cache prompt: {}", e);
            }
            prompt
        }
    };

    let history_limit = actor.config().pipeline.history_limit;
    let history: Vec<ChatTurn> = actor
        .store()
        .recent_text_history(conv_id, history_limit)
        .await
        .unwrap_or_default()
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            ChatTurn::new(role, &m.content)
        })
        .collect();
    let resume_cursor = actor.store().resume_cursor(conv_id).await.ok().flatten();

    if let Err(e) = actor
        .store()
        .append_message(conv_id, Role::User, MessageKind::Text, &user_text)
        .await
    {
        warn!(conv_id, "failed to append user message: {}", e);
    }

    let request = LlmRequest {
        system_prompt,
        history,
        user_turn: user_text,
        resume_cursor,
    };

    let mut events = match actor.providers().llm.stream(request, actor.turn_interrupt().clone()).await {
        Ok(events) => events,
        Err(e) => {
            error!(conv_id, "LLM stream failed to open: {}", e);
            actor
                .send(ServerEnvelope::error(conv_id, ERR_PROVIDER, &format!("处理消息时出错: {}", e), e.retryable()))
                .await;
            finish_turn(&actor, 0, TurnOutcome::Failed).await;
            return;
        }
    };

    let mut parser = SegmentParser::new();
    let mut emitted: u32 = 0;
    let mut full_text = String::new();
    let mut new_cursor: Option<String> = None;
    let mut outcome = TurnOutcome::Completed;

    'llm: while let Some(event) = events.recv().await {
        if actor.turn_interrupt().is_raised() {
            outcome = TurnOutcome::Interrupted;
            break;
        }
        match event {
            Ok(LlmEvent::Delta(delta)) => {
                full_text.push_str(&delta);
                for segment in parser.feed(&delta) {
                    match emit_segment(&actor, &segment).await {
                        EmitOutcome::Emitted => emitted += 1,
                        EmitOutcome::Interrupted => {
                            outcome = TurnOutcome::Interrupted;
                            break 'llm;
                        }
                        EmitOutcome::Failed => {
                            outcome = TurnOutcome::Failed;
                            break 'llm;
                        }
                    }
                }
            }
            Ok(LlmEvent::Completed { cursor }) => {
                new_cursor = cursor;
                break;
            }
            Err(e) => {
                error!(conv_id, "LLM stream error: {}", e);
                actor
                    .send(ServerEnvelope::error(conv_id, ERR_PROVIDER, &format!("处理消息时出错: {}", e), e.retryable()))
                    .await;
                outcome = TurnOutcome::Failed;
                break;
            }
        }
    }

    // Flush a trailing segment the stream ended inside of
    if outcome == TurnOutcome::Completed {
        if let Some(segment) = parser.finalize() {
            match emit_segment(&actor, &segment).await {
                EmitOutcome::Emitted => emitted += 1,
                EmitOutcome::Interrupted => outcome = TurnOutcome::Interrupted,
                EmitOutcome::Failed => outcome = TurnOutcome::Failed,
            }
        }
    }

    if outcome == TurnOutcome::Completed {
        if !full_text.trim().is_empty() {
            if let Err(e) = actor
                .store()
                .append_message(conv_id, Role::Assistant, MessageKind::Text, &full_text)
                .await
            {
                warn!(conv_id, "failed to append assistant message: {}", e);
            }
        }
        if let Some(cursor) = &new_cursor {
            if let Err(e) = actor.store().save_resume_cursor(conv_id, cursor).await {
                warn!(conv_id, "failed to save resume cursor: {}", e);
            }
        }
    } else {
        debug!(conv_id, "turn abandoned, assistant message not appended");
    }

    finish_turn(&actor, emitted, outcome).await;
}

/// Emit the single `done`, settle state, and clear both interrupt tiers.
async fn finish_turn(actor: &Arc<SessionActor>, total_segments: u32, outcome: TurnOutcome) {
    let conv_id = actor.conv_id();
    let reason = match outcome {
        TurnOutcome::Completed => DoneReason::Completed,
        TurnOutcome::Interrupted | TurnOutcome::Failed => DoneReason::Interrupted,
    };
    actor.send(ServerEnvelope::done(conv_id, total_segments, reason)).await;
    actor.set_state(ConversationState::Listening).await;
    let _ = actor.store().set_tts_playing(conv_id, false).await;
    actor.turn_interrupt().clear();
    let _ = actor.store().clear_interrupt(conv_id).await;
}

/// Speak one segment: stream TTS over its speech text, interleaving text
/// deltas and audio chunks on one sequence, then close with `audio_end` and
/// the optional `board`.
async fn emit_segment(actor: &Arc<SessionActor>, segment: &Segment) -> EmitOutcome {
    let conv_id = actor.conv_id();

    // Segment boundary: the shared-store checkpoint
    if actor.turn_interrupted().await {
        return EmitOutcome::Interrupted;
    }

    if actor.state() != ConversationState::Speaking {
        actor.set_state(ConversationState::Speaking).await;
        let _ = actor.store().set_tts_playing(conv_id, true).await;
    }

    actor.send(ServerEnvelope::segment_start(conv_id, segment.id)).await;

    let tts_timeout = Duration::from_secs(actor.config().pipeline.tts_event_timeout_secs);
    let mut seq: u64 = 0;

    match actor
        .providers()
        .tts
        .synthesize_stream(&segment.speech, actor.turn_interrupt().clone())
        .await
    {
        Err(e) => {
            error!(conv_id, segment_id = segment.id, "TTS failed to open: {}", e);
            actor
                .send(ServerEnvelope::error(conv_id, ERR_PROVIDER, &format!("语音合成出错: {}", e), e.retryable()))
                .await;
            return EmitOutcome::Failed;
        }
        Ok(mut events) => loop {
            let event = match timeout(tts_timeout, events.recv()).await {
                Err(_) => {
                    actor
                        .send(ServerEnvelope::error(conv_id, ERR_PROVIDER, "语音合成超时", true))
                        .await;
                    return EmitOutcome::Failed;
                }
                Ok(None) => break,
                Ok(Some(event)) => event,
            };
            // Poll the in-memory flag before every emission
            if actor.turn_interrupt().is_raised() {
                return EmitOutcome::Interrupted;
            }
            match event {
                Ok(TtsEvent::SentenceStart(text)) => {
                    actor.send(ServerEnvelope::ai_text_delta(conv_id, segment.id, seq, &text)).await;
                    seq += 1;
                }
                Ok(TtsEvent::Audio(pcm)) => {
                    actor.send(ServerEnvelope::audio_chunk(conv_id, segment.id, seq, &pcm)).await;
                    actor.stamp_tts_chunk();
                    seq += 1;
                }
                Ok(TtsEvent::Finished) => break,
                Err(e) => {
                    error!(conv_id, segment_id = segment.id, "TTS stream error: {}", e);
                    actor
                        .send(ServerEnvelope::error(conv_id, ERR_PROVIDER, &format!("语音合成出错: {}", e), e.retryable()))
                        .await;
                    return EmitOutcome::Failed;
                }
            }
        },
    }

    actor.send(ServerEnvelope::audio_end(conv_id, segment.id, seq.saturating_sub(1))).await;
    if !segment.board.is_empty() {
        actor.send(ServerEnvelope::board(conv_id, segment.id, &segment.board)).await;
    }
    EmitOutcome::Emitted
}

/// The session record vanished mid-turn: keep the client UX graceful with a
/// synthetic spoken apology, a note on the board, and a normal close.
async fn emit_expired_apology(actor: &Arc<SessionActor>) {
    let conv_id = actor.conv_id();
    actor.set_state(ConversationState::Speaking).await;
    actor.send(ServerEnvelope::segment_start(conv_id, 0)).await;
    actor.send(ServerEnvelope::ai_text_delta(conv_id, 0, 0, SESSION_EXPIRED_SPEECH)).await;
    actor.send(ServerEnvelope::audio_end(conv_id, 0, 0)).await;
    actor.send(ServerEnvelope::board(conv_id, 0, SESSION_EXPIRED_BOARD)).await;
    actor.send(ServerEnvelope::done(conv_id, 1, DoneReason::Completed)).await;
    actor.set_state(ConversationState::Listening).await;
    actor.turn_interrupt().clear();
}
