//! End-to-end pipeline scenarios against scripted providers
//!
//! These tests run a real session actor (store, registry, turn pipeline)
//! with deterministic ASR/LLM/TTS stand-ins and assert the envelope order
//! the tablet relies on.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use tutorlamp::config::Config;
use tutorlamp::pipeline::SessionActor;
use tutorlamp::protocol::{DoneReason, ServerPayload};
use tutorlamp::providers::{
    AsrProvider, AudioFrame, InterruptSignal, LlmEvent, LlmProvider, LlmRequest, ProviderError,
    ProviderResult, Providers, Transcription, TtsEvent, TtsProvider,
};
use tutorlamp::server::registry::{ConnectionRegistry, Outbound};
use tutorlamp::store::memory::MemoryKeyedStore;
use tutorlamp::store::SessionStore;
use tutorlamp::types::{ConversationKind, ConversationState, MessageKind, Role, SessionMeta};

const CONV_ID: i64 = 7;
const USER_ID: i64 = 42;

// ── Scripted providers ─────────────────────────────────────────────

/// Emits a fixed sequence of results, then holds the stream open until the
/// end-of-utterance sentinel arrives.
struct ScriptedAsr {
    results: Vec<Transcription>,
}

#[async_trait]
impl AsrProvider for ScriptedAsr {
    async fn transcribe_stream(
        &self,
        mut frames: mpsc::Receiver<AudioFrame>,
        _interrupt: InterruptSignal,
    ) -> ProviderResult<mpsc::Receiver<ProviderResult<Transcription>>> {
        let (tx, rx) = mpsc::channel(8);
        let script = self.results.clone();
        tokio::spawn(async move {
            for result in script {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if tx.send(Ok(result)).await.is_err() {
                    return;
                }
            }
            // Keep the session open until the driver closes the stream
            loop {
                match frames.recv().await {
                    Some(AudioFrame::End) | None => break,
                    Some(AudioFrame::Pcm(_)) => {}
                }
            }
        });
        Ok(rx)
    }
}

/// Streams fixed text chunks, then completes with a cursor.
struct ScriptedLlm {
    chunks: Vec<String>,
    cursor: Option<String>,
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn stream(
        &self,
        _request: LlmRequest,
        _interrupt: InterruptSignal,
    ) -> ProviderResult<mpsc::Receiver<ProviderResult<LlmEvent>>> {
        let (tx, rx) = mpsc::channel(16);
        let chunks = self.chunks.clone();
        let cursor = self.cursor.clone();
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(Ok(LlmEvent::Delta(chunk))).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(LlmEvent::Completed { cursor })).await;
        });
        Ok(rx)
    }
}

/// Fails to open the stream at all.
struct FailingLlm;

#[async_trait]
impl LlmProvider for FailingLlm {
    async fn stream(
        &self,
        _request: LlmRequest,
        _interrupt: InterruptSignal,
    ) -> ProviderResult<mpsc::Receiver<ProviderResult<LlmEvent>>> {
        Err(ProviderError::Stream("connection reset".into()))
    }
}

/// One sentence event, `chunks` audio buffers, one finish. Texts listed in
/// `slow_for` get a long pause before every audio buffer, which gives tests
/// a window to interrupt mid-segment.
struct ScriptedTts {
    chunks: usize,
    slow_for: Option<String>,
}

#[async_trait]
impl TtsProvider for ScriptedTts {
    async fn synthesize_stream(
        &self,
        text: &str,
        _interrupt: InterruptSignal,
    ) -> ProviderResult<mpsc::Receiver<ProviderResult<TtsEvent>>> {
        let (tx, rx) = mpsc::channel(8);
        let text = text.to_string();
        let slow = self.slow_for.as_deref() == Some(text.as_str());
        let chunks = self.chunks;
        tokio::spawn(async move {
            if tx.send(Ok(TtsEvent::SentenceStart(text))).await.is_err() {
                return;
            }
            for _ in 0..chunks {
                if slow {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                if tx.send(Ok(TtsEvent::Audio(vec![0u8; 640]))).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(TtsEvent::Finished)).await;
        });
        Ok(rx)
    }
}

// ── Harness ────────────────────────────────────────────────────────

struct Harness {
    actor: Arc<SessionActor>,
    rx: mpsc::Receiver<Outbound>,
    store: Arc<SessionStore>,
}

async fn harness(
    asr: Arc<dyn AsrProvider>,
    llm: Arc<dyn LlmProvider>,
    tts: Arc<dyn TtsProvider>,
    seed: bool,
) -> Harness {
    let config = Arc::new(Config::default());
    let store = Arc::new(SessionStore::new(Arc::new(MemoryKeyedStore::new()), &config));
    if seed {
        let meta = SessionMeta::new(USER_ID, ConversationKind::Chat);
        store.seed_session(CONV_ID, &meta, &HashMap::new()).await.unwrap();
    }
    let registry = ConnectionRegistry::new();
    let (tx, rx) = mpsc::channel(256);
    registry.admit(CONV_ID, tx, Arc::new(Notify::new()));
    let providers = Arc::new(Providers { asr, llm, tts });
    let actor = SessionActor::new(CONV_ID, USER_ID, config, store.clone(), registry, providers);
    Harness { actor, rx, store }
}

async fn recv_payload(rx: &mut mpsc::Receiver<Outbound>) -> ServerPayload {
    match tokio::time::timeout(Duration::from_secs(60), rx.recv()).await {
        Ok(Some(Outbound::Envelope(envelope))) => envelope.payload,
        other => panic!("expected an envelope, got {:?}", other),
    }
}

async fn collect_until_done(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerPayload> {
    let mut payloads = Vec::new();
    loop {
        let payload = recv_payload(rx).await;
        let is_done = matches!(payload, ServerPayload::Done { .. });
        payloads.push(payload);
        if is_done {
            return payloads;
        }
    }
}

fn delta_text(payloads: &[ServerPayload], segment: u32) -> String {
    payloads
        .iter()
        .filter_map(|p| match p {
            ServerPayload::AiTextDelta { segment_id, delta, .. } if *segment_id == segment => {
                Some(delta.as_str())
            }
            _ => None,
        })
        .collect()
}

// ── Scenarios ──────────────────────────────────────────────────────

const SOLAR_OUTPUT: [&str; 3] = [
    "[S]太阳系有八大行星。[/S][B]:::step{n=1} 行星\n",
    "水星 金星 地球 火星 木星 土星 天王星 海王星\n:::[/B]",
    "[S]它们围绕太阳旋转。[/S]",
];

#[tokio::test(start_paused = true)]
async fn test_two_segment_turn_envelope_order() {
    let mut h = harness(
        Arc::new(ScriptedAsr { results: vec![] }),
        Arc::new(ScriptedLlm {
            chunks: SOLAR_OUTPUT.iter().map(|s| s.to_string()).collect(),
            cursor: Some("resp_1".to_string()),
        }),
        Arc::new(ScriptedTts { chunks: 2, slow_for: None }),
        true,
    )
    .await;

    h.actor.clone().spawn_turn("讲讲太阳系".to_string()).await;

    let payloads = collect_until_done(&mut h.rx).await;

    assert!(matches!(
        payloads[0],
        ServerPayload::State { state: ConversationState::Processing, .. }
    ));

    let speaking_at = payloads
        .iter()
        .position(|p| matches!(p, ServerPayload::State { state: ConversationState::Speaking, .. }))
        .expect("no speaking state");
    let first_segment_at = payloads
        .iter()
        .position(|p| matches!(p, ServerPayload::SegmentStart { segment_id: 0, .. }))
        .expect("no segment 0 start");
    assert!(speaking_at < first_segment_at, "speaking must precede the first segment");

    // Segment ordering: start(0) < end(0) < board(0) < start(1) < end(1) < done
    let find = |pred: &dyn Fn(&ServerPayload) -> bool| payloads.iter().position(pred).unwrap();
    let end0 = find(&|p| matches!(p, ServerPayload::AudioEnd { segment_id: 0, .. }));
    let board0 = find(&|p| matches!(p, ServerPayload::Board { segment_id: 0, .. }));
    let start1 = find(&|p| matches!(p, ServerPayload::SegmentStart { segment_id: 1, .. }));
    let end1 = find(&|p| matches!(p, ServerPayload::AudioEnd { segment_id: 1, .. }));
    assert!(first_segment_at < end0 && end0 < board0 && board0 < start1 && start1 < end1);

    assert_eq!(delta_text(&payloads, 0), "太阳系有八大行星。");
    assert_eq!(delta_text(&payloads, 1), "它们围绕太阳旋转。");

    match &payloads[board0] {
        ServerPayload::Board { content, format, .. } => {
            assert_eq!(format, "md");
            assert_eq!(content, ":::step{n=1} 行星\n水星 金星 地球 火星 木星 土星 天王星 海王星\n:::");
        }
        _ => unreachable!(),
    }

    // Audio chunk sequences are monotone and bounded by last_seq
    for segment in [0u32, 1] {
        let mut last = None;
        let mut last_seq_reported = None;
        for p in &payloads {
            match p {
                ServerPayload::AudioChunk { segment_id, seq, format, sample_rate, .. }
                    if *segment_id == segment =>
                {
                    assert_eq!(format, "pcm_s16le");
                    assert_eq!(*sample_rate, 16000);
                    if let Some(prev) = last {
                        assert!(*seq > prev);
                    }
                    last = Some(*seq);
                }
                ServerPayload::AudioEnd { segment_id, last_seq } if *segment_id == segment => {
                    last_seq_reported = Some(*last_seq);
                }
                _ => {}
            }
        }
        assert!(last.unwrap() <= last_seq_reported.unwrap());
    }

    match payloads.last().unwrap() {
        ServerPayload::Done { total_segments, reason } => {
            assert_eq!(*total_segments, 2);
            assert_eq!(*reason, DoneReason::Completed);
        }
        _ => unreachable!(),
    }

    // Turn epilogue: back to listening
    assert!(matches!(
        recv_payload(&mut h.rx).await,
        ServerPayload::State { state: ConversationState::Listening, .. }
    ));

    // Log holds the user turn plus one consolidated assistant record, and
    // the resume cursor survived
    let log = h.store.message_log(CONV_ID).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].role, Role::User);
    assert_eq!(log[1].role, Role::Assistant);
    assert_eq!(h.store.resume_cursor(CONV_ID).await.unwrap().as_deref(), Some("resp_1"));
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_aborts_turn_exactly_once() {
    let mut h = harness(
        Arc::new(ScriptedAsr { results: vec![] }),
        Arc::new(ScriptedLlm {
            chunks: vec!["[S]第一句。[/S]".to_string(), "[S]第二句。[/S]".to_string()],
            cursor: None,
        }),
        Arc::new(ScriptedTts { chunks: 5, slow_for: Some("第二句。".to_string()) }),
        true,
    )
    .await;

    h.actor.clone().spawn_turn("随便聊聊".to_string()).await;

    // Drain until the second segment starts producing audio
    loop {
        match recv_payload(&mut h.rx).await {
            ServerPayload::AudioChunk { segment_id: 1, .. } => break,
            _ => {}
        }
    }

    // Two interrupts inside the window must behave like one
    h.actor.on_interrupt().await;
    h.actor.on_interrupt().await;

    assert!(matches!(
        recv_payload(&mut h.rx).await,
        ServerPayload::State { state: ConversationState::Listening, .. }
    ));
    match recv_payload(&mut h.rx).await {
        ServerPayload::Done { total_segments, reason } => {
            assert_eq!(total_segments, 1, "only the completed segment counts");
            assert_eq!(reason, DoneReason::Interrupted);
        }
        other => panic!("expected done, got {:?}", other),
    }

    // Nothing further arrives for the abandoned turn
    assert!(
        tokio::time::timeout(Duration::from_secs(5), h.rx.recv()).await.is_err(),
        "no envelopes may follow done"
    );

    // The abandoned turn appended no assistant message
    let log = h.store.message_log(CONV_ID).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].role, Role::User);
}

#[tokio::test(start_paused = true)]
async fn test_stable_partial_finalizes_and_runs_turn() {
    let mut h = harness(
        Arc::new(ScriptedAsr {
            results: vec![Transcription { text: "你好".to_string(), is_final: false }],
        }),
        Arc::new(ScriptedLlm { chunks: vec!["[S]你好呀。[/S]".to_string()], cursor: None }),
        Arc::new(ScriptedTts { chunks: 1, slow_for: None }),
        true,
    )
    .await;

    h.actor.clone().on_mic_start("s1").await;

    assert!(matches!(
        recv_payload(&mut h.rx).await,
        ServerPayload::State { state: ConversationState::Listening, .. }
    ));
    match recv_payload(&mut h.rx).await {
        ServerPayload::AsrPartial { stream_id, text, .. } => {
            assert_eq!(stream_id, "s1");
            assert_eq!(text, "你好");
        }
        other => panic!("expected partial, got {:?}", other),
    }

    // The partial never changes; after the stability window it is promoted
    match recv_payload(&mut h.rx).await {
        ServerPayload::AsrFinal { stream_id, text } => {
            assert_eq!(stream_id, "s1");
            assert_eq!(text, "你好");
        }
        other => panic!("expected final, got {:?}", other),
    }

    // And the turn runs to completion
    let payloads = collect_until_done(&mut h.rx).await;
    assert!(matches!(
        payloads[0],
        ServerPayload::State { state: ConversationState::Processing, .. }
    ));
    match payloads.last().unwrap() {
        ServerPayload::Done { total_segments, reason } => {
            assert_eq!(*total_segments, 1);
            assert_eq!(*reason, DoneReason::Completed);
        }
        _ => unreachable!(),
    }
    assert_eq!(delta_text(&payloads, 0), "你好呀。");
}

#[tokio::test(start_paused = true)]
async fn test_empty_stream_returns_to_listening_without_turn() {
    let mut h = harness(
        Arc::new(ScriptedAsr { results: vec![Transcription { text: String::new(), is_final: true }] }),
        Arc::new(ScriptedLlm { chunks: vec![], cursor: None }),
        Arc::new(ScriptedTts { chunks: 1, slow_for: None }),
        true,
    )
    .await;

    h.actor.clone().on_mic_start("s1").await;

    assert!(matches!(
        recv_payload(&mut h.rx).await,
        ServerPayload::State { state: ConversationState::Listening, .. }
    ));
    // The empty final is forwarded, then nothing else: no LLM turn
    assert!(matches!(recv_payload(&mut h.rx).await, ServerPayload::AsrFinal { .. }));
    assert!(tokio::time::timeout(Duration::from_secs(5), h.rx.recv()).await.is_err());
    assert!(h.store.message_log(CONV_ID).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_llm_failure_surfaces_single_error_and_done() {
    let mut h = harness(
        Arc::new(ScriptedAsr { results: vec![] }),
        Arc::new(FailingLlm),
        Arc::new(ScriptedTts { chunks: 1, slow_for: None }),
        true,
    )
    .await;

    h.actor.clone().spawn_turn("你好".to_string()).await;

    assert!(matches!(
        recv_payload(&mut h.rx).await,
        ServerPayload::State { state: ConversationState::Processing, .. }
    ));
    match recv_payload(&mut h.rx).await {
        ServerPayload::Error { code, retryable, .. } => {
            assert_eq!(code, 5001);
            assert!(retryable);
        }
        other => panic!("expected error, got {:?}", other),
    }
    match recv_payload(&mut h.rx).await {
        ServerPayload::Done { total_segments, reason } => {
            assert_eq!(total_segments, 0);
            assert_eq!(reason, DoneReason::Interrupted);
        }
        other => panic!("expected done, got {:?}", other),
    }
    assert!(matches!(
        recv_payload(&mut h.rx).await,
        ServerPayload::State { state: ConversationState::Listening, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_missing_session_speaks_apology() {
    let mut h = harness(
        Arc::new(ScriptedAsr { results: vec![] }),
        Arc::new(ScriptedLlm { chunks: vec![], cursor: None }),
        Arc::new(ScriptedTts { chunks: 1, slow_for: None }),
        false, // no seeded session
    )
    .await;

    h.actor.clone().spawn_turn("你好".to_string()).await;

    let payloads = collect_until_done(&mut h.rx).await;
    assert_eq!(delta_text(&payloads, 0), "抱歉，会话已过期，请重新开始。");
    assert!(payloads.iter().any(|p| matches!(p, ServerPayload::Board { .. })));
    match payloads.last().unwrap() {
        ServerPayload::Done { total_segments, reason } => {
            assert_eq!(*total_segments, 1);
            assert_eq!(*reason, DoneReason::Completed);
        }
        _ => unreachable!(),
    }
    assert!(matches!(
        recv_payload(&mut h.rx).await,
        ServerPayload::State { state: ConversationState::Listening, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_image_message_updates_context_and_log() {
    let h = harness(
        Arc::new(ScriptedAsr { results: vec![] }),
        Arc::new(ScriptedLlm { chunks: vec![], cursor: None }),
        Arc::new(ScriptedTts { chunks: 1, slow_for: None }),
        true,
    )
    .await;

    h.actor.on_image("https://cdn.example.com/q.png").await;

    let vars = h.store.context_vars(CONV_ID).await.unwrap();
    assert_eq!(vars.get("context_image_url").map(String::as_str), Some("https://cdn.example.com/q.png"));
    let log = h.store.message_log(CONV_ID).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].kind, MessageKind::Image);
}
