//! Per-session pipeline orchestrator
//!
//! One [`SessionActor`] owns everything a live conversation needs in process
//! memory: the FSM state, the audio-frame channel and ASR worker, VAD state,
//! the last-TTS timestamp, and the turn task. It is constructed on admit and
//! destroyed on disconnect, so a disorderly close cannot leave orphaned
//! state behind. Cross-connection continuity lives in the shared keyed
//! store; this actor rebuilds from it on every fresh connection.
//!
//! ```text
//!   IDLE ──mic_start──▶ LISTENING ──asr final──▶ PROCESSING
//!     │                     ▲                        │ first segment
//!     └──initial message────┼────────────────────────▼
//!                           └──done / interrupt── SPEAKING
//! ```

pub mod turn;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::protocol::{AudioParams, ServerEnvelope, ERR_MALFORMED, ERR_PROVIDER};
use crate::providers::{AudioFrame, InterruptSignal, Providers};
use crate::server::registry::ConnectionRegistry;
use crate::store::SessionStore;
use crate::types::{ConversationState, MessageKind, Role};
use crate::vad::{FrameDecision, VadState};

/// How often the ASR driver wakes to check partial stability
const PARTIAL_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// One live microphone burst: its frame channel and recognition worker
struct ActiveStream {
    id: String,
    frames: mpsc::Sender<AudioFrame>,
    /// Cancellation for this stream's ASR worker only; the turn keeps its
    /// own signal so a superseded stream cannot kill an unrelated turn
    interrupt: InterruptSignal,
    worker: JoinHandle<()>,
}

/// Owns all in-memory state for one live conversation.
pub struct SessionActor {
    conv_id: i64,
    user_id: i64,
    config: Arc<Config>,
    store: Arc<SessionStore>,
    registry: Arc<ConnectionRegistry>,
    providers: Arc<Providers>,
    fsm: Mutex<ConversationState>,
    /// Cancels the in-flight LLM/TTS turn; polled between emissions
    turn_interrupt: InterruptSignal,
    vad: Mutex<VadState>,
    last_tts_chunk: Mutex<Option<Instant>>,
    stream: Mutex<Option<ActiveStream>>,
    turn: Mutex<Option<JoinHandle<()>>>,
    listening_since: Mutex<Option<Instant>>,
    /// Audio arriving before this instant is dropped (post-finalization grace)
    forced_end_until: Mutex<Option<Instant>>,
}

impl SessionActor {
    pub fn new(
        conv_id: i64,
        user_id: i64,
        config: Arc<Config>,
        store: Arc<SessionStore>,
        registry: Arc<ConnectionRegistry>,
        providers: Arc<Providers>,
    ) -> Arc<Self> {
        let vad = VadState::new(config.vad.clone());
        Arc::new(Self {
            conv_id,
            user_id,
            config,
            store,
            registry,
            providers,
            fsm: Mutex::new(ConversationState::Idle),
            turn_interrupt: InterruptSignal::new(),
            vad: Mutex::new(vad),
            last_tts_chunk: Mutex::new(None),
            stream: Mutex::new(None),
            turn: Mutex::new(None),
            listening_since: Mutex::new(None),
            forced_end_until: Mutex::new(None),
        })
    }

    pub fn conv_id(&self) -> i64 {
        self.conv_id
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub(crate) fn store(&self) -> &SessionStore {
        &self.store
    }

    pub(crate) fn providers(&self) -> &Providers {
        &self.providers
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn turn_interrupt(&self) -> &InterruptSignal {
        &self.turn_interrupt
    }

    pub fn state(&self) -> ConversationState {
        *self.fsm.lock().expect("fsm lock poisoned")
    }

    /// Send one envelope over this session's connection.
    pub(crate) async fn send(&self, envelope: ServerEnvelope) -> bool {
        self.registry.send(self.conv_id, envelope).await
    }

    /// Transition the FSM. Announces the change to the client and mirrors it
    /// into the shared store; a no-op transition emits nothing.
    pub async fn set_state(&self, next: ConversationState) {
        {
            let mut fsm = self.fsm.lock().expect("fsm lock poisoned");
            if *fsm == next {
                return;
            }
            *fsm = next;
        }
        {
            let mut since = self.listening_since.lock().expect("lock poisoned");
            *since = (next == ConversationState::Listening).then(Instant::now);
        }
        debug!(conv_id = self.conv_id, state = next.as_str(), "state change");
        if let Err(e) = self.store.set_state(self.conv_id, next).await {
            warn!(conv_id = self.conv_id, "failed to mirror state: {}", e);
        }
        self.send(ServerEnvelope::state(self.conv_id, next)).await;
    }

    /// Announce the current state without requiring a transition; used right
    /// after admit so the client always sees an initial `state` envelope.
    pub async fn announce_state(&self) {
        let state = self.state();
        if let Err(e) = self.store.set_state(self.conv_id, state).await {
            warn!(conv_id = self.conv_id, "failed to mirror state: {}", e);
        }
        if state == ConversationState::Listening {
            *self.listening_since.lock().expect("lock poisoned") = Some(Instant::now());
        }
        self.send(ServerEnvelope::state(self.conv_id, state)).await;
    }

    // ── Client envelope handlers ─────────────────────────────────

    pub async fn on_ping(&self) {
        let _ = self.store.touch_last_active(self.conv_id).await;
        self.send(ServerEnvelope::pong(self.conv_id)).await;
    }

    pub async fn on_client_hello(&self, audio: AudioParams) {
        debug!(
            conv_id = self.conv_id,
            format = %audio.format,
            sample_rate = audio.sample_rate,
            frame_ms = audio.frame_ms,
            "client hello"
        );
        let _ = self.store.touch_last_active(self.conv_id).await;
    }

    /// Open a fresh audio stream, superseding any prior one. A mic start
    /// while the assistant is mid-turn counts as the user cutting in.
    pub async fn on_mic_start(self: Arc<Self>, stream_id: &str) {
        info!(conv_id = self.conv_id, stream_id, "mic start");
        let _ = self.store.touch_last_active(self.conv_id).await;
        let turn_active = {
            let turn = self.turn.lock().expect("turn lock poisoned");
            turn.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
        };
        if turn_active {
            // The aborted turn clears both interrupt tiers on its way out
            self.interrupt_turn().await;
        } else {
            self.turn_interrupt.clear();
            let _ = self.store.clear_interrupt(self.conv_id).await;
        }
        self.vad.lock().expect("vad lock poisoned").reset();
        *self.forced_end_until.lock().expect("lock poisoned") = None;
        self.start_stream(stream_id).await;
    }

    /// Route one audio frame through VAD and into the recognition stream.
    pub async fn on_audio_chunk(self: Arc<Self>, stream_id: &str, seq: u64, data_b64: &str) {
        let conv_id = self.conv_id;
        let _ = self.store.touch_last_active(conv_id).await;

        if self.forced_end_active() {
            return;
        }

        let pcm = match BASE64.decode(data_b64) {
            Ok(pcm) if !pcm.is_empty() => pcm,
            Ok(_) => return,
            Err(e) => {
                debug!(conv_id = self.conv_id, seq, "bad audio payload: {}", e);
                self.send(ServerEnvelope::error(self.conv_id, ERR_MALFORMED, "Invalid audio data", true))
                    .await;
                return;
            }
        };

        // Each audio arrival restarts the listening clock
        if self.state() == ConversationState::Listening {
            *self.listening_since.lock().expect("lock poisoned") = Some(Instant::now());
        }

        let frame_ms = ((pcm.len() as u64 / 2) * 1000 / 16000).max(1);
        let echo_window = self.in_echo_window();
        let decision = self
            .vad
            .lock()
            .expect("vad lock poisoned")
            .process_frame(&pcm, frame_ms, echo_window);

        match decision {
            FrameDecision::Drop => {}
            FrameDecision::BargeIn => {
                info!(conv_id, stream_id, "barge-in detected");
                self.interrupt_turn().await;
                let frames = self.ensure_stream(stream_id).await;
                let _ = frames.send(AudioFrame::Pcm(pcm)).await;
            }
            FrameDecision::Admit { end_of_utterance } => {
                let frames = self.ensure_stream(stream_id).await;
                let _ = frames.send(AudioFrame::Pcm(pcm)).await;
                if end_of_utterance {
                    debug!(conv_id, stream_id, "end of utterance");
                    let _ = frames.send(AudioFrame::End).await;
                }
            }
        }
    }

    pub async fn on_mic_end(&self, stream_id: &str, last_seq: u64) {
        debug!(conv_id = self.conv_id, stream_id, last_seq, "mic end");
        let _ = self.store.touch_last_active(self.conv_id).await;
        let frames = {
            let guard = self.stream.lock().expect("stream lock poisoned");
            guard.as_ref().filter(|s| s.id == stream_id).map(|s| s.frames.clone())
        };
        if let Some(frames) = frames {
            let _ = frames.send(AudioFrame::End).await;
        }
    }

    /// Mid-session image: stored as a context variable for the next prompt
    /// and appended to the log as a user image message.
    pub async fn on_image(&self, image_url: &str) {
        let _ = self.store.touch_last_active(self.conv_id).await;
        if let Err(e) = self.store.set_context_image(self.conv_id, image_url).await {
            warn!(conv_id = self.conv_id, "failed to store image context: {}", e);
        }
        let _ = self
            .store
            .append_message(self.conv_id, Role::User, MessageKind::Image, image_url)
            .await;
    }

    /// Explicit client interrupt: abort the turn and tear down the stream.
    pub async fn on_interrupt(&self) {
        info!(conv_id = self.conv_id, "interrupt received");
        let _ = self.store.touch_last_active(self.conv_id).await;
        self.interrupt_turn().await;
        let stream = self.stream.lock().expect("stream lock poisoned").take();
        if let Some(stream) = stream {
            stream.interrupt.raise();
            let _ = stream.frames.try_send(AudioFrame::End);
            stream.worker.abort();
        }
    }

    /// Raise both interrupt tiers and flip to LISTENING. Idempotent: the
    /// in-flight turn emits its single `done{interrupted}` when it notices.
    async fn interrupt_turn(&self) {
        self.turn_interrupt.raise();
        if let Err(e) = self.store.set_interrupt(self.conv_id).await {
            warn!(conv_id = self.conv_id, "failed to set shared interrupt: {}", e);
        }
        let _ = self.store.set_tts_playing(self.conv_id, false).await;
        self.set_state(ConversationState::Listening).await;
    }

    // ── Timers ───────────────────────────────────────────────────

    pub fn listening_timed_out(&self) -> bool {
        if self.state() != ConversationState::Listening {
            return false;
        }
        let since = self.listening_since.lock().expect("lock poisoned");
        since
            .map(|t| t.elapsed() >= Duration::from_secs(self.config.pipeline.listening_timeout_secs))
            .unwrap_or(false)
    }

    fn in_echo_window(&self) -> bool {
        if self.state() == ConversationState::Speaking {
            return true;
        }
        let last = self.last_tts_chunk.lock().expect("lock poisoned");
        last.map(|t| t.elapsed() < Duration::from_millis(self.config.vad.playback_echo_window_ms))
            .unwrap_or(false)
    }

    pub(crate) fn stamp_tts_chunk(&self) {
        *self.last_tts_chunk.lock().expect("lock poisoned") = Some(Instant::now());
    }

    fn forced_end_active(&self) -> bool {
        let until = self.forced_end_until.lock().expect("lock poisoned");
        until.map(|t| Instant::now() < t).unwrap_or(false)
    }

    fn set_forced_end_grace(&self) {
        let grace = Duration::from_millis(self.config.pipeline.forced_end_grace_ms);
        *self.forced_end_until.lock().expect("lock poisoned") = Some(Instant::now() + grace);
    }

    /// Whether the current turn should stop: checks the in-memory flag plus
    /// the shared-store flag (the cross-connection tier).
    pub(crate) async fn turn_interrupted(&self) -> bool {
        if self.turn_interrupt.is_raised() {
            return true;
        }
        self.store.check_interrupt(self.conv_id).await.unwrap_or(false)
    }

    // ── Stream and turn lifecycle ────────────────────────────────

    /// Frame sender for `stream_id`, reviving the worker if it already
    /// finished (e.g. admitting barge-in audio after a forced final).
    async fn ensure_stream(self: Arc<Self>, stream_id: &str) -> mpsc::Sender<AudioFrame> {
        {
            let guard = self.stream.lock().expect("stream lock poisoned");
            if let Some(stream) = guard.as_ref() {
                if stream.id == stream_id && !stream.worker.is_finished() {
                    return stream.frames.clone();
                }
            }
        }
        self.start_stream(stream_id).await
    }

    async fn start_stream(self: Arc<Self>, stream_id: &str) -> mpsc::Sender<AudioFrame> {
        // Tear down the old stream before wiring the new one
        let old = self.stream.lock().expect("stream lock poisoned").take();
        if let Some(old) = old {
            debug!(conv_id = self.conv_id, old_stream = %old.id, "superseding audio stream");
            old.interrupt.raise();
            let _ = old.frames.try_send(AudioFrame::End);
            old.worker.abort();
        }

        let (frames_tx, frames_rx) = mpsc::channel(128);
        let interrupt = InterruptSignal::new();
        let worker = tokio::spawn(run_asr_worker(
            self.clone(),
            stream_id.to_string(),
            frames_rx,
            interrupt.clone(),
        ));
        *self.stream.lock().expect("stream lock poisoned") = Some(ActiveStream {
            id: stream_id.to_string(),
            frames: frames_tx.clone(),
            interrupt,
            worker,
        });
        // A stream revived mid-turn (frames admitted while the assistant is
        // processing or speaking) must not yank the FSM out of the turn
        if matches!(self.state(), ConversationState::Idle | ConversationState::Listening) {
            self.set_state(ConversationState::Listening).await;
        }
        frames_tx
    }

    /// Run one assistant turn for a finalized user utterance. Waits for any
    /// previous turn to wind down first so envelopes never interleave.
    pub async fn spawn_turn(self: Arc<Self>, user_text: String) {
        let previous = self.turn.lock().expect("turn lock poisoned").take();
        if let Some(handle) = previous {
            if !handle.is_finished() {
                let _ = handle.await;
            }
        }
        let actor = self.clone();
        let handle = tokio::spawn(async move {
            turn::run_turn(actor, user_text).await;
        });
        *self.turn.lock().expect("turn lock poisoned") = Some(handle);
    }

    /// Tear down every task this session owns.
    pub async fn shutdown(&self) {
        self.turn_interrupt.raise();
        let stream = self.stream.lock().expect("stream lock poisoned").take();
        if let Some(stream) = stream {
            stream.interrupt.raise();
            let _ = stream.frames.try_send(AudioFrame::End);
            stream.worker.abort();
        }
        let turn = self.turn.lock().expect("turn lock poisoned").take();
        if let Some(turn) = turn {
            turn.abort();
        }
        debug!(conv_id = self.conv_id, "session actor shut down");
    }

    fn clear_stream_entry(&self, stream_id: &str) {
        let mut guard = self.stream.lock().expect("stream lock poisoned");
        if guard.as_ref().map(|s| s.id == stream_id).unwrap_or(false) {
            *guard = None;
        }
    }
}

/// Drive one recognition stream: forward results to the client, finalize on
/// a stable partial, and hand the final transcript to the turn pipeline.
async fn run_asr_worker(
    actor: Arc<SessionActor>,
    stream_id: String,
    frames: mpsc::Receiver<AudioFrame>,
    interrupt: InterruptSignal,
) {
    let conv_id = actor.conv_id();
    let stable_after = Duration::from_millis(actor.config().pipeline.partial_stable_ms);

    let mut results = match actor.providers().asr.transcribe_stream(frames, interrupt.clone()).await {
        Ok(results) => results,
        Err(e) => {
            warn!(conv_id, %stream_id, "ASR session failed to open: {}", e);
            actor
                .send(ServerEnvelope::error(conv_id, ERR_PROVIDER, &format!("语音识别出错: {}", e), e.retryable()))
                .await;
            actor.set_state(ConversationState::Listening).await;
            actor.clear_stream_entry(&stream_id);
            return;
        }
    };

    let mut latest_partial: Option<String> = None;
    let mut last_change = Instant::now();
    let mut final_text: Option<String> = None;

    loop {
        if interrupt.is_raised() {
            break;
        }
        match timeout(PARTIAL_CHECK_INTERVAL, results.recv()).await {
            Err(_) => {
                // No new hypothesis; a partial that stopped changing counts
                // as final once it has been stable long enough
                if let Some(text) = latest_partial.clone() {
                    if !text.is_empty()
                        && !actor.forced_end_active()
                        && last_change.elapsed() >= stable_after
                    {
                        info!(conv_id, %stream_id, "partial stable, forcing final: {}", text);
                        actor.send(ServerEnvelope::asr_final(conv_id, &stream_id, &text)).await;
                        actor.set_forced_end_grace();
                        if let Some(stream) = actor.stream.lock().expect("stream lock poisoned").as_ref() {
                            let _ = stream.frames.try_send(AudioFrame::End);
                        }
                        final_text = Some(text);
                        break;
                    }
                }
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                warn!(conv_id, %stream_id, "ASR stream error: {}", e);
                actor
                    .send(ServerEnvelope::error(conv_id, ERR_PROVIDER, &format!("语音识别出错: {}", e), e.retryable()))
                    .await;
                actor.set_state(ConversationState::Listening).await;
                actor.clear_stream_entry(&stream_id);
                return;
            }
            Ok(Some(Ok(result))) => {
                if result.is_final {
                    actor.send(ServerEnvelope::asr_final(conv_id, &stream_id, &result.text)).await;
                    final_text = Some(result.text);
                    break;
                }
                actor.send(ServerEnvelope::asr_partial(conv_id, &stream_id, &result.text)).await;
                if latest_partial.as_deref() != Some(result.text.as_str()) {
                    latest_partial = Some(result.text);
                    last_change = Instant::now();
                }
            }
        }
    }

    actor.clear_stream_entry(&stream_id);

    match final_text.filter(|t| !t.trim().is_empty()) {
        Some(text) => actor.spawn_turn(text).await,
        None => {
            debug!(conv_id, %stream_id, "stream ended with no transcript");
            actor.set_state(ConversationState::Listening).await;
        }
    }
}
