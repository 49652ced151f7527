//! Voice activity detection and barge-in
//!
//! Energy-based, per-frame analysis with an adaptive noise floor. Two
//! regimes per frame:
//!
//! - While the assistant audio may be leaking back through the mic (the
//!   playback-echo window), only a sustained loud burst counts: frames above
//!   the barge-in threshold accumulate until they cover the minimum barge-in
//!   time, everything else is dropped before it reaches ASR.
//! - Outside the echo window every frame is admitted, speech onset zeroes
//!   the trailing-silence clock, and enough silence after speech closes the
//!   utterance.

use serde::{Deserialize, Serialize};

/// Noise-floor IIR coefficient applied when the frame is quieter than the floor
const FLOOR_ATTACK: f32 = 0.98;
/// Noise-floor IIR coefficient applied when the frame is louder than the floor
const FLOOR_DECAY: f32 = 0.995;

/// VAD tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// dB above the noise floor that counts as speech
    #[serde(default = "default_speech_db")]
    pub speech_db: f32,
    /// dB above the noise floor that counts as barge-in during playback echo
    #[serde(default = "default_barge_in_db")]
    pub barge_in_db: f32,
    /// Sustained loud time required to raise a barge-in
    #[serde(default = "default_barge_in_min_ms")]
    pub barge_in_min_ms: u64,
    /// Trailing silence that closes an utterance
    #[serde(default = "default_end_silence_ms")]
    pub end_silence_ms: u64,
    /// How long after the last TTS chunk the echo window stays open
    #[serde(default = "default_playback_echo_window_ms")]
    pub playback_echo_window_ms: u64,
}

fn default_speech_db() -> f32 {
    10.0
}

fn default_barge_in_db() -> f32 {
    15.0
}

fn default_barge_in_min_ms() -> u64 {
    200
}

fn default_end_silence_ms() -> u64 {
    1500
}

fn default_playback_echo_window_ms() -> u64 {
    1200
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            speech_db: default_speech_db(),
            barge_in_db: default_barge_in_db(),
            barge_in_min_ms: default_barge_in_min_ms(),
            end_silence_ms: default_end_silence_ms(),
            playback_echo_window_ms: default_playback_echo_window_ms(),
        }
    }
}

/// What to do with one incoming frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    /// Feed the frame to ASR; `end_of_utterance` marks the silence endpoint
    Admit { end_of_utterance: bool },
    /// Playback-echo frame, do not feed ASR
    Drop,
    /// Sustained user speech over assistant playback; cancel the turn and
    /// admit the frame
    BargeIn,
}

/// Per-session VAD state
#[derive(Debug)]
pub struct VadState {
    config: VadConfig,
    in_speech: bool,
    silence_ms: u64,
    noise_floor_db: f32,
    barge_in_ms: u64,
}

impl VadState {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            in_speech: false,
            silence_ms: 0,
            // Start well below speech level; quiet frames pull it to the room
            noise_floor_db: -60.0,
            barge_in_ms: 0,
        }
    }

    /// Analyze one PCM frame (s16le mono).
    ///
    /// `frame_ms` is the frame's duration, `echo_window` is true while the
    /// session is speaking or a TTS chunk went out recently. Barge-in wins
    /// over end-of-utterance when both could fire in the same frame: inside
    /// the echo window the silence clock never advances.
    pub fn process_frame(&mut self, pcm: &[u8], frame_ms: u64, echo_window: bool) -> FrameDecision {
        let rms_db = rms_db(pcm);

        let coeff = if rms_db < self.noise_floor_db { FLOOR_ATTACK } else { FLOOR_DECAY };
        self.noise_floor_db = coeff * self.noise_floor_db + (1.0 - coeff) * rms_db;

        if echo_window {
            if rms_db > self.noise_floor_db + self.config.barge_in_db {
                self.barge_in_ms += frame_ms;
                if self.barge_in_ms >= self.config.barge_in_min_ms {
                    self.barge_in_ms = 0;
                    self.in_speech = true;
                    self.silence_ms = 0;
                    return FrameDecision::BargeIn;
                }
            } else {
                self.barge_in_ms = 0;
            }
            return FrameDecision::Drop;
        }

        self.barge_in_ms = 0;

        if rms_db > self.noise_floor_db + self.config.speech_db {
            self.in_speech = true;
            self.silence_ms = 0;
            FrameDecision::Admit { end_of_utterance: false }
        } else if self.in_speech {
            self.silence_ms += frame_ms;
            if self.silence_ms >= self.config.end_silence_ms {
                self.in_speech = false;
                self.silence_ms = 0;
                FrameDecision::Admit { end_of_utterance: true }
            } else {
                FrameDecision::Admit { end_of_utterance: false }
            }
        } else {
            FrameDecision::Admit { end_of_utterance: false }
        }
    }

    /// Reset for a fresh audio stream; the learned noise floor is kept.
    pub fn reset(&mut self) {
        self.in_speech = false;
        self.silence_ms = 0;
        self.barge_in_ms = 0;
    }

    pub fn noise_floor_db(&self) -> f32 {
        self.noise_floor_db
    }

    pub fn in_speech(&self) -> bool {
        self.in_speech
    }
}

/// RMS energy of an s16le frame in dBFS, clamped at -100.
fn rms_db(pcm: &[u8]) -> f32 {
    if pcm.len() < 2 {
        return -100.0;
    }
    let sum_sq: f64 = pcm
        .chunks_exact(2)
        .map(|c| {
            let s = i16::from_le_bytes([c[0], c[1]]) as f64 / 32768.0;
            s * s
        })
        .sum();
    let rms = (sum_sq / (pcm.len() / 2) as f64).sqrt() as f32;
    (20.0 * rms.log10()).max(-100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(amplitude: i16, samples: usize) -> Vec<u8> {
        let mut pcm = Vec::with_capacity(samples * 2);
        for i in 0..samples {
            // Square wave keeps RMS equal to the amplitude
            let s = if i % 2 == 0 { amplitude } else { -amplitude };
            pcm.extend_from_slice(&s.to_le_bytes());
        }
        pcm
    }

    // 20ms at 16kHz
    const FRAME_SAMPLES: usize = 320;
    const FRAME_MS: u64 = 20;

    fn settled(config: VadConfig) -> VadState {
        let mut vad = VadState::new(config);
        // Settle the noise floor on quiet room tone
        for _ in 0..100 {
            vad.process_frame(&frame(30, FRAME_SAMPLES), FRAME_MS, false);
        }
        vad
    }

    #[test]
    fn test_quiet_frames_admitted_without_endpoint() {
        let mut vad = settled(VadConfig::default());
        let decision = vad.process_frame(&frame(30, FRAME_SAMPLES), FRAME_MS, false);
        assert_eq!(decision, FrameDecision::Admit { end_of_utterance: false });
        assert!(!vad.in_speech());
    }

    #[test]
    fn test_speech_then_silence_fires_endpoint() {
        let mut vad = settled(VadConfig::default());

        for _ in 0..10 {
            let d = vad.process_frame(&frame(8000, FRAME_SAMPLES), FRAME_MS, false);
            assert_eq!(d, FrameDecision::Admit { end_of_utterance: false });
        }
        assert!(vad.in_speech());

        // 1500ms of silence = 75 frames of 20ms; the endpoint fires on the last
        let mut endpoint_at = None;
        for i in 0..80 {
            match vad.process_frame(&frame(30, FRAME_SAMPLES), FRAME_MS, false) {
                FrameDecision::Admit { end_of_utterance: true } => {
                    endpoint_at = Some(i);
                    break;
                }
                FrameDecision::Admit { .. } => {}
                other => panic!("unexpected decision: {:?}", other),
            }
        }
        assert_eq!(endpoint_at, Some(74));
    }

    #[test]
    fn test_echo_window_drops_soft_frames() {
        let mut vad = settled(VadConfig::default());
        let d = vad.process_frame(&frame(100, FRAME_SAMPLES), FRAME_MS, true);
        assert_eq!(d, FrameDecision::Drop);
    }

    #[test]
    fn test_barge_in_requires_sustained_loudness() {
        let mut vad = settled(VadConfig::default());

        // 200ms minimum at 20ms frames = 10 loud frames; the 10th raises it
        for i in 0..9 {
            let d = vad.process_frame(&frame(20000, FRAME_SAMPLES), FRAME_MS, true);
            assert_eq!(d, FrameDecision::Drop, "frame {} should still be dropped", i);
        }
        let d = vad.process_frame(&frame(20000, FRAME_SAMPLES), FRAME_MS, true);
        assert_eq!(d, FrameDecision::BargeIn);
    }

    #[test]
    fn test_soft_frame_resets_barge_in_streak() {
        let mut vad = settled(VadConfig::default());

        for _ in 0..9 {
            vad.process_frame(&frame(20000, FRAME_SAMPLES), FRAME_MS, true);
        }
        // One soft frame zeroes the streak
        vad.process_frame(&frame(100, FRAME_SAMPLES), FRAME_MS, true);
        for _ in 0..9 {
            let d = vad.process_frame(&frame(20000, FRAME_SAMPLES), FRAME_MS, true);
            assert_eq!(d, FrameDecision::Drop);
        }
        let d = vad.process_frame(&frame(20000, FRAME_SAMPLES), FRAME_MS, true);
        assert_eq!(d, FrameDecision::BargeIn);
    }

    #[test]
    fn test_rms_db_monotone() {
        let soft = rms_db(&frame(100, FRAME_SAMPLES));
        let loud = rms_db(&frame(10000, FRAME_SAMPLES));
        assert!(loud > soft);
        assert_eq!(rms_db(&[]), -100.0);
    }
}
