//! Speaking detection for remote audio.
//!
//! Each remote peer gets one sampling task that reads the peer's PCM tap,
//! reduces it to Web Audio style byte frequency data and debounces the
//! resulting volume into a speaking flag.

use parking_lot::Mutex;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::media::{PcmTap, RemoteStream, PCM_WINDOW};

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

const SPEAKING_THRESHOLD_DB: f32 = -30.0;
const NOISE_THRESHOLD: f32 = 5.0;
const SPEAKING_FRAMES: u32 = 2;
const SILENT_FRAMES: u32 = 5;

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;
const SMOOTHING: f32 = 0.8;

pub type SpeakingHandler = Arc<dyn Fn(bool) + Send + Sync>;

/// Byte frequency data over a fixed PCM window, scaled like an `AnalyserNode`.
pub struct FrequencyAnalyser {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    buffer: Vec<Complex<f32>>,
}

impl FrequencyAnalyser {
    pub fn new(size: usize) -> Self {
        let fft = FftPlanner::new().plan_fft_forward(size);
        // Blackman window
        let window = (0..size)
            .map(|i| {
                let x = 2.0 * std::f32::consts::PI * i as f32 / size as f32;
                0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
            })
            .collect();
        Self {
            fft,
            window,
            smoothed: vec![0.0; size / 2],
            buffer: Vec::with_capacity(size),
        }
    }

    pub fn bin_count(&self) -> usize {
        self.smoothed.len()
    }

    /// Fills `out` with one byte per bin from `samples` (length must equal the FFT size).
    pub fn byte_frequency_data(&mut self, samples: &[f32], out: &mut Vec<u8>) {
        let size = self.window.len();
        self.buffer.clear();
        self.buffer.extend(
            samples
                .iter()
                .chain(std::iter::repeat(&0.0))
                .take(size)
                .zip(&self.window)
                .map(|(s, w)| Complex::new(s * w, 0.0)),
        );
        self.fft.process(&mut self.buffer);

        out.clear();
        for (bin, value) in self.smoothed.iter_mut().zip(&self.buffer) {
            let magnitude = value.norm() / size as f32;
            *bin = SMOOTHING * *bin + (1.0 - SMOOTHING) * magnitude;
            let db = 20.0 * bin.max(f32::MIN_POSITIVE).log10();
            let scaled = (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS) * 255.0;
            out.push(scaled.clamp(0.0, 255.0) as u8);
        }
    }
}

/// Hysteresis over per-sample average amplitude.
#[derive(Debug, Default)]
pub struct SpeakingDebouncer {
    speaking: bool,
    speaking_frames: u32,
    silent_frames: u32,
}

impl SpeakingDebouncer {
    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Feeds one sample's average byte amplitude; returns the new flag on a transition.
    pub fn observe(&mut self, average: f32) -> Option<bool> {
        let volume = 20.0 * (average / 255.0).log10();

        if volume > SPEAKING_THRESHOLD_DB {
            self.speaking_frames += 1;
            self.silent_frames = 0;
        } else if average < NOISE_THRESHOLD {
            self.silent_frames += 1;
            self.speaking_frames = 0;
        }

        let next = if self.speaking_frames > SPEAKING_FRAMES {
            true
        } else if self.silent_frames > SILENT_FRAMES {
            false
        } else {
            self.speaking
        };

        if next != self.speaking {
            self.speaking = next;
            Some(next)
        } else {
            None
        }
    }
}

fn average(data: &[u8]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().map(|&b| b as f32).sum::<f32>() / data.len() as f32
}

/// At most one sampling task per peer.
pub struct AudioActivityDetector {
    analysers: Mutex<HashMap<String, JoinHandle<()>>>,
    sample_interval: Duration,
}

impl AudioActivityDetector {
    pub fn new(sample_interval: Duration) -> Self {
        Self {
            analysers: Mutex::new(HashMap::new()),
            sample_interval,
        }
    }

    /// Starts sampling `stream`, replacing any analyser already running for `peer_id`.
    ///
    /// Streams without an audio track are ignored.
    pub fn start(&self, stream: &RemoteStream, peer_id: &str, on_change: SpeakingHandler) {
        self.stop(peer_id);

        let Some(tap) = stream.audio_tap() else {
            debug!(peer_id, "No audio track, speaking detection skipped");
            return;
        };

        let handle = tokio::spawn(Self::sample_loop(
            tap,
            self.sample_interval,
            peer_id.to_owned(),
            on_change,
        ));
        self.analysers.lock().insert(peer_id.to_owned(), handle);
    }

    pub fn stop(&self, peer_id: &str) {
        if let Some(handle) = self.analysers.lock().remove(peer_id) {
            handle.abort();
            debug!(peer_id, "Stopped audio analyser");
        }
    }

    pub fn stop_all(&self) {
        for (_, handle) in self.analysers.lock().drain() {
            handle.abort();
        }
    }

    pub fn is_running(&self, peer_id: &str) -> bool {
        self.analysers.lock().contains_key(peer_id)
    }

    async fn sample_loop(tap: PcmTap, period: Duration, peer_id: String, on_change: SpeakingHandler) {
        let mut analyser = FrequencyAnalyser::new(PCM_WINDOW);
        let mut debouncer = SpeakingDebouncer::default();
        let mut pcm = Vec::with_capacity(PCM_WINDOW);
        let mut data = Vec::with_capacity(analyser.bin_count());

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            tap.snapshot(&mut pcm);
            analyser.byte_frequency_data(&pcm, &mut data);
            if let Some(speaking) = debouncer.observe(average(&data)) {
                debug!(peer_id = %peer_id, speaking, "Speaking state changed");
                on_change(speaking);
            }
        }
    }
}

impl Default for AudioActivityDetector {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_INTERVAL)
    }
}

impl Drop for AudioActivityDetector {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{RemoteTrack, TrackKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Broadband test signal from a fixed LCG, uniform in -0.5..0.5.
    fn noise(len: usize) -> Vec<f32> {
        let mut state = 0x2545_f491u32;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 8) as f32 / (1u32 << 24) as f32 - 0.5
            })
            .collect()
    }

    #[test]
    fn debounce_needs_consecutive_samples() {
        let mut d = SpeakingDebouncer::default();
        assert_eq!(d.observe(200.0), None);
        assert_eq!(d.observe(200.0), None);
        assert_eq!(d.observe(200.0), Some(true));
        assert_eq!(d.observe(200.0), None);

        for _ in 0..5 {
            assert_eq!(d.observe(0.0), None);
        }
        assert_eq!(d.observe(0.0), Some(false));
        assert!(!d.is_speaking());
    }

    #[test]
    fn transient_noise_does_not_flicker() {
        let mut d = SpeakingDebouncer::default();
        for _ in 0..3 {
            d.observe(200.0);
        }
        assert!(d.is_speaking());
        // one quiet blip, then speech again
        assert_eq!(d.observe(0.0), None);
        assert_eq!(d.observe(200.0), None);
        assert!(d.is_speaking());
    }

    #[test]
    fn mid_range_keeps_counters() {
        let mut d = SpeakingDebouncer::default();
        d.observe(200.0);
        d.observe(200.0);
        // quieter than speech but above the noise floor: no counter reset
        d.observe(6.0);
        assert_eq!(d.observe(200.0), Some(true));
    }

    #[test]
    fn analyser_separates_noise_from_silence() {
        let mut analyser = FrequencyAnalyser::new(PCM_WINDOW);
        let mut data = Vec::new();

        analyser.byte_frequency_data(&vec![0.0; PCM_WINDOW], &mut data);
        assert_eq!(data.len(), PCM_WINDOW / 2);
        let silent = average(&data);

        assert_eq!(silent, 0.0);

        let signal = noise(PCM_WINDOW);
        for _ in 0..10 {
            analyser.byte_frequency_data(&signal, &mut data);
        }
        assert!(average(&data) > 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_replaces_and_stop_is_idempotent() {
        let detector = AudioActivityDetector::default();
        let stream = RemoteStream::new("s", vec![RemoteTrack::new("a", TrackKind::Audio)]);
        let calls = Arc::new(AtomicUsize::new(0));
        let handler: SpeakingHandler = {
            let calls = Arc::clone(&calls);
            Arc::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        detector.start(&stream, "p1", Arc::clone(&handler));
        detector.start(&stream, "p1", handler);
        assert!(detector.is_running("p1"));

        detector.stop("p1");
        detector.stop("p1");
        assert!(!detector.is_running("p1"));
    }

    #[tokio::test]
    async fn video_only_stream_is_ignored() {
        let detector = AudioActivityDetector::default();
        let stream = RemoteStream::new("s", vec![RemoteTrack::new("v", TrackKind::Video)]);
        detector.start(&stream, "p1", Arc::new(|_| {}));
        assert!(!detector.is_running("p1"));
    }

    #[tokio::test(start_paused = true)]
    async fn sampling_reports_speech() {
        let detector = AudioActivityDetector::default();
        let track = RemoteTrack::new("a", TrackKind::Audio);
        let tap = track.pcm().cloned().unwrap();
        let stream = RemoteStream::new("s", vec![track]);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        detector.start(&stream, "p1", Arc::new(move |speaking| {
            let _ = tx.send(speaking);
        }));

        tap.push(&noise(PCM_WINDOW));
        let speaking = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(speaking, Some(true));
        detector.stop_all();
    }
}
