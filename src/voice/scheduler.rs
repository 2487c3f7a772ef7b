//! Chunk scheduler: decides when buffered capture audio goes to the agent.
//!
//! Two states. On speech onset (`Idle -> Active`) a one-shot initial flush is
//! armed and a repeating progressive flush starts. Silence arms a single
//! silence timer; when it expires the utterance is closed with a final flush
//! and the scheduler returns to `Idle`. Speech before expiry disarms it.
//!
//! The scheduler is a plain state machine over explicit instants. It never
//! sleeps or performs I/O: the pipeline loop sleeps until `next_deadline`,
//! calls `poll`, sends whatever chunk comes back and reports the outcome with
//! `complete_flush`. At most one flush is in flight at a time.

use std::time::Duration;

use tokio::time::Instant;

use super::pcm::samples_for_ms;
use super::speaking::{Activity, EnergyWindow, SpeechDetector};
use super::types::{AudioBlock, OutboundChunk};
use crate::config::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Active,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub silence_threshold: f32,
    pub detection_window_samples: usize,
    pub energy_history_samples: usize,
    pub trailing_samples: usize,
    pub initial_send_delay: Duration,
    pub progressive_interval: Duration,
    pub silence_duration: Duration,
}

impl SchedulerConfig {
    pub fn from_session(config: &SessionConfig) -> Self {
        let rate = config.capture_sample_rate;
        Self {
            silence_threshold: config.silence_threshold,
            detection_window_samples: samples_for_ms(rate, config.detection_window_ms),
            energy_history_samples: samples_for_ms(rate, config.energy_history_ms),
            trailing_samples: samples_for_ms(rate, config.trailing_window_ms),
            initial_send_delay: Duration::from_millis(config.initial_send_delay_ms),
            progressive_interval: Duration::from_millis(config.progressive_interval_ms),
            silence_duration: Duration::from_millis(config.silence_duration_ms),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_session(&SessionConfig::default())
    }
}

/// PCM captured since the last final flush, in arrival order.
#[derive(Debug, Default, Clone)]
pub struct RollingAudioBuffer {
    blocks: Vec<Vec<i16>>,
    len: usize,
}

impl RollingAudioBuffer {
    pub fn push(&mut self, pcm: Vec<i16>) {
        if pcm.is_empty() {
            return;
        }
        self.len += pcm.len();
        self.blocks.push(pcm);
    }

    /// Total samples buffered.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn concat(&self) -> Vec<i16> {
        self.concat_prefix(self.len)
    }

    /// The oldest `count` samples, joined.
    pub fn concat_prefix(&self, count: usize) -> Vec<i16> {
        let count = count.min(self.len);
        let mut out = Vec::with_capacity(count);
        for block in &self.blocks {
            let take = (count - out.len()).min(block.len());
            if take == 0 {
                break;
            }
            out.extend_from_slice(&block[..take]);
        }
        out
    }

    /// Remove the oldest `count` samples.
    pub fn drop_front(&mut self, count: usize) {
        if count >= self.len {
            self.clear();
            return;
        }
        let mut remaining = count;
        let mut whole = 0;
        for block in &self.blocks {
            if remaining < block.len() {
                break;
            }
            remaining -= block.len();
            whole += 1;
        }
        self.blocks.drain(..whole);
        if remaining > 0 {
            self.blocks[0].drain(..remaining);
        }
        self.len -= count;
    }

    /// Keep only the newest `count` samples; returns how many were dropped.
    pub fn retain_recent(&mut self, count: usize) -> usize {
        let excess = self.len.saturating_sub(count);
        self.drop_front(excess);
        excess
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.len = 0;
    }
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    partial: bool,
    sent_samples: usize,
}

/// Result of feeding one capture block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOutcome {
    pub activity: Activity,
    /// This block moved the scheduler from `Idle` to `Active`.
    pub speech_started: bool,
}

pub struct ChunkScheduler {
    config: SchedulerConfig,
    detector: SpeechDetector,
    state: RecordingState,
    buffer: RollingAudioBuffer,
    energy: EnergyWindow,
    initial_due: Option<Instant>,
    progressive_due: Option<Instant>,
    silence_due: Option<Instant>,
    in_flight: Option<InFlight>,
    // Samples owed to a final flush that came due mid-send.
    final_pending: Option<usize>,
}

impl ChunkScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let detector = SpeechDetector::new(config.silence_threshold, config.detection_window_samples);
        let energy = EnergyWindow::new(config.energy_history_samples);
        Self {
            config,
            detector,
            state: RecordingState::Idle,
            buffer: RollingAudioBuffer::default(),
            energy,
            initial_due: None,
            progressive_due: None,
            silence_due: None,
            in_flight: None,
            final_pending: None,
        }
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn buffer(&self) -> &RollingAudioBuffer {
        &self.buffer
    }

    pub fn energy(&self) -> &EnergyWindow {
        &self.energy
    }

    pub fn flush_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Append a capture block, classify the window and update timers.
    pub fn push_block(&mut self, block: AudioBlock, now: Instant) -> BlockOutcome {
        self.energy.push(&block.samples);
        self.buffer.push(block.pcm);
        let activity = self.detector.classify(&self.energy);
        let mut speech_started = false;

        match activity {
            Activity::Silence => {
                if self.state == RecordingState::Active && self.silence_due.is_none() {
                    self.silence_due = Some(now + self.config.silence_duration);
                }
            }
            Activity::Speech => {
                self.silence_due = None;
                if self.state == RecordingState::Idle {
                    self.state = RecordingState::Active;
                    self.initial_due = Some(now + self.config.initial_send_delay);
                    speech_started = true;
                }
                if self.progressive_due.is_none() {
                    self.progressive_due = Some(now + self.config.progressive_interval);
                }
            }
        }

        // Between utterances keep only a short pre-roll so the first
        // instants of the next one are not lost. Audio owed to a deferred
        // final is kept until that final is sent.
        if self.state == RecordingState::Idle && self.final_pending.is_none() {
            let dropped = self.buffer.retain_recent(self.config.trailing_samples);
            self.account_dropped(dropped);
        }

        BlockOutcome {
            activity,
            speech_started,
        }
    }

    /// Earliest pending timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.silence_due, self.initial_due, self.progressive_due]
            .into_iter()
            .flatten()
            .min()
    }

    /// Fire every timer due at `now`; returns a chunk to send, if any.
    pub fn poll(&mut self, now: Instant) -> Option<OutboundChunk> {
        let mut flush: Option<bool> = None;

        if self.silence_due.is_some_and(|due| due <= now) {
            self.silence_due = None;
            self.initial_due = None;
            self.progressive_due = None;
            self.state = RecordingState::Idle;
            flush = Some(false);
        }

        if self.initial_due.is_some_and(|due| due <= now) {
            self.initial_due = None;
            if self.state == RecordingState::Active {
                flush.get_or_insert(true);
            }
        }

        if let Some(due) = self.progressive_due.filter(|due| *due <= now) {
            let next = due + self.config.progressive_interval;
            self.progressive_due = Some(if next > now {
                next
            } else {
                now + self.config.progressive_interval
            });
            if self.state == RecordingState::Active {
                flush.get_or_insert(true);
            }
        }

        flush.and_then(|partial| self.begin_flush(partial))
    }

    fn begin_flush(&mut self, partial: bool) -> Option<OutboundChunk> {
        if self.buffer.is_empty() {
            return None;
        }
        if self.in_flight.is_some() {
            if !partial {
                self.final_pending = Some(self.buffer.len());
                log::debug!("Final flush deferred, previous send still in flight");
            } else {
                log::debug!("Flush skipped, previous send still in flight");
            }
            return None;
        }
        self.send_prefix(partial, self.buffer.len())
    }

    fn send_prefix(&mut self, partial: bool, count: usize) -> Option<OutboundChunk> {
        let pcm = self.buffer.concat_prefix(count);
        if pcm.is_empty() {
            return None;
        }
        self.in_flight = Some(InFlight {
            partial,
            sent_samples: pcm.len(),
        });
        Some(OutboundChunk::audio(&pcm, partial))
    }

    /// Record the outcome of the last chunk returned by `poll`.
    ///
    /// On success a partial flush trims the sent audio down to the trailing
    /// window and a final flush discards it. On failure the buffer is kept so
    /// the next flush resends it. May return a deferred final chunk, which
    /// covers only the audio buffered when that final came due.
    pub fn complete_flush(&mut self, delivered: bool) -> Option<OutboundChunk> {
        let flight = self.in_flight.take()?;

        if delivered {
            let consumed = if flight.partial {
                flight.sent_samples.saturating_sub(self.config.trailing_samples)
            } else {
                flight.sent_samples
            };
            self.buffer.drop_front(consumed);
            self.energy.retain_recent(self.buffer.len());
            self.account_dropped_pending(consumed);
        }

        let extent = self.final_pending.take()?;
        self.send_prefix(false, extent)
    }

    /// Drop all audio and timers and return to `Idle`.
    pub fn reset(&mut self) {
        self.state = RecordingState::Idle;
        self.buffer.clear();
        self.energy.clear();
        self.initial_due = None;
        self.progressive_due = None;
        self.silence_due = None;
        self.in_flight = None;
        self.final_pending = None;
    }

    // Keep the in-flight watermark pointing at the same audio after the
    // front of the buffer was trimmed.
    fn account_dropped(&mut self, dropped: usize) {
        if let Some(flight) = self.in_flight.as_mut() {
            flight.sent_samples = flight.sent_samples.saturating_sub(dropped);
        }
        self.account_dropped_pending(dropped);
    }

    fn account_dropped_pending(&mut self, dropped: usize) {
        if let Some(extent) = self.final_pending.as_mut() {
            *extent = extent.saturating_sub(dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::pcm::decode_base64_pcm16;
    use proptest::prelude::*;

    const BLOCK: usize = 128;
    // 128 samples at 16 kHz.
    const BLOCK_MS: u64 = 8;

    fn speech() -> AudioBlock {
        AudioBlock::from_samples(vec![0.5; BLOCK])
    }

    fn silence() -> AudioBlock {
        AudioBlock::from_samples(vec![0.0; BLOCK])
    }

    fn at(start: Instant, ms: u64) -> Instant {
        start + Duration::from_millis(ms)
    }

    fn scheduler() -> ChunkScheduler {
        ChunkScheduler::new(SchedulerConfig::default())
    }

    #[test]
    fn default_config_matches_capture_rate() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.detection_window_samples, 800);
        assert_eq!(cfg.energy_history_samples, 32_000);
        assert_eq!(cfg.trailing_samples, 8_000);
        assert_eq!(cfg.initial_send_delay, Duration::from_millis(500));
        assert_eq!(cfg.progressive_interval, Duration::from_millis(2000));
        assert_eq!(cfg.silence_duration, Duration::from_millis(800));
    }

    #[test]
    fn speech_onset_activates_and_arms_timers() {
        let t0 = Instant::now();
        let mut s = scheduler();
        let outcome = s.push_block(speech(), t0);
        assert!(outcome.speech_started);
        assert_eq!(outcome.activity, Activity::Speech);
        assert_eq!(s.state(), RecordingState::Active);
        assert_eq!(s.next_deadline(), Some(at(t0, 500)));

        let again = s.push_block(speech(), at(t0, 8));
        assert!(!again.speech_started);
    }

    #[test]
    fn silence_while_idle_arms_nothing() {
        let t0 = Instant::now();
        let mut s = scheduler();
        for i in 0..20 {
            s.push_block(silence(), at(t0, i * BLOCK_MS));
        }
        assert_eq!(s.state(), RecordingState::Idle);
        assert_eq!(s.next_deadline(), None);
        assert!(s.poll(at(t0, 10_000)).is_none());
    }

    #[test]
    fn idle_buffer_is_bounded_by_pre_roll() {
        let t0 = Instant::now();
        let mut s = scheduler();
        for i in 0..200 {
            s.push_block(silence(), at(t0, i * BLOCK_MS));
        }
        assert_eq!(s.buffer().len(), 8_000);
    }

    #[test]
    fn single_utterance_emits_one_partial_then_one_final() {
        let t0 = Instant::now();
        let mut s = scheduler();
        s.push_block(speech(), t0);

        assert!(s.poll(at(t0, 499)).is_none());
        let partial = s.poll(at(t0, 500)).expect("initial partial flush");
        assert!(partial.is_partial);
        assert_eq!(decode_base64_pcm16(&partial.data).unwrap().len(), BLOCK);
        assert!(s.complete_flush(true).is_none());

        // Enough silent blocks to push the 50 ms window below threshold.
        for i in 0..7 {
            s.push_block(silence(), at(t0, 500 + i));
        }
        let silence_armed = at(t0, 506);
        assert_eq!(s.next_deadline(), Some(silence_armed + Duration::from_millis(800)));

        assert!(s.poll(at(t0, 1305)).is_none());
        let last = s.poll(at(t0, 1306)).expect("final flush");
        assert!(!last.is_partial);
        assert_eq!(s.state(), RecordingState::Idle);
        assert!(s.complete_flush(true).is_none());

        assert!(s.buffer().is_empty());
        assert!(s.energy().is_empty());
        assert_eq!(s.next_deadline(), None);
    }

    #[test]
    fn speech_before_expiry_cancels_silence_timer() {
        let t0 = Instant::now();
        let mut s = scheduler();
        s.push_block(speech(), t0);
        for i in 0..7 {
            s.push_block(silence(), at(t0, 8 * (i + 1)));
        }
        assert_eq!(s.next_deadline(), Some(at(t0, 500)));
        let silence_due = at(t0, 56 + 800);

        s.push_block(speech(), at(t0, 100));
        assert_eq!(s.state(), RecordingState::Active);
        assert!(s.poll(at(t0, 500)).is_some());
        s.complete_flush(true);
        assert!(s.poll(silence_due).is_none());
        assert_eq!(s.state(), RecordingState::Active);
    }

    #[test]
    fn continuous_speech_flushes_on_schedule_and_stays_bounded() {
        let t0 = Instant::now();
        let mut s = scheduler();
        let mut flush_times = Vec::new();
        let mut max_len = 0;

        let mut ms = 0;
        while ms <= 5000 {
            let now = at(t0, ms);
            s.push_block(speech(), now);
            while let Some(chunk) = s.poll(now) {
                assert!(chunk.is_partial);
                flush_times.push(ms);
                s.complete_flush(true);
            }
            max_len = max_len.max(s.buffer().len());
            ms += BLOCK_MS;
        }

        assert_eq!(flush_times, vec![504, 2000, 4000]);
        // Trailing window plus the audio of one progressive interval.
        assert!(max_len <= 8_000 + 32_000 + BLOCK);
        assert_eq!(s.state(), RecordingState::Active);
    }

    #[test]
    fn partial_flush_keeps_trailing_suffix() {
        let t0 = Instant::now();
        let mut s = scheduler();
        // 1 second of speech with distinct sample values.
        for i in 0..125u64 {
            let samples = (0..BLOCK)
                .map(|j| 0.1 + ((i as usize * BLOCK + j) % 1000) as f32 / 10_000.0)
                .collect();
            s.push_block(AudioBlock::from_samples(samples), at(t0, i * BLOCK_MS));
        }
        let before = s.buffer().concat();
        assert!(s.poll(at(t0, 1000)).is_some());
        s.complete_flush(true);

        let after = s.buffer().concat();
        assert_eq!(after.len(), 8_000);
        assert_eq!(after[..], before[before.len() - 8_000..]);
    }

    #[test]
    fn failed_flush_preserves_buffer_and_state() {
        let t0 = Instant::now();
        let mut s = scheduler();
        s.push_block(speech(), t0);
        assert!(s.poll(at(t0, 500)).is_some());
        s.complete_flush(false);
        assert_eq!(s.buffer().len(), BLOCK);
        assert_eq!(s.state(), RecordingState::Active);

        s.push_block(speech(), at(t0, 508));
        let retry = s.poll(at(t0, 2000)).expect("progressive retry");
        assert_eq!(decode_base64_pcm16(&retry.data).unwrap().len(), 2 * BLOCK);
    }

    #[test]
    fn final_due_during_in_flight_partial_is_deferred() {
        let t0 = Instant::now();
        let mut s = scheduler();
        s.push_block(speech(), t0);
        assert!(s.poll(at(t0, 500)).is_some());
        assert!(s.flush_in_flight());

        for i in 0..7 {
            s.push_block(silence(), at(t0, 500 + i));
        }
        assert!(s.poll(at(t0, 2000)).is_none());
        assert_eq!(s.state(), RecordingState::Idle);

        let deferred = s.complete_flush(true).expect("deferred final");
        assert!(!deferred.is_partial);
        assert!(s.complete_flush(true).is_none());
        assert!(s.buffer().is_empty());
    }

    #[test]
    fn deferred_final_excludes_audio_of_the_next_utterance() {
        let t0 = Instant::now();
        let mut s = scheduler();
        s.push_block(speech(), t0);
        assert!(s.poll(at(t0, 500)).is_some());

        for i in 0..7 {
            s.push_block(silence(), at(t0, 500 + i));
        }
        assert!(s.poll(at(t0, 1306)).is_none());
        assert_eq!(s.state(), RecordingState::Idle);
        let owed = s.buffer().len();
        assert_eq!(owed, 8 * BLOCK);

        // The next utterance starts while the partial is still in flight.
        let next = AudioBlock::from_samples(vec![0.75; BLOCK]);
        let next_value = next.pcm[0];
        for i in 0..10 {
            s.push_block(next.clone(), at(t0, 1310 + i * BLOCK_MS));
        }
        assert_eq!(s.state(), RecordingState::Active);

        let deferred = s.complete_flush(true).expect("deferred final");
        assert!(!deferred.is_partial);
        let sent = decode_base64_pcm16(&deferred.data).unwrap();
        assert_eq!(sent.len(), owed);
        assert!(sent.iter().all(|&v| v != next_value));

        assert!(s.complete_flush(true).is_none());
        assert_eq!(s.buffer().len(), 10 * BLOCK);
        assert!(s.buffer().concat().iter().all(|&v| v == next_value));
        assert_eq!(s.state(), RecordingState::Active);
    }

    #[test]
    fn deferred_final_survives_idle_pre_roll_trimming() {
        let t0 = Instant::now();
        let mut s = scheduler();
        for i in 0..80 {
            s.push_block(speech(), at(t0, i * BLOCK_MS));
        }
        assert!(s.poll(at(t0, 640)).is_some());
        for i in 0..7 {
            s.push_block(silence(), at(t0, 640 + i));
        }
        assert!(s.poll(at(t0, 1500)).is_none());
        let owed = s.buffer().len();
        assert!(owed > 8_000);

        for i in 0..100 {
            s.push_block(silence(), at(t0, 1500 + i * BLOCK_MS));
        }
        assert_eq!(s.state(), RecordingState::Idle);

        // The partial kept its 8000-sample trailing window, which stays
        // part of the final.
        let deferred = s.complete_flush(true).expect("deferred final");
        let sent = decode_base64_pcm16(&deferred.data).unwrap();
        assert_eq!(sent.len(), owed - (80 * BLOCK - 8_000));
        assert!(s.complete_flush(true).is_none());
        assert_eq!(s.buffer().len(), 100 * BLOCK);
    }

    #[test]
    fn final_flush_with_empty_buffer_is_noop() {
        let t0 = Instant::now();
        let mut s = scheduler();
        s.push_block(speech(), t0);
        s.reset();
        assert_eq!(s.state(), RecordingState::Idle);
        assert!(s.poll(at(t0, 10_000)).is_none());
        assert!(s.complete_flush(true).is_none());
    }

    #[test]
    fn rolling_buffer_drop_front_splits_blocks() {
        let mut b = RollingAudioBuffer::default();
        b.push(vec![1, 2, 3]);
        b.push(vec![4, 5]);
        b.push(vec![6, 7, 8]);
        b.drop_front(4);
        assert_eq!(b.concat(), vec![5, 6, 7, 8]);
        assert_eq!(b.concat_prefix(3), vec![5, 6, 7]);
        assert_eq!(b.concat_prefix(99), vec![5, 6, 7, 8]);
        assert_eq!(b.len(), 4);
        assert_eq!(b.retain_recent(2), 2);
        assert_eq!(b.concat(), vec![7, 8]);
        b.drop_front(10);
        assert!(b.is_empty());
    }

    fn block_for(is_speech: bool) -> AudioBlock {
        if is_speech {
            speech()
        } else {
            silence()
        }
    }

    proptest! {
        #[test]
        fn final_flush_is_never_empty_and_precedes_idle(
            pattern in proptest::collection::vec(any::<bool>(), 1..400),
        ) {
            let t0 = Instant::now();
            let mut s = scheduler();
            for (i, is_speech) in pattern.into_iter().enumerate() {
                let now = at(t0, i as u64 * BLOCK_MS);
                s.push_block(block_for(is_speech), now);
                let was_active = s.state() == RecordingState::Active;
                let had_audio = !s.buffer().is_empty();
                let mut finals = 0;
                while let Some(chunk) = s.poll(now) {
                    prop_assert!(!chunk.data.is_empty());
                    if !chunk.is_partial {
                        finals += 1;
                    }
                    s.complete_flush(true);
                }
                if was_active && s.state() == RecordingState::Idle && had_audio {
                    prop_assert_eq!(finals, 1);
                }
                prop_assert!(finals <= 1);
            }
        }

        #[test]
        fn partial_flush_retains_suffix_within_window(
            blocks in 1usize..300,
        ) {
            let t0 = Instant::now();
            let mut s = scheduler();
            for i in 0..blocks {
                s.push_block(speech(), at(t0, i as u64 * BLOCK_MS));
            }
            let before = s.buffer().concat();
            let flushed = s.poll(at(t0, 500)).is_some();
            s.complete_flush(true);
            let after = s.buffer().concat();
            if flushed {
                prop_assert!(after.len() <= 8_000);
            }
            prop_assert_eq!(&after[..], &before[before.len() - after.len()..]);
        }
    }
}
