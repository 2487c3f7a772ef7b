//! Speech/silence classification using RMS energy over a short trailing window.
//!
//! No smoothing and no hold timer: a single quiet window counts as silence.
//! Debouncing is done by the scheduler's silence timer.

use std::collections::VecDeque;

pub const DEFAULT_SILENCE_THRESHOLD: f32 = 0.015;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Speech,
    Silence,
}

/// Most recent raw capture samples, bounded, dropping the oldest.
#[derive(Debug, Clone)]
pub struct EnergyWindow {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl EnergyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, block: &[f32]) {
        // Only the tail of an oversized block can survive.
        let skip = block.len().saturating_sub(self.capacity);
        for &s in &block[skip..] {
            if self.samples.len() == self.capacity {
                self.samples.pop_front();
            }
            self.samples.push_back(s);
        }
    }

    /// Keep only the newest `count` samples.
    pub fn retain_recent(&mut self, count: usize) {
        let excess = self.samples.len().saturating_sub(count);
        self.samples.drain(..excess);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The newest `count` samples (fewer if the window is shorter).
    pub fn recent(&self, count: usize) -> impl Iterator<Item = f32> + '_ {
        let start = self.samples.len().saturating_sub(count);
        self.samples.range(start..).copied()
    }
}

pub struct SpeechDetector {
    threshold: f32,
    window_samples: usize,
}

impl SpeechDetector {
    /// `window_samples` is the RMS window (800 samples = 50 ms at 16 kHz).
    pub fn new(threshold: f32, window_samples: usize) -> Self {
        Self {
            threshold,
            window_samples: window_samples.max(1),
        }
    }

    /// `rms < threshold` is silence, `rms >= threshold` is speech.
    pub fn classify(&self, window: &EnergyWindow) -> Activity {
        let level = rms(window.recent(self.window_samples));
        if level < self.threshold {
            Activity::Silence
        } else {
            Activity::Speech
        }
    }
}

/// Root-mean-square of the samples; 0.0 for an empty input.
pub fn rms(samples: impl IntoIterator<Item = f32>) -> f32 {
    let mut sum_sq = 0.0f64;
    let mut count = 0usize;
    for s in samples {
        sum_sq += (s as f64) * (s as f64);
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    (sum_sq / count as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_with(samples: &[f32]) -> EnergyWindow {
        let mut w = EnergyWindow::new(32_000);
        w.push(samples);
        w
    }

    #[test]
    fn empty_window_is_silence() {
        let detector = SpeechDetector::new(DEFAULT_SILENCE_THRESHOLD, 800);
        assert_eq!(detector.classify(&EnergyWindow::new(16)), Activity::Silence);
    }

    #[test]
    fn all_zero_block_is_silence() {
        let detector = SpeechDetector::new(DEFAULT_SILENCE_THRESHOLD, 800);
        assert_eq!(detector.classify(&window_with(&[0.0; 128])), Activity::Silence);
    }

    #[test]
    fn rms_exactly_at_threshold_is_speech() {
        // A constant signal's RMS equals its magnitude; 0.5 is exact in f32 and f64.
        let detector = SpeechDetector::new(0.5, 800);
        assert_eq!(detector.classify(&window_with(&[0.5; 128])), Activity::Speech);
        assert_eq!(detector.classify(&window_with(&[-0.5; 128])), Activity::Speech);
    }

    #[test]
    fn rms_just_below_threshold_is_silence() {
        let detector = SpeechDetector::new(0.5, 800);
        assert_eq!(detector.classify(&window_with(&[0.499; 128])), Activity::Silence);
    }

    #[test]
    fn classification_only_looks_at_recent_window() {
        let detector = SpeechDetector::new(DEFAULT_SILENCE_THRESHOLD, 800);
        let mut w = EnergyWindow::new(32_000);
        w.push(&[0.5; 4000]);
        assert_eq!(detector.classify(&w), Activity::Speech);
        w.push(&[0.0; 800]);
        assert_eq!(detector.classify(&w), Activity::Silence);
    }

    #[test]
    fn energy_window_drops_oldest() {
        let mut w = EnergyWindow::new(4);
        w.push(&[1.0, 2.0, 3.0]);
        w.push(&[4.0, 5.0]);
        assert_eq!(w.recent(10).collect::<Vec<_>>(), vec![2.0, 3.0, 4.0, 5.0]);

        w.push(&[6.0, 7.0, 8.0, 9.0, 10.0, 11.0]);
        assert_eq!(w.recent(10).collect::<Vec<_>>(), vec![8.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    fn retain_recent_keeps_suffix() {
        let mut w = EnergyWindow::new(10);
        w.push(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        w.retain_recent(2);
        assert_eq!(w.recent(10).collect::<Vec<_>>(), vec![4.0, 5.0]);
        w.retain_recent(5);
        assert_eq!(w.len(), 2);
    }

    #[test]
    fn rms_of_alternating_signal() {
        assert!((rms([0.3, -0.3, 0.3, -0.3]) - 0.3).abs() < 1e-6);
        assert_eq!(rms(std::iter::empty()), 0.0);
    }
}
