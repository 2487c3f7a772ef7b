//! Per-quantum callbacks invoked by the audio host on its real-time threads.
//!
//! Nothing in here may block, lock or allocate. Data crosses into and out of
//! the real-time threads only through lock-free SPSC rings, by copy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ringbuf::traits::{Consumer, Producer};
use ringbuf::{HeapCons, HeapProd};

/// Host-invoked block callback.
///
/// `input` and `output` are interleaved frames; a capture processor only
/// reads `input`, a playback processor only fills `output`.
pub trait BlockProcessor: Send + 'static {
    fn on_block(&mut self, input: &[f32], output: &mut [f32]);
}

/// Downmixes captured frames to mono and hands them to the capture task.
pub struct CaptureProcessor {
    producer: HeapProd<f32>,
    channels: usize,
    dropped: Arc<AtomicU64>,
}

impl CaptureProcessor {
    pub fn new(producer: HeapProd<f32>, channels: usize, dropped: Arc<AtomicU64>) -> Self {
        Self {
            producer,
            channels: channels.max(1),
            dropped,
        }
    }
}

impl BlockProcessor for CaptureProcessor {
    fn on_block(&mut self, input: &[f32], _output: &mut [f32]) {
        let mut lost = 0u64;
        for frame in input.chunks(self.channels) {
            let mono = frame.iter().sum::<f32>() / frame.len() as f32;
            if self.producer.try_push(mono).is_err() {
                lost += 1;
            }
        }
        if lost > 0 {
            self.dropped.fetch_add(lost, Ordering::Relaxed);
        }
    }
}

/// Samples carried by one inbox message.
pub const PLAYER_BLOCK: usize = 128;

/// Inbox messages the renderer takes per host callback.
pub const MAX_BLOCKS_PER_CALLBACK: usize = 64;

/// Up to `PLAYER_BLOCK` samples, copied through the inbox by value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleBlock {
    len: usize,
    samples: [f32; PLAYER_BLOCK],
}

impl SampleBlock {
    /// Copies the first `PLAYER_BLOCK` samples at most.
    pub fn from_slice(samples: &[f32]) -> Self {
        let len = samples.len().min(PLAYER_BLOCK);
        let mut block = Self {
            len,
            samples: [0.0; PLAYER_BLOCK],
        };
        block.samples[..len].copy_from_slice(&samples[..len]);
        block
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.samples[..self.len]
    }
}

/// Message from the playback writer to the renderer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlayerMessage {
    Block(SampleBlock),
    /// Discard everything not yet played.
    EndOfAudio,
}

/// Fixed-capacity circular sample store read at the output rate.
///
/// The writer never blocks: when full, the oldest unplayed sample is
/// overwritten. When empty, the reader keeps returning the last sample it
/// produced instead of stalling.
pub struct PcmPlayer {
    buffer: Box<[f32]>,
    write_index: usize,
    read_index: usize,
    last_sample: f32,
}

impl PcmPlayer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0.0; capacity.max(2)].into_boxed_slice(),
            write_index: 0,
            read_index: 0,
            last_sample: 0.0,
        }
    }

    pub fn enqueue(&mut self, sample: f32) {
        let len = self.buffer.len();
        self.buffer[self.write_index] = sample;
        self.write_index = (self.write_index + 1) % len;
        if self.write_index == self.read_index {
            self.read_index = (self.read_index + 1) % len;
        }
    }

    #[inline]
    pub fn next_sample(&mut self) -> f32 {
        if self.read_index != self.write_index {
            self.last_sample = self.buffer[self.read_index];
            self.read_index = (self.read_index + 1) % self.buffer.len();
        }
        self.last_sample
    }

    pub fn end_of_audio(&mut self) {
        self.read_index = self.write_index;
    }

    /// Samples queued and not yet played.
    pub fn available(&self) -> usize {
        let len = self.buffer.len();
        (self.write_index + len - self.read_index) % len
    }

    pub fn capacity(&self) -> usize {
        // One slot separates full from empty.
        self.buffer.len() - 1
    }
}

/// Drains the writer's inbox into a `PcmPlayer` and renders it to every
/// output channel.
pub struct PlaybackProcessor {
    player: PcmPlayer,
    inbox: HeapCons<PlayerMessage>,
    channels: usize,
}

impl PlaybackProcessor {
    pub fn new(player: PcmPlayer, inbox: HeapCons<PlayerMessage>, channels: usize) -> Self {
        Self {
            player,
            inbox,
            channels: channels.max(1),
        }
    }

    // Bounded so one callback never copies an unbounded backlog.
    fn drain_inbox(&mut self) {
        for _ in 0..MAX_BLOCKS_PER_CALLBACK {
            match self.inbox.try_pop() {
                Some(PlayerMessage::Block(block)) => {
                    for &s in block.as_slice() {
                        self.player.enqueue(s);
                    }
                }
                Some(PlayerMessage::EndOfAudio) => self.player.end_of_audio(),
                None => break,
            }
        }
    }
}

impl BlockProcessor for PlaybackProcessor {
    fn on_block(&mut self, _input: &[f32], output: &mut [f32]) {
        self.drain_inbox();
        for frame in output.chunks_mut(self.channels) {
            frame.fill(self.player.next_sample());
        }
    }
}
