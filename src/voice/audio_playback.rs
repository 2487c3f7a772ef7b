use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cpal::traits::DeviceTrait;
use ringbuf::{HeapProd, HeapRb, traits::{Observer, Producer, Split}};

use super::device::{
    choose_config, classify_build_error, find_device, AudioFault, Direction, FaultSender,
    StreamInfo, StreamThread,
};
use super::error::SessionError;
use super::pcm::pcm16_to_f32;
use super::processor::{
    BlockProcessor, PcmPlayer, PlaybackProcessor, PlayerMessage, SampleBlock, PLAYER_BLOCK,
};
use super::resampler::RateConverter;
use crate::config::SessionConfig;

const INBOX_SECS: usize = 10;
const RESAMPLE_CHUNK_MS: u32 = 10;

/// Owns the output stream. Audio is fed through the `PlaybackHandle`
/// returned by `start`.
pub struct AudioPlayback {
    stream: Option<StreamThread>,
}

/// Writer side of the playback ring, used from the pipeline task.
pub struct PlaybackHandle {
    inbox: HeapProd<PlayerMessage>,
    converter: RateConverter,
    scratch: Vec<f32>,
    dropped: Arc<AtomicU64>,
}

impl AudioPlayback {
    pub fn new() -> Self {
        Self { stream: None }
    }

    /// Open the configured output device. Inbound PCM is expected at
    /// `config.playback_sample_rate` and converted to the device rate.
    pub async fn start(
        &mut self,
        config: &SessionConfig,
        faults: FaultSender,
    ) -> Result<PlaybackHandle, SessionError> {
        let device_name = config.output_device.clone();
        let source_rate = config.playback_sample_rate;
        let buffer_secs = config.playback_buffer_secs as usize;

        let (stream, (info, inbox)) = tokio::task::spawn_blocking(move || {
            StreamThread::spawn("interview-playback", move || {
                open_output(device_name.as_deref(), source_rate, buffer_secs, faults)
            })
        })
        .await
        .map_err(|e| SessionError::Audio(format!("playback setup task failed: {}", e)))??;

        log::info!(
            "Playback device: {} ({}Hz, {}ch)",
            info.device_name,
            info.sample_rate,
            info.channels,
        );

        let converter = RateConverter::new(source_rate, info.sample_rate, RESAMPLE_CHUNK_MS)?;
        self.stream = Some(stream);

        Ok(PlaybackHandle::new(inbox, converter))
    }

    /// Close the output device. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }
}

impl Default for AudioPlayback {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PlaybackHandle {
    pub(crate) fn new(inbox: HeapProd<PlayerMessage>, converter: RateConverter) -> Self {
        Self {
            inbox,
            converter,
            scratch: Vec::new(),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue agent PCM16 for playback.
    ///
    /// If the inbox cannot take the whole frame, the oldest samples of the
    /// frame are dropped and the newest are queued.
    pub fn enqueue_pcm(&mut self, pcm: &[i16]) {
        let samples: Vec<f32> = pcm.iter().map(|&s| pcm16_to_f32(s)).collect();
        self.scratch.clear();
        self.converter.process(&samples, &mut self.scratch);

        let room = self.inbox.vacant_len().saturating_mul(PLAYER_BLOCK);
        let skip = self.scratch.len().saturating_sub(room);
        let mut lost = skip as u64;
        for chunk in self.scratch[skip..].chunks(PLAYER_BLOCK) {
            let message = PlayerMessage::Block(SampleBlock::from_slice(chunk));
            if self.inbox.try_push(message).is_err() {
                lost += chunk.len() as u64;
            }
        }
        if lost > 0 {
            self.dropped.fetch_add(lost, Ordering::Relaxed);
            log::warn!("Playback inbox full, dropped {} samples", lost);
        }
    }

    /// Discard everything queued but not yet played.
    pub fn end_of_audio(&mut self) {
        self.converter.reset();
        if self.inbox.try_push(PlayerMessage::EndOfAudio).is_err() {
            log::warn!("Playback inbox full, endOfAudio not delivered");
        }
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Shared drop counter, readable after the handle itself is gone.
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }
}

type OutputOpened = (StreamInfo, HeapProd<PlayerMessage>);

fn open_output(
    device_name: Option<&str>,
    source_rate: u32,
    buffer_secs: usize,
    faults: FaultSender,
) -> Result<(cpal::Stream, OutputOpened), SessionError> {
    let device = find_device(Direction::Output, device_name)?;
    let config = choose_config(&device, Direction::Output, source_rate, 1)?;
    let info = StreamInfo {
        device_name: device.name().unwrap_or_default(),
        sample_rate: config.sample_rate.0,
        channels: config.channels as usize,
    };

    let rate = info.sample_rate as usize;
    let slots = (rate * INBOX_SECS).div_ceil(PLAYER_BLOCK);
    let (inbox, outbox) = HeapRb::<PlayerMessage>::new(slots).split();
    let player = PcmPlayer::new(rate * buffer_secs);
    let mut processor = PlaybackProcessor::new(player, outbox, info.channels);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                processor.on_block(&[], data);
            },
            move |err| {
                log::error!("cpal output error: {}", err);
                let _ = faults.send(AudioFault::from_stream_error(err));
            },
            None,
        )
        .map_err(classify_build_error)?;

    Ok((stream, (info, inbox)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringbuf::traits::Consumer;

    fn drain_samples(outbox: &mut ringbuf::HeapCons<PlayerMessage>) -> Vec<f32> {
        let mut out = Vec::new();
        while let Some(message) = outbox.try_pop() {
            if let PlayerMessage::Block(block) = message {
                out.extend_from_slice(block.as_slice());
            }
        }
        out
    }

    #[test]
    fn enqueue_converts_pcm16_to_float_samples() {
        let (inbox, mut outbox) = HeapRb::<PlayerMessage>::new(16).split();
        let converter = RateConverter::new(24_000, 24_000, 10).unwrap();
        let mut handle = PlaybackHandle::new(inbox, converter);

        handle.enqueue_pcm(&[16384, -32768]);

        assert_eq!(drain_samples(&mut outbox), vec![0.5, -1.0]);
        assert_eq!(handle.dropped_samples(), 0);
    }

    #[test]
    fn frame_larger_than_inbox_keeps_newest_samples() {
        let (inbox, mut outbox) = HeapRb::<PlayerMessage>::new(2).split();
        let converter = RateConverter::new(24_000, 24_000, 10).unwrap();
        let mut handle = PlaybackHandle::new(inbox, converter);

        let pcm: Vec<i16> = (0..300).collect();
        handle.enqueue_pcm(&pcm);

        let kept = 2 * PLAYER_BLOCK;
        assert_eq!(handle.dropped_samples(), (300 - kept) as u64);
        let expected: Vec<f32> = pcm[300 - kept..].iter().map(|&s| pcm16_to_f32(s)).collect();
        assert_eq!(drain_samples(&mut outbox), expected);
    }

    #[test]
    fn full_inbox_drops_whole_frame_and_counts_it() {
        let (inbox, mut outbox) = HeapRb::<PlayerMessage>::new(1).split();
        let converter = RateConverter::new(24_000, 24_000, 10).unwrap();
        let mut handle = PlaybackHandle::new(inbox, converter);

        handle.enqueue_pcm(&[1, 2]);
        handle.enqueue_pcm(&[3, 4, 5]);

        assert_eq!(handle.dropped_samples(), 3);
        assert_eq!(drain_samples(&mut outbox), vec![pcm16_to_f32(1), pcm16_to_f32(2)]);
    }

    #[test]
    fn end_of_audio_follows_queued_samples() {
        let (inbox, mut outbox) = HeapRb::<PlayerMessage>::new(16).split();
        let converter = RateConverter::new(24_000, 24_000, 10).unwrap();
        let mut handle = PlaybackHandle::new(inbox, converter);

        handle.enqueue_pcm(&[0]);
        handle.end_of_audio();

        assert_eq!(
            outbox.try_pop(),
            Some(PlayerMessage::Block(SampleBlock::from_slice(&[0.0])))
        );
        assert_eq!(outbox.try_pop(), Some(PlayerMessage::EndOfAudio));
    }
}
