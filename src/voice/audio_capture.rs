use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::DeviceTrait;
use ringbuf::{HeapCons, HeapRb, traits::{Consumer, Observer, Split}};
use tokio::sync::mpsc;

use super::device::{
    choose_config, classify_build_error, find_device, AudioFault, Direction, FaultSender,
    StreamInfo, StreamThread,
};
use super::error::SessionError;
use super::processor::{BlockProcessor, CaptureProcessor};
use super::resampler::RateConverter;
use super::types::AudioBlock;
use crate::config::SessionConfig;

const DRAIN_INTERVAL_MS: u64 = 5;
const RESAMPLE_CHUNK_MS: u32 = 10;

/// Microphone capture delivering fixed-size mono blocks at the pipeline rate.
pub struct AudioCapture {
    stream: Option<StreamThread>,
    drain_handle: Option<tokio::task::JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
    pub block_rx: Option<mpsc::UnboundedReceiver<AudioBlock>>,
}

impl AudioCapture {
    pub fn new() -> Self {
        Self {
            stream: None,
            drain_handle: None,
            dropped: Arc::new(AtomicU64::new(0)),
            block_rx: None,
        }
    }

    /// Open the configured input device and start producing blocks of
    /// `config.block_size` samples at `config.capture_sample_rate`.
    /// Stream errors after start are reported through `faults`.
    pub async fn start(
        &mut self,
        config: &SessionConfig,
        faults: FaultSender,
    ) -> Result<(), SessionError> {
        let device_name = config.input_device.clone();
        let target_rate = config.capture_sample_rate;
        let block_size = config.block_size;
        let dropped = Arc::clone(&self.dropped);

        let (stream, (info, consumer)) = tokio::task::spawn_blocking(move || {
            StreamThread::spawn("interview-capture", move || {
                open_input(device_name.as_deref(), target_rate, dropped, faults)
            })
        })
        .await
        .map_err(|e| SessionError::Audio(format!("capture setup task failed: {}", e)))??;

        log::info!(
            "Capture device: {} ({}Hz, {}ch)",
            info.device_name,
            info.sample_rate,
            info.channels,
        );

        let mut converter = RateConverter::new(info.sample_rate, target_rate, RESAMPLE_CHUNK_MS)?;
        let (block_tx, block_rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            let mut consumer = consumer;
            let mut raw = Vec::new();
            let mut pending = Vec::new();

            loop {
                tokio::time::sleep(Duration::from_millis(DRAIN_INTERVAL_MS)).await;

                raw.clear();
                while consumer.occupied_len() > 0 {
                    match consumer.try_pop() {
                        Some(sample) => raw.push(sample),
                        None => break,
                    }
                }
                if raw.is_empty() {
                    continue;
                }

                converter.process(&raw, &mut pending);

                let whole = pending.len() - pending.len() % block_size;
                let ready: Vec<f32> = pending.drain(..whole).collect();
                for samples in ready.chunks(block_size) {
                    if block_tx.send(AudioBlock::from_samples(samples.to_vec())).is_err() {
                        return;
                    }
                }
            }
        });

        self.stream = Some(stream);
        self.drain_handle = Some(handle);
        self.block_rx = Some(block_rx);
        Ok(())
    }

    /// Release the microphone. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
        if let Some(handle) = self.drain_handle.take() {
            handle.abort();
        }
        self.block_rx = None;
    }

    /// Samples lost because the drain task fell behind the device.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }
}

impl Default for AudioCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_input(
    device_name: Option<&str>,
    target_rate: u32,
    dropped: Arc<AtomicU64>,
    faults: FaultSender,
) -> Result<(cpal::Stream, (StreamInfo, HeapCons<f32>)), SessionError> {
    let device = find_device(Direction::Input, device_name)?;
    let config = choose_config(&device, Direction::Input, target_rate, 1)?;
    let info = StreamInfo {
        device_name: device.name().unwrap_or_default(),
        sample_rate: config.sample_rate.0,
        channels: config.channels as usize,
    };

    // ~200ms of mono audio at device rate
    let buf_size = (info.sample_rate as usize * 200) / 1000;
    let (producer, consumer) = HeapRb::<f32>::new(buf_size.max(8192)).split();
    let mut processor = CaptureProcessor::new(producer, info.channels, dropped);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                processor.on_block(data, &mut []);
            },
            move |err| {
                log::error!("cpal input error: {}", err);
                let _ = faults.send(AudioFault::from_stream_error(err));
            },
            None,
        )
        .map_err(classify_build_error)?;

    Ok((stream, (info, consumer)))
}
