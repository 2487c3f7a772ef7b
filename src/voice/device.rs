//! Audio device lookup and the threads that keep cpal streams alive.
//!
//! A cpal stream is not `Send` on every platform, so each one is built,
//! played and dropped on its own thread. The handle returned to the session
//! is `Send` and closes the stream synchronously when dropped.

use std::sync::mpsc as std_mpsc;
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig, SupportedStreamConfigRange};
use tokio::sync::mpsc;

use super::error::SessionError;

/// Error raised on a real-time thread, forwarded to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioFault {
    DeviceLost(String),
    Stream(String),
}

impl AudioFault {
    pub fn from_stream_error(err: cpal::StreamError) -> Self {
        match err {
            cpal::StreamError::DeviceNotAvailable => {
                AudioFault::DeviceLost("audio device no longer available".to_string())
            }
            other => AudioFault::Stream(other.to_string()),
        }
    }
}

pub type FaultSender = mpsc::UnboundedSender<AudioFault>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// What was actually opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub device_name: String,
    pub sample_rate: u32,
    pub channels: usize,
}

pub fn find_device(direction: Direction, name: Option<&str>) -> Result<cpal::Device, SessionError> {
    let host = cpal::default_host();
    match (direction, name) {
        (Direction::Input, Some(name)) => host
            .input_devices()
            .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| {
                SessionError::DeviceUnavailable(format!("input device '{}' not found", name))
            }),
        (Direction::Input, None) => host
            .default_input_device()
            .ok_or_else(|| SessionError::DeviceUnavailable("no default input device".to_string())),
        (Direction::Output, Some(name)) => host
            .output_devices()
            .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| {
                SessionError::DeviceUnavailable(format!("output device '{}' not found", name))
            }),
        (Direction::Output, None) => host
            .default_output_device()
            .ok_or_else(|| SessionError::DeviceUnavailable("no default output device".to_string())),
    }
}

/// Prefer an f32 stream at exactly the pipeline rate and channel count so no
/// conversion is needed; otherwise fall back to the device default.
pub fn choose_config(
    device: &cpal::Device,
    direction: Direction,
    want_rate: u32,
    want_channels: u16,
) -> Result<StreamConfig, SessionError> {
    let ranges: Vec<SupportedStreamConfigRange> = match direction {
        Direction::Input => device
            .supported_input_configs()
            .map(|configs| configs.collect())
            .unwrap_or_default(),
        Direction::Output => device
            .supported_output_configs()
            .map(|configs| configs.collect())
            .unwrap_or_default(),
    };
    if let Some(config) = exact_config(&ranges, want_rate, want_channels) {
        return Ok(config);
    }

    let supported = match direction {
        Direction::Input => device.default_input_config(),
        Direction::Output => device.default_output_config(),
    }
    .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))?;

    Ok(StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    })
}

fn exact_config(
    ranges: &[SupportedStreamConfigRange],
    want_rate: u32,
    want_channels: u16,
) -> Option<StreamConfig> {
    ranges
        .iter()
        .find(|r| {
            r.channels() == want_channels
                && r.sample_format() == SampleFormat::F32
                && r.min_sample_rate().0 <= want_rate
                && want_rate <= r.max_sample_rate().0
        })
        .map(|_| StreamConfig {
            channels: want_channels,
            sample_rate: SampleRate(want_rate),
            buffer_size: cpal::BufferSize::Default,
        })
}

/// Map a stream construction failure onto the session taxonomy.
pub fn classify_build_error(err: cpal::BuildStreamError) -> SessionError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            SessionError::DeviceUnavailable("audio device not available".to_string())
        }
        cpal::BuildStreamError::BackendSpecific { err } => classify_backend_message(err.description),
        other => SessionError::Audio(other.to_string()),
    }
}

pub fn classify_play_error(err: cpal::PlayStreamError) -> SessionError {
    match err {
        cpal::PlayStreamError::DeviceNotAvailable => {
            SessionError::DeviceUnavailable("audio device not available".to_string())
        }
        cpal::PlayStreamError::BackendSpecific { err } => classify_backend_message(err.description),
    }
}

fn classify_backend_message(message: String) -> SessionError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not permitted") {
        SessionError::PermissionDenied(message)
    } else {
        SessionError::Audio(message)
    }
}

/// Owns the thread a cpal stream lives on.
pub struct StreamThread {
    stop_tx: Option<std_mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StreamThread {
    /// Run `open` on a new thread and keep the returned stream playing until
    /// this handle is dropped. Blocks until the stream is playing or failed;
    /// whatever `open` returned next to the stream is handed back.
    pub fn spawn<F, T>(name: &str, open: F) -> Result<(Self, T), SessionError>
    where
        F: FnOnce() -> Result<(cpal::Stream, T), SessionError> + Send + 'static,
        T: Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let (stream, opened) = match open() {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(classify_play_error(e)));
                    return;
                }
                let _ = ready_tx.send(Ok(opened));
                // Returns once the handle drops its sender.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| SessionError::Audio(format!("failed to spawn {}: {}", name, e)))?;

        let mut owner = Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        };
        match ready_rx.recv() {
            Ok(Ok(opened)) => Ok((owner, opened)),
            Ok(Err(e)) => {
                owner.close();
                Err(e)
            }
            Err(_) => {
                owner.close();
                Err(SessionError::Audio(format!("{} exited before opening", name)))
            }
        }
    }

    /// Stop the stream and wait for its thread. Idempotent.
    pub fn close(&mut self) {
        self.stop_tx = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Audio stream thread panicked");
            }
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.close();
    }
}

/// List available input devices.
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    host.input_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default()
}

/// List available output devices.
pub fn list_output_devices() -> Vec<String> {
    let host = cpal::default_host();
    host.output_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_permission_errors_map_to_permission_denied() {
        assert!(matches!(
            classify_backend_message("Microphone access denied by user".to_string()),
            SessionError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_backend_message("Operation not permitted".to_string()),
            SessionError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_backend_message("buffer underrun".to_string()),
            SessionError::Audio(_)
        ));
    }

    #[test]
    fn device_not_available_maps_to_unavailable() {
        assert!(matches!(
            classify_build_error(cpal::BuildStreamError::DeviceNotAvailable),
            SessionError::DeviceUnavailable(_)
        ));
        assert_eq!(
            AudioFault::from_stream_error(cpal::StreamError::DeviceNotAvailable),
            AudioFault::DeviceLost("audio device no longer available".to_string())
        );
    }

    #[test]
    fn stream_thread_reports_open_failure() {
        let result = StreamThread::spawn::<_, StreamInfo>("test-open-failure", || {
            Err(SessionError::PermissionDenied("denied".to_string()))
        });
        assert!(matches!(result, Err(SessionError::PermissionDenied(_))));
    }
}
