pub mod audio_capture;
pub mod audio_playback;
pub mod device;
pub mod error;
pub mod pcm;
pub mod processor;
pub mod reconnect;
pub mod resampler;
pub mod scheduler;
pub mod speaking;
pub mod transport;
pub mod types;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use audio_capture::AudioCapture;
use audio_playback::{AudioPlayback, PlaybackHandle};
use device::{AudioFault, Direction};
use error::{DecodeError, SessionError, TransportError};
use reconnect::ReconnectTimer;
use scheduler::{ChunkScheduler, SchedulerConfig};
use transport::{ChannelEvent, Transport};
use types::*;

use crate::config::SessionConfig;

/// What the pipeline task reports back to the session.
#[derive(Debug)]
enum PipelineEvent {
    Connected,
    AgentText(String),
    TurnComplete { interrupted: bool },
    Lost(SessionError),
}

/// One live voice interview: owns the devices, the pipeline task and the
/// reconnect timer.
pub struct InterviewSession {
    config: SessionConfig,
    capture: AudioCapture,
    playback: AudioPlayback,
    pipeline: Option<tokio::task::JoinHandle<()>>,
    event_rx: Option<mpsc::UnboundedReceiver<PipelineEvent>>,
    playback_dropped: Option<Arc<AtomicU64>>,
    reconnect: ReconnectTimer,
    generation: u64,
    status: ConnectionStatus,
    messages: Vec<AgentMessage>,
    pending: VecDeque<SessionEvent>,
}

impl InterviewSession {
    pub fn new(config: SessionConfig) -> Self {
        let reconnect = ReconnectTimer::new(Duration::from_millis(config.reconnect_delay_ms));
        Self {
            config,
            capture: AudioCapture::new(),
            playback: AudioPlayback::new(),
            pipeline: None,
            event_rx: None,
            playback_dropped: None,
            reconnect,
            generation: 0,
            status: ConnectionStatus::Disconnected,
            messages: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    /// Agent messages received so far, oldest first.
    pub fn messages(&self) -> &[AgentMessage] {
        &self.messages
    }

    fn is_running(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Open playback, capture and the event channel. A no-op if the session
    /// is already running.
    pub async fn start_streaming(&mut self) -> Result<(), SessionError> {
        if self.is_connected() || self.is_running() {
            return Ok(());
        }

        if self.config.user_id.is_empty() || self.config.interview_id.is_empty() {
            return Err(SessionError::PreconditionFailure(
                "user id and interview id are required".to_string(),
            ));
        }
        self.config
            .validate()
            .map_err(|e| SessionError::PreconditionFailure(e.to_string()))?;

        let input = self.config.input_device.clone();
        let output = self.config.output_device.clone();
        tokio::task::spawn_blocking(move || check_capability(input.as_deref(), output.as_deref()))
            .await
            .map_err(|e| SessionError::Audio(format!("capability check failed: {}", e)))??;

        self.reconnect.cancel();
        self.teardown();
        self.generation += 1;
        self.set_status(ConnectionStatus::Connecting);

        match self.open_pipeline().await {
            Ok(()) => {
                log::info!(
                    "Interview session started (user {}, interview {})",
                    self.config.user_id,
                    self.config.interview_id
                );
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to start interview session: {}", e);
                self.teardown();
                self.set_status(ConnectionStatus::Disconnected);
                Err(e)
            }
        }
    }

    async fn open_pipeline(&mut self) -> Result<(), SessionError> {
        let transport = Transport::new(&self.config)?;
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();

        let playback = self.playback.start(&self.config, fault_tx.clone()).await?;
        self.playback_dropped = Some(playback.dropped_counter());

        self.capture.start(&self.config, fault_tx).await?;
        let blocks = self
            .capture
            .block_rx
            .take()
            .ok_or_else(|| SessionError::Audio("capture produced no block stream".to_string()))?;

        let (channel_handle, channel_rx) = transport.open_events();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let pipeline = Pipeline {
            scheduler: ChunkScheduler::new(SchedulerConfig::from_session(&self.config)),
            transport,
            playback,
            barge_in: self.config.barge_in,
            events: event_tx,
            in_flight: None,
            channel_handle,
        };
        self.pipeline = Some(tokio::spawn(pipeline.run(blocks, channel_rx, fault_rx)));
        self.event_rx = Some(event_rx);
        Ok(())
    }

    /// Close the channel, release both devices and drop every buffer and
    /// timer. Safe to call at any time, any number of times.
    pub fn stop_streaming(&mut self) {
        self.generation += 1;
        self.reconnect.cancel();
        let was_running = self.is_running();
        self.teardown();
        self.set_status(ConnectionStatus::Disconnected);
        if was_running {
            log::info!("Interview session stopped");
        }
    }

    fn teardown(&mut self) {
        if let Some(handle) = self.pipeline.take() {
            handle.abort();
        }
        self.event_rx = None;
        let had_devices = self.capture.is_running() || self.playback.is_running();
        self.capture.stop();
        self.playback.stop();

        if had_devices {
            let playback_dropped = self
                .playback_dropped
                .take()
                .map(|c| c.load(Ordering::Relaxed))
                .unwrap_or(0);
            log::info!(
                "Audio released (capture dropped {} samples, playback dropped {} samples)",
                self.capture.dropped_samples(),
                playback_dropped
            );
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            self.status = status;
            self.pending.push_back(SessionEvent::Status(status));
        }
    }

    /// Wait for the next observable change. Also runs the reconnect timer,
    /// so a caller that wants automatic reconnection must keep polling.
    /// Returns `None` once nothing is running or pending.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.event_rx.is_none() && !self.reconnect.is_pending() {
                return None;
            }

            let reconnect_due = self.reconnect.due();
            tokio::select! {
                event = recv_or_pending(&mut self.event_rx) => match event {
                    Some(event) => self.on_pipeline_event(event),
                    None => self.on_pipeline_event(PipelineEvent::Lost(
                        SessionError::ConnectionLost("pipeline ended".to_string()),
                    )),
                },
                _ = sleep_until_or_pending(reconnect_due) => self.fire_reconnect().await,
            }
        }
    }

    fn on_pipeline_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Connected => self.set_status(ConnectionStatus::Connected),
            PipelineEvent::AgentText(text) => {
                let message = AgentMessage {
                    kind: MessageKind::Agent,
                    text,
                };
                self.messages.push(message.clone());
                self.pending.push_back(SessionEvent::Message(message));
            }
            PipelineEvent::TurnComplete { interrupted } => {
                self.pending
                    .push_back(SessionEvent::TurnComplete { interrupted });
            }
            PipelineEvent::Lost(err) => self.on_lost(err),
        }
    }

    fn on_lost(&mut self, err: SessionError) {
        log::warn!("Interview session lost: {}", err);
        self.teardown();
        self.set_status(ConnectionStatus::Disconnected);

        if matches!(err, SessionError::PermissionDenied(_)) {
            return;
        }
        if self.reconnect.schedule(self.generation, Instant::now()) {
            log::info!("Reconnecting in {}ms", self.config.reconnect_delay_ms);
        } else {
            log::debug!("Reconnect already pending");
        }
        self.set_status(ConnectionStatus::Connecting);
    }

    async fn fire_reconnect(&mut self) {
        if !self.reconnect.take_if_current(self.generation) {
            return;
        }
        log::info!("Reconnecting interview session");
        match self.start_streaming().await {
            Ok(()) => {}
            Err(e @ (SessionError::PreconditionFailure(_) | SessionError::PermissionDenied(_))) => {
                log::error!("Reconnect abandoned: {}", e);
                self.set_status(ConnectionStatus::Disconnected);
            }
            Err(e) => self.on_lost(e),
        }
    }
}

impl Drop for InterviewSession {
    fn drop(&mut self) {
        self.stop_streaming();
    }
}

/// Fail early when the host has no usable input or output device.
fn check_capability(input: Option<&str>, output: Option<&str>) -> Result<(), SessionError> {
    device::find_device(Direction::Input, input)?;
    device::find_device(Direction::Output, output)?;
    Ok(())
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

type SendHandle = tokio::task::JoinHandle<Result<(), TransportError>>;

/// Main-domain state: everything the scheduler timers and the network
/// callbacks touch lives here and is only ever touched from one task.
struct Pipeline {
    scheduler: ChunkScheduler,
    transport: Transport,
    playback: PlaybackHandle,
    barge_in: bool,
    events: mpsc::UnboundedSender<PipelineEvent>,
    in_flight: Option<SendHandle>,
    channel_handle: tokio::task::JoinHandle<()>,
}

impl Pipeline {
    async fn run(
        mut self,
        mut blocks: mpsc::UnboundedReceiver<AudioBlock>,
        mut channel: mpsc::UnboundedReceiver<ChannelEvent>,
        mut faults: mpsc::UnboundedReceiver<AudioFault>,
    ) {
        loop {
            let deadline = self.scheduler.next_deadline();
            tokio::select! {
                block = blocks.recv() => match block {
                    Some(block) => self.on_block(block),
                    None => {
                        self.lost(SessionError::DeviceUnavailable("capture stopped".to_string()));
                        break;
                    }
                },
                event = channel.recv() => match event {
                    Some(ChannelEvent::Lost(reason)) => {
                        self.lost(SessionError::ConnectionLost(reason));
                        break;
                    }
                    Some(event) => self.on_channel_event(event),
                    None => {
                        self.lost(SessionError::ConnectionLost("event channel closed".to_string()));
                        break;
                    }
                },
                Some(fault) = faults.recv() => match fault {
                    AudioFault::DeviceLost(reason) => {
                        self.lost(SessionError::ConnectionLost(reason));
                        break;
                    }
                    AudioFault::Stream(reason) => log::warn!("Audio stream error: {}", reason),
                },
                result = wait_for_send(&mut self.in_flight) => {
                    self.in_flight = None;
                    let delivered = match result {
                        Ok(Ok(())) => true,
                        Ok(Err(e)) => {
                            log::warn!("{}", e);
                            false
                        }
                        Err(e) => {
                            log::warn!("Send task failed: {}", e);
                            false
                        }
                    };
                    if let Some(chunk) = self.scheduler.complete_flush(delivered) {
                        self.dispatch(chunk);
                    }
                },
                _ = sleep_until_or_pending(deadline) => {
                    if let Some(chunk) = self.scheduler.poll(Instant::now()) {
                        self.dispatch(chunk);
                    }
                },
            }
        }
    }

    fn on_block(&mut self, block: AudioBlock) {
        let outcome = self.scheduler.push_block(block, Instant::now());
        if outcome.speech_started {
            log::debug!("Speech started");
            if self.barge_in {
                self.playback.end_of_audio();
            }
        }
    }

    fn dispatch(&mut self, chunk: OutboundChunk) {
        log::info!(
            "Sending {} chunk ({} bytes base64)",
            if chunk.is_partial { "partial" } else { "final" },
            chunk.data.len()
        );
        let transport = self.transport.clone();
        self.in_flight = Some(tokio::spawn(async move {
            transport.send_chunk(&chunk).await
        }));
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => {
                let _ = self.events.send(PipelineEvent::Connected);
            }
            ChannelEvent::Frame(AgentFrame::Media(frame)) => {
                if let Err(e) = self.on_media(frame) {
                    log::warn!("Dropping inbound frame: {}", e);
                }
            }
            ChannelEvent::Frame(AgentFrame::Turn(signal)) => {
                if signal.interrupted {
                    log::info!("Agent interrupted, cutting playback");
                    self.playback.end_of_audio();
                }
                if signal.turn_complete || signal.interrupted {
                    log::debug!("Agent turn complete (interrupted: {})", signal.interrupted);
                    let _ = self.events.send(PipelineEvent::TurnComplete {
                        interrupted: signal.interrupted,
                    });
                }
            }
            // Handled by the run loop.
            ChannelEvent::Lost(_) => {}
        }
    }

    fn on_media(&mut self, frame: InboundFrame) -> Result<(), DecodeError> {
        match frame.mime_type.as_str() {
            MIME_AUDIO_PCM => {
                let pcm = pcm::decode_base64_pcm16(&frame.data)?;
                self.playback.enqueue_pcm(&pcm);
            }
            MIME_TEXT_PLAIN => {
                let _ = self.events.send(PipelineEvent::AgentText(frame.data));
            }
            other => return Err(DecodeError::UnsupportedMime(other.to_string())),
        }
        Ok(())
    }

    fn lost(&mut self, err: SessionError) {
        let _ = self.events.send(PipelineEvent::Lost(err));
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.channel_handle.abort();
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
    }
}

async fn wait_for_send(
    in_flight: &mut Option<SendHandle>,
) -> Result<Result<(), TransportError>, tokio::task::JoinError> {
    match in_flight.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}
