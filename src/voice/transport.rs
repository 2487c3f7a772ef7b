//! HTTP transport to the interview agent.
//!
//! Outbound audio goes out as one `POST send/{user}` per chunk. Inbound
//! frames arrive on a long-lived `GET events/{user}/{interview}` response in
//! server-sent-event framing.

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use super::error::TransportError;
use super::types::{AgentFrame, OutboundChunk};
use crate::config::SessionConfig;

const CONNECT_TIMEOUT_MS: u64 = 5_000;

/// What the inbound channel reports to the pipeline.
#[derive(Debug)]
pub enum ChannelEvent {
    Opened,
    Frame(AgentFrame),
    /// The channel is gone; no further events follow.
    Lost(String),
}

#[derive(Clone)]
pub struct Transport {
    client: reqwest::Client,
    send_url: String,
    events_url: String,
    request_timeout: Duration,
}

impl Transport {
    pub fn new(config: &SessionConfig) -> Result<Self, TransportError> {
        let base = config.base_url.trim_end_matches('/');
        if base.is_empty() {
            return Err(TransportError::InvalidEndpoint("empty base url".to_string()));
        }
        // No overall timeout on the client: the event stream stays open
        // indefinitely. Sends apply their own.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(CONNECT_TIMEOUT_MS))
            .build()
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;

        Ok(Self {
            client,
            send_url: format!("{}/send/{}", base, config.user_id),
            events_url: format!("{}/events/{}/{}", base, config.user_id, config.interview_id),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        })
    }

    pub fn send_url(&self) -> &str {
        &self.send_url
    }

    pub fn events_url(&self) -> &str {
        &self.events_url
    }

    /// Deliver one chunk. Non-2xx responses, network errors and JSON bodies
    /// carrying an `error` field all count as failure.
    pub async fn send_chunk(&self, chunk: &OutboundChunk) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&self.send_url)
            .timeout(self.request_timeout)
            .json(chunk)
            .send()
            .await
            .map_err(|e| TransportError::SendFailed {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(TransportError::SendFailed {
                status: Some(status.as_u16()),
                message: body,
            });
        }
        if let Some(error) = body_error(&body) {
            return Err(TransportError::SendFailed {
                status: Some(status.as_u16()),
                message: error,
            });
        }
        Ok(())
    }

    /// Connect the inbound channel in the background. The returned receiver
    /// yields `Opened` once the server accepts, then frames, and finally a
    /// single `Lost`.
    pub fn open_events(
        &self,
    ) -> (tokio::task::JoinHandle<()>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let url = self.events_url.clone();

        let handle = tokio::spawn(async move {
            let reason = match read_events(&client, &url, &tx).await {
                Ok(()) => "event stream closed by server".to_string(),
                Err(e) => e.to_string(),
            };
            let _ = tx.send(ChannelEvent::Lost(reason));
        });

        (handle, rx)
    }
}

async fn read_events(
    client: &reqwest::Client,
    url: &str,
    tx: &mpsc::UnboundedSender<ChannelEvent>,
) -> Result<(), TransportError> {
    let response = client
        .get(url)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
        .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::ConnectionLost(format!(
            "event stream returned HTTP {}",
            status
        )));
    }

    log::info!("Event channel open: {}", url);
    if tx.send(ChannelEvent::Opened).is_err() {
        return Ok(());
    }
    pump_events(response.bytes_stream(), tx).await
}

async fn pump_events(
    byte_stream: impl futures_util::Stream<Item = Result<bytes::Bytes, reqwest::Error>>,
    tx: &mpsc::UnboundedSender<ChannelEvent>,
) -> Result<(), TransportError> {
    let mut decoder = SseDecoder::default();
    let mut stream = Box::pin(byte_stream);

    while let Some(result) = stream.next().await {
        let bytes = result.map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
        for data in decoder.feed(&bytes) {
            match AgentFrame::from_json(&data) {
                Ok(frame) => {
                    if tx.send(ChannelEvent::Frame(frame)).is_err() {
                        return Ok(());
                    }
                }
                Err(e) => log::warn!("Dropping inbound frame: {}", e),
            }
        }
    }
    Ok(())
}

fn body_error(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.get("error")? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Incremental server-sent-event decoder. Yields the `data` payload of each
/// complete event; multi-line data is joined with `\n`.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..pos]);
            let line = line.trim_end_matches('\r');

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("data:") {
                self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            }
            // event:, id: and retry: carry nothing we use.
        }
        events
    }
}
