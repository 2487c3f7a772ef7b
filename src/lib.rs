//! Live voice interview client: microphone capture with RMS speech
//! segmentation, chunked upload to the interview agent and streamed playback
//! of its replies.

pub mod config;
pub mod voice;

pub use config::{AppConfig, SessionConfig};
pub use voice::InterviewSession;
