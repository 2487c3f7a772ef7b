//! Command-line options and the session configuration they produce.

use clap::Parser;

use crate::voice::error::ConfigError;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:5000/api/v2/interviews";
pub const DEFAULT_CAPTURE_SAMPLE_RATE: u32 = 16_000;
pub const DEFAULT_PLAYBACK_SAMPLE_RATE: u32 = 24_000;
pub const DEFAULT_BLOCK_SIZE: usize = 128;
pub const DEFAULT_SILENCE_THRESHOLD: f32 = crate::voice::speaking::DEFAULT_SILENCE_THRESHOLD;
pub const DEFAULT_DETECTION_WINDOW_MS: u64 = 50;
pub const DEFAULT_ENERGY_HISTORY_MS: u64 = 2_000;
pub const DEFAULT_INITIAL_SEND_DELAY_MS: u64 = 500;
pub const DEFAULT_PROGRESSIVE_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_SILENCE_DURATION_MS: u64 = 800;
pub const DEFAULT_TRAILING_WINDOW_MS: u64 = 500;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 2_000;
pub const DEFAULT_PLAYBACK_BUFFER_SECS: u64 = 180;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Everything one interview session needs. Timings are milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub base_url: String,
    pub user_id: String,
    pub interview_id: String,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub block_size: usize,
    pub silence_threshold: f32,
    pub detection_window_ms: u64,
    pub energy_history_ms: u64,
    pub initial_send_delay_ms: u64,
    pub progressive_interval_ms: u64,
    pub silence_duration_ms: u64,
    pub trailing_window_ms: u64,
    pub reconnect_delay_ms: u64,
    pub playback_buffer_secs: u64,
    pub request_timeout_ms: u64,
    /// Cut agent playback locally as soon as the user starts talking.
    pub barge_in: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_id: String::new(),
            interview_id: String::new(),
            input_device: None,
            output_device: None,
            capture_sample_rate: DEFAULT_CAPTURE_SAMPLE_RATE,
            playback_sample_rate: DEFAULT_PLAYBACK_SAMPLE_RATE,
            block_size: DEFAULT_BLOCK_SIZE,
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
            detection_window_ms: DEFAULT_DETECTION_WINDOW_MS,
            energy_history_ms: DEFAULT_ENERGY_HISTORY_MS,
            initial_send_delay_ms: DEFAULT_INITIAL_SEND_DELAY_MS,
            progressive_interval_ms: DEFAULT_PROGRESSIVE_INTERVAL_MS,
            silence_duration_ms: DEFAULT_SILENCE_DURATION_MS,
            trailing_window_ms: DEFAULT_TRAILING_WINDOW_MS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            playback_buffer_secs: DEFAULT_PLAYBACK_BUFFER_SECS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            barge_in: false,
        }
    }
}

impl SessionConfig {
    /// Check value ranges. Missing ids are not checked here; they are a
    /// start-time precondition of the session.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&'static str, u64); 10] = [
            ("capture_sample_rate", self.capture_sample_rate as u64),
            ("playback_sample_rate", self.playback_sample_rate as u64),
            ("block_size", self.block_size as u64),
            ("detection_window_ms", self.detection_window_ms),
            ("energy_history_ms", self.energy_history_ms),
            ("progressive_interval_ms", self.progressive_interval_ms),
            ("silence_duration_ms", self.silence_duration_ms),
            ("reconnect_delay_ms", self.reconnect_delay_ms),
            ("playback_buffer_secs", self.playback_buffer_secs),
            ("request_timeout_ms", self.request_timeout_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::NotPositive { field });
            }
        }

        if !(self.silence_threshold > 0.0 && self.silence_threshold <= 1.0) {
            return Err(ConfigError::Threshold(self.silence_threshold));
        }

        if self.trailing_window_ms > self.energy_history_ms {
            return Err(ConfigError::TrailingWindow {
                trailing_ms: self.trailing_window_ms,
                history_ms: self.energy_history_ms,
            });
        }

        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::BaseUrl(self.base_url.clone()));
        }

        Ok(())
    }
}

/// CLI options for the interview voice client.
#[derive(Debug, Parser, Clone)]
#[command(about = "Live voice interview client", author, version)]
pub struct AppConfig {
    /// Interview API base URL (events and send endpoints live below it)
    #[arg(long, env = "INTERVIEW_VOICE_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Authenticated user id
    #[arg(long, env = "INTERVIEW_VOICE_USER_ID", default_value = "")]
    pub user_id: String,

    /// Interview to join
    #[arg(long, env = "INTERVIEW_VOICE_INTERVIEW_ID", default_value = "")]
    pub interview_id: String,

    /// Preferred audio input device name
    #[arg(long, env = "INTERVIEW_VOICE_INPUT_DEVICE")]
    pub input_device: Option<String>,

    /// Preferred audio output device name
    #[arg(long, env = "INTERVIEW_VOICE_OUTPUT_DEVICE")]
    pub output_device: Option<String>,

    /// Print audio input and output devices and exit
    #[arg(long = "list-devices", default_value_t = false)]
    pub list_devices: bool,

    /// RMS level below which a 50 ms window counts as silence
    #[arg(long, env = "INTERVIEW_VOICE_SILENCE_THRESHOLD", default_value_t = DEFAULT_SILENCE_THRESHOLD)]
    pub silence_threshold: f32,

    /// Delay before the first partial chunk of an utterance (milliseconds)
    #[arg(long, env = "INTERVIEW_VOICE_INITIAL_SEND_DELAY_MS", default_value_t = DEFAULT_INITIAL_SEND_DELAY_MS)]
    pub initial_send_delay_ms: u64,

    /// Interval between partial chunks while speaking (milliseconds)
    #[arg(long, env = "INTERVIEW_VOICE_PROGRESSIVE_INTERVAL_MS", default_value_t = DEFAULT_PROGRESSIVE_INTERVAL_MS)]
    pub progressive_interval_ms: u64,

    /// Silence that ends an utterance (milliseconds)
    #[arg(long, env = "INTERVIEW_VOICE_SILENCE_DURATION_MS", default_value_t = DEFAULT_SILENCE_DURATION_MS)]
    pub silence_duration_ms: u64,

    /// Audio kept after a partial chunk for continuity (milliseconds)
    #[arg(long, env = "INTERVIEW_VOICE_TRAILING_WINDOW_MS", default_value_t = DEFAULT_TRAILING_WINDOW_MS)]
    pub trailing_window_ms: u64,

    /// Delay before reconnecting a lost event channel (milliseconds)
    #[arg(long, env = "INTERVIEW_VOICE_RECONNECT_DELAY_MS", default_value_t = DEFAULT_RECONNECT_DELAY_MS)]
    pub reconnect_delay_ms: u64,

    /// Timeout for each outbound audio request (milliseconds)
    #[arg(long, env = "INTERVIEW_VOICE_REQUEST_TIMEOUT_MS", default_value_t = DEFAULT_REQUEST_TIMEOUT_MS)]
    pub request_timeout_ms: u64,

    /// Stop agent playback as soon as local speech starts
    #[arg(long = "barge-in", env = "INTERVIEW_VOICE_BARGE_IN", default_value_t = false)]
    pub barge_in: bool,

    /// Emit logs as JSON lines
    #[arg(long = "log-json", env = "INTERVIEW_VOICE_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl AppConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            base_url: self.base_url.trim_end_matches('/').to_string(),
            user_id: self.user_id.trim().to_string(),
            interview_id: self.interview_id.trim().to_string(),
            input_device: self.input_device.clone(),
            output_device: self.output_device.clone(),
            silence_threshold: self.silence_threshold,
            initial_send_delay_ms: self.initial_send_delay_ms,
            progressive_interval_ms: self.progressive_interval_ms,
            silence_duration_ms: self.silence_duration_ms,
            trailing_window_ms: self.trailing_window_ms,
            reconnect_delay_ms: self.reconnect_delay_ms,
            request_timeout_ms: self.request_timeout_ms,
            barge_in: self.barge_in,
            ..SessionConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(SessionConfig::default().validate(), Ok(()));
    }

    #[test]
    fn cli_defaults_match_session_defaults() {
        let cfg = AppConfig::parse_from(["interview-voice"]).session_config();
        assert_eq!(cfg, SessionConfig::default());
    }

    #[test]
    fn cli_overrides_reach_session_config() {
        let cfg = AppConfig::parse_from([
            "interview-voice",
            "--base-url",
            "https://api.example.test/v2/interviews/",
            "--user-id",
            " 42 ",
            "--interview-id",
            "7",
            "--silence-duration-ms",
            "1200",
            "--barge-in",
        ])
        .session_config();
        assert_eq!(cfg.base_url, "https://api.example.test/v2/interviews");
        assert_eq!(cfg.user_id, "42");
        assert_eq!(cfg.interview_id, "7");
        assert_eq!(cfg.silence_duration_ms, 1200);
        assert!(cfg.barge_in);
    }

    #[test]
    fn zero_durations_are_rejected() {
        let cfg = SessionConfig {
            silence_duration_ms: 0,
            ..SessionConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::NotPositive {
                field: "silence_duration_ms"
            })
        );
    }

    #[test]
    fn threshold_must_be_in_unit_range() {
        for bad in [0.0, -0.1, 1.5, f32::NAN] {
            let cfg = SessionConfig {
                silence_threshold: bad,
                ..SessionConfig::default()
            };
            assert!(matches!(cfg.validate(), Err(ConfigError::Threshold(_))));
        }
    }

    #[test]
    fn trailing_window_cannot_exceed_history() {
        let cfg = SessionConfig {
            trailing_window_ms: 3_000,
            ..SessionConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::TrailingWindow { .. })
        ));
    }

    #[test]
    fn base_url_needs_http_scheme() {
        let cfg = SessionConfig {
            base_url: "ftp://example.test".to_string(),
            ..SessionConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::BaseUrl(_))));
    }
}
