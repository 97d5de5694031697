use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use log::LevelFilter;
use serde_derive::Deserialize;
use thiserror::Error;

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub log_level: LogLevel,
    pub stream: StreamConfig,
    pub decoder: DecoderConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn filter(self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StreamConfig {
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub read_chunk_bytes: usize,
    /// Bounds the wait for response headers and for each read. A cancelled
    /// fetch notices within this interval even if the server goes quiet.
    pub read_timeout_ms: u64,
    /// Path for a raw dump of the demuxed audio bytes. `{uuid}` is replaced
    /// with the playback session id.
    pub stream_dump: Option<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            user_agent: concat!("icyplay/", env!("CARGO_PKG_VERSION")).to_owned(),
            connect_timeout_secs: 10,
            read_chunk_bytes: 8192,
            read_timeout_ms: 2000,
            stream_dump: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DecoderConfig {
    pub max_frames_per_chunk: usize,
    /// Peak amplitude below which a start-of-stream chunk counts as priming
    /// silence.
    pub priming_threshold: f32,
    /// Upper bound on discarded priming chunks, so a stream that genuinely
    /// starts with silence still plays.
    pub max_priming_chunks: usize,
    /// Overrides the render graph's preferred sample rate.
    pub output_sample_rate: Option<u32>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig {
            max_frames_per_chunk: 4096,
            priming_threshold: 1.0e-4,
            max_priming_chunks: 8,
            output_sample_rate: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Length of one accumulation buffer.
    pub target_latency_ms: u32,
    pub min_buffers_before_play: usize,
    pub low_water_mark: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            target_latency_ms: 1000,
            min_buffers_before_play: 3,
            low_water_mark: 2,
        }
    }
}

impl SchedulerConfig {
    /// Frame count of one accumulation buffer at `sample_rate`.
    pub fn accumulation_frames(&self, sample_rate: u32) -> usize {
        let frames = sample_rate as u64 * self.target_latency_ms as u64 / 1000;
        frames.max(1) as usize
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] io::Error),
    #[error("parsing config: {0}")]
    Toml(#[from] toml::de::Error),
}

pub fn open(path: &Path) -> Result<Config, ConfigError> {
    let mut file = File::open(path)?;
    let mut buff = String::new();
    file.read_to_string(&mut buff)?;
    parse(&buff)
}

pub fn parse(source: &str) -> Result<Config, ConfigError> {
    Ok(toml::from_str(source)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = parse("").unwrap();

        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.decoder.max_frames_per_chunk, 4096);
        assert_eq!(config.scheduler.min_buffers_before_play, 3);
        assert!(config.stream.stream_dump.is_none());
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = parse(
            r#"
            log_level = "debug"

            [stream]
            stream_dump = "/tmp/dump-{uuid}.mp3"

            [scheduler]
            min_buffers_before_play = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level.filter(), LevelFilter::Debug);
        assert_eq!(config.stream.read_chunk_bytes, 8192);
        assert_eq!(config.stream.read_timeout_ms, 2000);
        assert_eq!(config.stream.stream_dump.as_deref(), Some("/tmp/dump-{uuid}.mp3"));
        assert_eq!(config.scheduler.min_buffers_before_play, 5);
        assert_eq!(config.scheduler.low_water_mark, 2);
    }

    #[test]
    fn accumulation_window_follows_sample_rate() {
        let scheduler = SchedulerConfig::default();

        assert_eq!(scheduler.accumulation_frames(44_100), 44_100);
        assert_eq!(scheduler.accumulation_frames(48_000), 48_000);
    }

    #[test]
    fn rejects_unknown_log_level() {
        assert!(matches!(parse("log_level = \"loud\""), Err(ConfigError::Toml(_))));
    }
}
