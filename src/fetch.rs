//! Network context: one HTTP GET per session, demuxed and parsed inline.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use reqwest::blocking::{Client, Response};
use reqwest::header::HeaderMap;
use serde_derive::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::decoder::DecodeMsg;
use crate::frame::ContainerType;
use crate::icy::{IcyDemuxer, IcySegment};
use crate::parser::{ParserEvent, StreamParser};
use crate::player::PlayerError;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server responded {0}")]
    Status(reqwest::StatusCode),
    #[error("reading stream: {0}")]
    Io(#[from] io::Error),
}

/// What the response headers say about the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    pub name: Option<String>,
    /// kbit/s, as announced by `icy-br`.
    pub bitrate: Option<u32>,
    pub content_type: Option<String>,
    pub metaint: Option<usize>,
}

impl StreamInfo {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };

        StreamInfo {
            name: text("icy-name"),
            bitrate: text("icy-br").and_then(|value| value.parse().ok()),
            content_type: text("content-type"),
            metaint: text("icy-metaint")
                .and_then(|value| value.parse().ok())
                .filter(|&metaint| metaint > 0),
        }
    }

    pub fn container(&self) -> ContainerType {
        ContainerType::from_content_type(self.content_type.as_deref())
    }
}

fn open_stream(url: &str, config: &StreamConfig) -> Result<Response, FetchError> {
    let client = Client::builder()
        .user_agent(config.user_agent.clone())
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        // the blocking client applies this per read, not to the whole body
        .timeout(Duration::from_millis(config.read_timeout_ms.max(1)))
        .build()?;

    let response = client.get(url).header("Icy-MetaData", "1").send()?;

    if !response.status().is_success() {
        return Err(FetchError::Status(response.status()));
    }

    Ok(response)
}

/// Starts the network thread. It ends on its own at end of stream, on
/// error, or once `cancel` is set; a cancelled fetch sends nothing more.
pub fn spawn(
    url: String,
    session: Uuid,
    config: StreamConfig,
    output: Sender<DecodeMsg>,
    cancel: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("icy-fetch".to_owned())
        .spawn(move || {
            let result = run(&url, session, &config, &output, &cancel);

            if cancel.load(Ordering::Acquire) {
                debug!("[{}] fetch cancelled", session);
                return;
            }

            let end = match result {
                Ok(()) => {
                    info!("[{}] stream ended", session);
                    None
                }
                Err(e) => {
                    error!("[{}] {}", session, e);
                    Some(PlayerError::Fetch(e))
                }
            };
            let _ = output.send(DecodeMsg::End(end));
        })
}

fn run(
    url: &str,
    session: Uuid,
    config: &StreamConfig,
    output: &Sender<DecodeMsg>,
    cancel: &AtomicBool,
) -> Result<(), FetchError> {
    info!("[{}] connecting to {}", session, url);
    let mut response = open_stream(url, config)?;

    let info = StreamInfo::from_headers(response.headers());
    info!(
        "[{}] connected: {} ({}), metaint {:?}",
        session,
        info.name.as_deref().unwrap_or("unnamed stream"),
        info.content_type.as_deref().unwrap_or("no content-type"),
        info.metaint
    );

    let mut demuxer = IcyDemuxer::new(info.metaint);
    let mut parser = StreamParser::new(info.container());
    let mut dump = open_dump(config, session);

    if output.send(DecodeMsg::StreamInfo(info)).is_err() {
        return Ok(());
    }

    let mut buffer = vec![0u8; config.read_chunk_bytes.max(1)];
    let mut downstream_gone = false;

    while !cancel.load(Ordering::Acquire) && !downstream_gone {
        let read = match response.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if is_read_timeout(e) => continue,
            Err(e) => return Err(FetchError::Io(e)),
        };

        let mut dump_error = None;

        demuxer.push(&buffer[..read], |segment| match segment {
            IcySegment::Audio(bytes) => {
                if let Some(ref mut file) = dump {
                    if let Err(e) = file.write_all(bytes) {
                        dump_error = Some(e);
                    }
                }
                parser.parse(bytes, |event| {
                    let msg = match event {
                        ParserEvent::FormatDiscovered(format) => DecodeMsg::Format(format),
                        ParserEvent::MagicCookie(cookie) => DecodeMsg::MagicCookie(cookie),
                        ParserEvent::Packets(batch) => DecodeMsg::Packets(batch),
                    };
                    if output.send(msg).is_err() {
                        downstream_gone = true;
                    }
                });
            }
            IcySegment::Metadata { title: Some(title) } => {
                info!("[{}] now playing: {}", session, title);
                if output.send(DecodeMsg::Metadata(title)).is_err() {
                    downstream_gone = true;
                }
            }
            IcySegment::Metadata { title: None } => {}
        });

        if let Some(e) = dump_error {
            warn!("[{}] stream dump failed, no longer dumping: {}", session, e);
            dump = None;
        }
    }

    if let Some(mut file) = dump {
        if let Err(e) = file.flush() {
            warn!("[{}] flushing stream dump: {}", session, e);
        }
    }

    debug!(
        "[{}] fetch done: {} audio bytes, {} metadata bytes, {} skipped",
        session,
        demuxer.audio_bytes(),
        demuxer.metadata_bytes(),
        parser.skipped_bytes()
    );
    Ok(())
}

/// A quiet server, not a broken one: the loop goes round to check `cancel`.
fn is_read_timeout(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    e.get_ref()
        .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
        .map_or(false, reqwest::Error::is_timeout)
}

fn open_dump(config: &StreamConfig, session: Uuid) -> Option<BufWriter<File>> {
    let path = config.stream_dump.as_ref()?.replace("{uuid}", &session.to_string());

    match File::create(&path) {
        Ok(file) => {
            info!("[{}] dumping stream audio to {}", session, path);
            Some(BufWriter::new(file))
        }
        Err(e) => {
            warn!("[{}] cannot create stream dump {}: {}", session, path, e);
            None
        }
    }
}
