//! Incremental container parser: raw audio bytes in, format and packets out.

use log::{debug, info, warn};

use crate::audio::{CompressedFormat, PacketBatch, PacketDescription};
use crate::frame::{ContainerType, FrameHeader};

/// Consecutive frames required before the parser trusts a sync word.
const SYNC_FRAMES: usize = 2;

#[derive(Debug)]
pub enum ParserEvent {
    /// Emitted on the first locked frame, and again whenever the stream
    /// switches codec, sample rate or channel count.
    FormatDiscovered(CompressedFormat),
    /// Codec configuration that arrived out of band from the format.
    MagicCookie(Vec<u8>),
    Packets(PacketBatch),
}

pub struct StreamParser {
    container: ContainerType,
    buffer: Vec<u8>,
    locked: Option<FrameHeader>,
    format: Option<CompressedFormat>,
    cookie_sent: bool,
    skipped: u64,
}

impl StreamParser {
    pub fn new(container: ContainerType) -> Self {
        StreamParser {
            container: container,
            buffer: Vec::new(),
            locked: None,
            format: None,
            cookie_sent: false,
            skipped: 0,
        }
    }

    pub fn format(&self) -> Option<&CompressedFormat> {
        self.format.as_ref()
    }

    /// Bytes discarded while hunting for frame sync.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }

    /// Bytes held back until the frame they belong to is complete.
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn parse<F>(&mut self, bytes: &[u8], mut on_event: F)
    where
        F: FnMut(ParserEvent),
    {
        self.buffer.extend_from_slice(bytes);

        let mut pos = 0;
        let mut batch_start = 0;
        let mut descriptions = Vec::new();
        let mut pending_cookie = None;

        loop {
            let rest = &self.buffer[pos..];
            if rest.len() < self.container.header_len() {
                break;
            }

            let header = match self.container.parse_header(rest) {
                Some(header) => header,
                None => {
                    if let Some(lost) = self.locked.take() {
                        warn!("lost {} frame sync after {:?}", lost.codec, self.format);
                    }
                    flush(&self.buffer[batch_start..pos], &mut descriptions, &mut on_event);
                    pos += 1;
                    batch_start = pos;
                    self.skipped += 1;
                    continue;
                }
            };

            // a header that does not continue the locked stream must prove
            // itself like a first one
            let continues = self.locked.as_ref().map_or(false, |locked| locked.continues(&header));
            if !continues {
                match self.confirm_sync(rest, &header) {
                    Some(true) => {}
                    Some(false) => {
                        if self.locked.is_some() {
                            debug!("ignoring stray {} header inside the stream", header.codec);
                        }
                        flush(&self.buffer[batch_start..pos], &mut descriptions, &mut on_event);
                        pos += 1;
                        batch_start = pos;
                        self.skipped += 1;
                        continue;
                    }
                    None => break,
                }
            }

            if rest.len() < header.frame_len {
                break;
            }

            if self.format.as_ref().map_or(true, |format| format.differs_from(&header.to_format())) {
                // packets always follow the format they were framed under
                flush(&self.buffer[batch_start..pos], &mut descriptions, &mut on_event);
                batch_start = pos;

                let format = header.to_format();
                info!("discovered stream format {}", format);
                on_event(ParserEvent::FormatDiscovered(format.clone()));
                self.format = Some(format);
                self.cookie_sent = false;
            }

            if !self.cookie_sent {
                pending_cookie = header.magic_cookie();
                self.cookie_sent = true;
            }

            descriptions.push(PacketDescription {
                start_offset: pos - batch_start + header.payload_offset,
                byte_size: header.frame_len - header.payload_offset,
                frames: Some(header.samples),
            });

            self.locked = Some(header);
            pos += header.frame_len;
        }

        flush(&self.buffer[batch_start..pos], &mut descriptions, &mut on_event);

        if let Some(cookie) = pending_cookie {
            on_event(ParserEvent::MagicCookie(cookie));
        }

        if self.skipped > 0 && pos > 0 {
            debug!("{} bytes skipped hunting for sync so far", self.skipped);
        }

        self.buffer.drain(..pos);
    }

    /// `Some(true)` if `SYNC_FRAMES` compatible headers follow each other
    /// from the start of `rest`, `None` if more bytes are needed to tell.
    fn confirm_sync(&self, rest: &[u8], first: &FrameHeader) -> Option<bool> {
        let mut offset = first.frame_len;

        for _ in 1..SYNC_FRAMES {
            if rest.len() < offset + self.container.header_len() {
                return None;
            }
            match self.container.parse_header(&rest[offset..]) {
                Some(ref next) if first.is_compatible(next) => offset += next.frame_len,
                _ => return Some(false),
            }
        }

        Some(true)
    }
}

fn flush<F>(data: &[u8], descriptions: &mut Vec<PacketDescription>, on_event: &mut F)
where
    F: FnMut(ParserEvent),
{
    if descriptions.is_empty() {
        return;
    }
    let descriptions = std::mem::take(descriptions);
    on_event(ParserEvent::Packets(PacketBatch::described(data.to_vec(), descriptions)));
}
