//! ICY metadata demultiplexing.
//!
//! With `icy-metaint: N` the server sends `N` audio bytes, one length byte
//! `L`, then `L * 16` bytes of metadata text, and repeats.

use log::{debug, warn};

/// Size unit of the ICY metadata length byte.
pub const METADATA_BLOCK_UNIT: usize = 16;

#[derive(Debug, PartialEq, Eq)]
pub enum IcySegment<'a> {
    Audio(&'a [u8]),
    /// A complete metadata block. `title` is the parsed `StreamTitle`, if any.
    Metadata { title: Option<String> },
}

pub struct IcyDemuxer {
    metaint: Option<usize>,
    bytes_until_meta: i64,
    /// Length byte plus the partial metadata block carried across chunks.
    carry: Vec<u8>,
    audio_bytes: u64,
    metadata_bytes: u64,
    resyncs: u64,
}

impl IcyDemuxer {
    /// `metaint` is the `icy-metaint` response header. `None` (or zero) means
    /// the whole stream is audio.
    pub fn new(metaint: Option<usize>) -> Self {
        let metaint = metaint.filter(|&interval| interval > 0);

        IcyDemuxer {
            metaint: metaint,
            bytes_until_meta: metaint.unwrap_or(0) as i64,
            carry: Vec::new(),
            audio_bytes: 0,
            metadata_bytes: 0,
            resyncs: 0,
        }
    }

    pub fn bytes_until_meta(&self) -> i64 {
        self.bytes_until_meta
    }

    pub fn audio_bytes(&self) -> u64 {
        self.audio_bytes
    }

    pub fn metadata_bytes(&self) -> u64 {
        self.metadata_bytes
    }

    /// Bytes held back waiting for the rest of a metadata block.
    pub fn pending_bytes(&self) -> usize {
        self.carry.len()
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Splits `chunk` into audio and metadata segments, in stream order.
    pub fn push<F>(&mut self, chunk: &[u8], mut on_segment: F)
    where
        F: FnMut(IcySegment),
    {
        let metaint = match self.metaint {
            Some(metaint) => metaint,
            None => {
                if !chunk.is_empty() {
                    self.audio_bytes += chunk.len() as u64;
                    on_segment(IcySegment::Audio(chunk));
                }
                return;
            }
        };

        self.check_counter(metaint);

        let mut rest = chunk;

        while !rest.is_empty() {
            if self.bytes_until_meta > 0 {
                let take = rest.len().min(self.bytes_until_meta as usize);
                let (audio, tail) = rest.split_at(take);

                self.audio_bytes += take as u64;
                self.bytes_until_meta -= take as i64;
                on_segment(IcySegment::Audio(audio));

                rest = tail;
                continue;
            }

            if self.carry.is_empty() {
                // length byte
                self.carry.push(rest[0]);
                rest = &rest[1..];
            }

            let block_len = self.carry[0] as usize * METADATA_BLOCK_UNIT;
            let wanted = 1 + block_len - self.carry.len();
            let take = rest.len().min(wanted);
            self.carry.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.carry.len() == 1 + block_len {
                let title = if block_len == 0 {
                    None
                } else {
                    parse_stream_title(&self.carry[1..])
                };

                self.metadata_bytes += self.carry.len() as u64;
                self.carry.clear();
                self.bytes_until_meta = metaint as i64;

                if block_len > 0 {
                    debug!("metadata block of {} bytes, title {:?}", block_len, title);
                    on_segment(IcySegment::Metadata { title: title });
                }
            }
        }
    }

    fn check_counter(&mut self, metaint: usize) {
        if self.bytes_until_meta < 0 || self.bytes_until_meta > metaint as i64 {
            warn!(
                "icy counter out of range ({} for metaint {}), resynchronising",
                self.bytes_until_meta, metaint
            );
            self.bytes_until_meta = metaint as i64;
            self.carry.clear();
            self.resyncs += 1;
        }
    }

    #[cfg(test)]
    pub(crate) fn corrupt_counter(&mut self, value: i64) {
        self.bytes_until_meta = value;
    }
}

/// Extracts the text of `StreamTitle='...';` from a metadata block.
///
/// Titles may contain apostrophes, so the value runs to the `';` terminator
/// rather than the next quote. Empty titles yield `None`.
pub fn parse_stream_title(block: &[u8]) -> Option<String> {
    const KEY: &str = "StreamTitle='";

    let text = String::from_utf8_lossy(block);
    let text = text.trim_end_matches('\0');

    let start = text.find(KEY)? + KEY.len();
    let value = &text[start..];
    let end = value
        .find("';")
        .or_else(|| value.rfind('\''))
        .unwrap_or(value.len());

    let title = value[..end].trim();
    if title.is_empty() {
        None
    } else {
        Some(title.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata_block(text: &str) -> Vec<u8> {
        let units = (text.len() + METADATA_BLOCK_UNIT - 1) / METADATA_BLOCK_UNIT;
        let mut block = vec![units as u8];
        block.extend_from_slice(text.as_bytes());
        block.resize(1 + units * METADATA_BLOCK_UNIT, 0);
        block
    }

    fn stream(metaint: usize, cycles: usize, text: &str) -> Vec<u8> {
        let mut bytes = Vec::new();
        for cycle in 0..cycles {
            bytes.extend(std::iter::repeat(cycle as u8 + 1).take(metaint));
            bytes.extend(metadata_block(text));
        }
        bytes
    }

    #[derive(Default)]
    struct Collected {
        audio: Vec<u8>,
        titles: Vec<Option<String>>,
    }

    fn feed(demuxer: &mut IcyDemuxer, bytes: &[u8], chunk_size: usize, out: &mut Collected) {
        for chunk in bytes.chunks(chunk_size) {
            demuxer.push(chunk, |segment| match segment {
                IcySegment::Audio(audio) => out.audio.extend_from_slice(audio),
                IcySegment::Metadata { title } => out.titles.push(title),
            });
        }
    }

    #[test]
    fn parses_stream_title() {
        let title = parse_stream_title(b"StreamTitle='Artist - Title';\0\0\0");
        assert_eq!(title.as_deref(), Some("Artist - Title"));
    }

    #[test]
    fn title_is_trimmed_and_keeps_apostrophes() {
        let block = b"StreamTitle='  Guns N' Roses - Patience ';StreamUrl='';";
        assert_eq!(
            parse_stream_title(block).as_deref(),
            Some("Guns N' Roses - Patience")
        );
    }

    #[test]
    fn missing_or_empty_title_is_none() {
        assert_eq!(parse_stream_title(b"StreamUrl='http://x';"), None);
        assert_eq!(parse_stream_title(b"StreamTitle='';"), None);
    }

    #[test]
    fn without_metaint_everything_is_audio() {
        let mut demuxer = IcyDemuxer::new(None);
        let mut out = Collected::default();

        feed(&mut demuxer, b"StreamTitle='not metadata';", 5, &mut out);

        assert_eq!(out.audio, b"StreamTitle='not metadata';");
        assert!(out.titles.is_empty());
    }

    #[test]
    fn separates_audio_and_metadata_across_chunk_sizes() {
        let bytes = stream(64, 3, "StreamTitle='Artist - Title';");

        for chunk_size in [1, 7, 64, 65, 100, bytes.len()] {
            let mut demuxer = IcyDemuxer::new(Some(64));
            let mut out = Collected::default();

            feed(&mut demuxer, &bytes, chunk_size, &mut out);

            assert_eq!(out.audio.len(), 3 * 64, "chunk size {}", chunk_size);
            assert!(out.audio[..64].iter().all(|&b| b == 1));
            assert!(out.audio[128..].iter().all(|&b| b == 3));
            assert_eq!(out.titles, vec![Some("Artist - Title".to_owned()); 3]);
            assert_eq!(
                demuxer.audio_bytes() + demuxer.metadata_bytes() + demuxer.pending_bytes() as u64,
                bytes.len() as u64
            );
        }
    }

    #[test]
    fn byte_accounting_holds_mid_block() {
        let bytes = stream(32, 2, "StreamTitle='A long enough title to span blocks';");
        let mut demuxer = IcyDemuxer::new(Some(32));
        let mut out = Collected::default();
        let mut fed = 0;

        for chunk in bytes.chunks(11) {
            feed(&mut demuxer, chunk, chunk.len(), &mut out);
            fed += chunk.len() as u64;

            assert_eq!(
                demuxer.audio_bytes() + demuxer.metadata_bytes() + demuxer.pending_bytes() as u64,
                fed
            );
            assert!((0..=32).contains(&demuxer.bytes_until_meta()));
        }
        assert_eq!(demuxer.pending_bytes(), 0);
    }

    #[test]
    fn zero_length_block_emits_nothing() {
        let mut bytes = vec![9u8; 16];
        bytes.push(0);
        bytes.extend(vec![8u8; 16]);
        let mut demuxer = IcyDemuxer::new(Some(16));
        let mut out = Collected::default();

        feed(&mut demuxer, &bytes, 5, &mut out);

        assert_eq!(out.audio.len(), 32);
        assert!(out.titles.is_empty());
        assert_eq!(demuxer.metadata_bytes(), 1);
    }

    #[test]
    fn negative_counter_is_clamped_and_recovers() {
        let mut demuxer = IcyDemuxer::new(Some(16));
        demuxer.corrupt_counter(-5);

        let bytes = stream(16, 2, "StreamTitle='Recovered';");
        let mut out = Collected::default();
        feed(&mut demuxer, &bytes, bytes.len(), &mut out);

        assert_eq!(demuxer.resyncs(), 1);
        assert_eq!(out.audio.len(), 32);
        assert_eq!(out.titles, vec![Some("Recovered".to_owned()); 2]);
        assert_eq!(demuxer.bytes_until_meta(), 16);
    }
}
