use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    Mp1,
    Mp2,
    Mp3,
    Aac,
}

impl CodecId {
    pub fn name(self) -> &'static str {
        match self {
            CodecId::Mp1 => "mp1",
            CodecId::Mp2 => "mp2",
            CodecId::Mp3 => "mp3",
            CodecId::Aac => "aac",
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compressed stream format, discovered once by the parser.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedFormat {
    pub codec: CodecId,
    pub sample_rate: u32,
    pub channels: u16,
    /// Bits per decoded sample; compressed codecs report 0.
    pub bits_per_sample: u16,
    pub magic_cookie: Option<Vec<u8>>,
}

impl CompressedFormat {
    /// Whether switching to `other` requires a new decoder.
    pub fn differs_from(&self, other: &CompressedFormat) -> bool {
        self.codec != other.codec
            || self.sample_rate != other.sample_rate
            || self.channels != other.channels
    }
}

impl fmt::Display for CompressedFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}hz {}ch", self.codec, self.sample_rate, self.channels)
    }
}

/// Explicit packet boundary inside a [`PacketBatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketDescription {
    pub start_offset: usize,
    pub byte_size: usize,
    pub frames: Option<u32>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet {index} spans {start}..{end} beyond {available} available bytes")]
    OutOfBounds {
        index: usize,
        start: usize,
        end: usize,
        available: usize,
    },
}

/// Bytes handed over by the parser in one callback, plus the packets they hold.
///
/// Without explicit descriptions the batch is split evenly into
/// `packet_count` packets, which is only an approximation for VBR streams.
#[derive(Debug, Clone)]
pub struct PacketBatch {
    pub data: Arc<[u8]>,
    pub packet_count: usize,
    pub descriptions: Option<Vec<PacketDescription>>,
}

impl PacketBatch {
    pub fn described(data: Vec<u8>, descriptions: Vec<PacketDescription>) -> Self {
        PacketBatch {
            data: data.into(),
            packet_count: descriptions.len(),
            descriptions: Some(descriptions),
        }
    }

    pub fn uniform(data: Vec<u8>, packet_count: usize) -> Self {
        PacketBatch {
            data: data.into(),
            packet_count: packet_count,
            descriptions: None,
        }
    }

    /// Splits the batch into packets. Each item fails on its own, so one bad
    /// description does not cost the rest of the batch.
    pub fn packets(&self) -> Vec<Result<CompressedPacket, PacketError>> {
        let available = self.data.len();

        match self.descriptions {
            Some(ref descriptions) => descriptions
                .iter()
                .enumerate()
                .map(|(index, desc)| {
                    let end = desc.start_offset.checked_add(desc.byte_size);
                    match end {
                        Some(end) if end <= available => Ok(CompressedPacket {
                            data: Arc::clone(&self.data),
                            range: desc.start_offset..end,
                            frames: desc.frames,
                        }),
                        _ => Err(PacketError::OutOfBounds {
                            index: index,
                            start: desc.start_offset,
                            end: end.unwrap_or(usize::MAX),
                            available: available,
                        }),
                    }
                })
                .collect(),
            None => {
                if self.packet_count == 0 {
                    return Vec::new();
                }
                let size = available / self.packet_count;
                (0..self.packet_count)
                    .map(|index| {
                        let start = index * size;
                        Ok(CompressedPacket {
                            data: Arc::clone(&self.data),
                            range: start..start + size,
                            frames: None,
                        })
                    })
                    .collect()
            }
        }
    }
}

/// One compressed packet: a byte range view into its batch.
#[derive(Clone)]
pub struct CompressedPacket {
    data: Arc<[u8]>,
    range: Range<usize>,
    frames: Option<u32>,
}

impl CompressedPacket {
    pub fn bytes(&self) -> &[u8] {
        &self.data[self.range.clone()]
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn frames(&self) -> Option<u32> {
        self.frames
    }
}

impl fmt::Debug for CompressedPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CompressedPacket")
            .field("range", &self.range)
            .field("frames", &self.frames)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}hz {}ch", self.sample_rate, self.channels)
    }
}

/// Non-interleaved f32 PCM with a fixed frame capacity.
#[derive(Debug, Clone)]
pub struct PcmChunk {
    pub format: PcmFormat,
    pub sequence: u64,
    planes: Vec<Vec<f32>>,
    capacity: usize,
}

impl PcmChunk {
    pub fn with_capacity(format: PcmFormat, capacity: usize) -> Self {
        let planes = (0..format.channels)
            .map(|_| Vec::with_capacity(capacity))
            .collect();

        PcmChunk {
            format: format,
            sequence: 0,
            planes: planes,
            capacity: capacity,
        }
    }

    pub fn from_planes(format: PcmFormat, planes: Vec<Vec<f32>>) -> Self {
        let frames = planes.first().map(Vec::len).unwrap_or(0);
        debug_assert_eq!(planes.len(), format.channels as usize);
        debug_assert!(planes.iter().all(|plane| plane.len() == frames));

        PcmChunk {
            format: format,
            sequence: 0,
            planes: planes,
            capacity: frames,
        }
    }

    pub fn frames(&self) -> usize {
        self.planes.first().map(Vec::len).unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.frames()
    }

    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    pub fn plane(&self, channel: usize) -> &[f32] {
        &self.planes[channel]
    }

    pub fn planes(&self) -> &[Vec<f32>] {
        &self.planes
    }

    /// Appends up to `remaining()` frames from `source`, one slice per
    /// channel, and returns the number of frames taken.
    pub fn append(&mut self, source: &[&[f32]]) -> usize {
        let available = source.iter().map(|plane| plane.len()).min().unwrap_or(0);
        let frames = available.min(self.remaining());

        for (plane, input) in self.planes.iter_mut().zip(source) {
            plane.extend_from_slice(&input[..frames]);
        }

        frames
    }

    /// Largest absolute sample found at `points` evenly spaced frames on
    /// every channel.
    pub fn sampled_peak(&self, points: usize) -> f32 {
        let frames = self.frames();
        if frames == 0 || points == 0 {
            return 0.0;
        }

        let stride = (frames / points).max(1);
        self.planes
            .iter()
            .flat_map(|plane| plane.iter().step_by(stride))
            .fold(0.0f32, |peak, sample| peak.max(sample.abs()))
    }
}
