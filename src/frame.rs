//! Frame headers of the supported containers: MPEG audio (layers I-III) and
//! AAC in ADTS framing.

use crate::audio::{CodecId, CompressedFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerType {
    MpegAudio,
    Adts,
}

impl ContainerType {
    /// Picks the framing from the response `Content-Type`; anything that is
    /// not AAC is treated as MPEG audio.
    pub fn from_content_type(content_type: Option<&str>) -> ContainerType {
        let mime = content_type
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_ascii_lowercase());

        match mime.as_deref() {
            Some("audio/aac") | Some("audio/aacp") | Some("audio/x-aac") | Some("audio/vnd.dlna.adts") => {
                ContainerType::Adts
            }
            _ => ContainerType::MpegAudio,
        }
    }

    /// Bytes needed before a header can be judged.
    pub fn header_len(self) -> usize {
        match self {
            ContainerType::MpegAudio => 4,
            ContainerType::Adts => 7,
        }
    }

    pub fn parse_header(self, bytes: &[u8]) -> Option<FrameHeader> {
        match self {
            ContainerType::MpegAudio => parse_mpeg_header(bytes),
            ContainerType::Adts => parse_adts_header(bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub codec: CodecId,
    pub sample_rate: u32,
    pub channels: u16,
    /// Whole frame, header included.
    pub frame_len: usize,
    /// Bytes at the start of the frame that are not codec payload.
    pub payload_offset: usize,
    pub samples: u32,
    /// ADTS only: MPEG-4 audio object type and sampling frequency index.
    aac: Option<(u8, u8, u8)>,
}

impl FrameHeader {
    /// Whether `next` plausibly belongs to the same stream.
    pub fn is_compatible(&self, next: &FrameHeader) -> bool {
        self.codec == next.codec && self.sample_rate == next.sample_rate
    }

    /// Whether `next` can follow this frame without a format change.
    pub fn continues(&self, next: &FrameHeader) -> bool {
        self.is_compatible(next) && self.channels == next.channels
    }

    pub fn to_format(&self) -> CompressedFormat {
        CompressedFormat {
            codec: self.codec,
            sample_rate: self.sample_rate,
            channels: self.channels,
            bits_per_sample: 0,
            magic_cookie: None,
        }
    }

    /// AudioSpecificConfig equivalent of an ADTS header.
    pub fn magic_cookie(&self) -> Option<Vec<u8>> {
        self.aac.map(|(object_type, freq_index, channel_config)| {
            vec![
                (object_type << 3) | (freq_index >> 1),
                ((freq_index & 1) << 7) | (channel_config << 3),
            ]
        })
    }
}

const MPEG1_LAYER1_KBPS: [u32; 15] = [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448];
const MPEG1_LAYER2_KBPS: [u32; 15] = [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384];
const MPEG1_LAYER3_KBPS: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const MPEG2_LAYER1_KBPS: [u32; 15] = [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256];
const MPEG2_LAYER23_KBPS: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

fn parse_mpeg_header(bytes: &[u8]) -> Option<FrameHeader> {
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] & 0xE0 != 0xE0 {
        return None;
    }

    // 0 = MPEG 2.5, 2 = MPEG 2, 3 = MPEG 1
    let version = (bytes[1] >> 3) & 0x03;
    let layer = match (bytes[1] >> 1) & 0x03 {
        3 => 1,
        2 => 2,
        1 => 3,
        _ => return None,
    };
    let bitrate_index = (bytes[2] >> 4) as usize;
    let rate_index = ((bytes[2] >> 2) & 0x03) as usize;
    let padding = ((bytes[2] >> 1) & 0x01) as usize;
    let mono = bytes[3] >> 6 == 0x03;

    // free-format and reserved values are not supported
    if version == 1 || bitrate_index == 0 || bitrate_index == 15 || rate_index == 3 || bytes[3] & 0x03 == 2 {
        return None;
    }

    let mpeg1 = version == 3;
    let table = match (mpeg1, layer) {
        (true, 1) => &MPEG1_LAYER1_KBPS,
        (true, 2) => &MPEG1_LAYER2_KBPS,
        (true, _) => &MPEG1_LAYER3_KBPS,
        (false, 1) => &MPEG2_LAYER1_KBPS,
        (false, _) => &MPEG2_LAYER23_KBPS,
    };
    let kbps = table[bitrate_index];

    let base_rate: u32 = [44_100, 48_000, 32_000][rate_index];
    let sample_rate = match version {
        3 => base_rate,
        2 => base_rate / 2,
        _ => base_rate / 4,
    };

    let samples: u32 = match layer {
        1 => 384,
        2 => 1152,
        _ if mpeg1 => 1152,
        _ => 576,
    };

    let bitrate = kbps as usize * 1000;
    let frame_len = if layer == 1 {
        (12 * bitrate / sample_rate as usize + padding) * 4
    } else {
        samples as usize / 8 * bitrate / sample_rate as usize + padding
    };

    let codec = match layer {
        1 => CodecId::Mp1,
        2 => CodecId::Mp2,
        _ => CodecId::Mp3,
    };

    Some(FrameHeader {
        codec: codec,
        sample_rate: sample_rate,
        channels: if mono { 1 } else { 2 },
        frame_len: frame_len,
        payload_offset: 0,
        samples: samples,
        aac: None,
    })
}

const ADTS_SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000, 7_350,
];

fn parse_adts_header(bytes: &[u8]) -> Option<FrameHeader> {
    if bytes.len() < 7 || bytes[0] != 0xFF || bytes[1] & 0xF6 != 0xF0 {
        return None;
    }

    let protection_absent = bytes[1] & 0x01 == 1;
    let profile = bytes[2] >> 6;
    let freq_index = (bytes[2] >> 2) & 0x0F;
    let channel_config = ((bytes[2] & 0x01) << 2) | (bytes[3] >> 6);
    let frame_len = (((bytes[3] & 0x03) as usize) << 11) | ((bytes[4] as usize) << 3) | ((bytes[5] >> 5) as usize);
    let raw_blocks = (bytes[6] & 0x03) as u32 + 1;
    let header_len = if protection_absent { 7 } else { 9 };

    // channel config 0 needs an in-band program config element
    if freq_index as usize >= ADTS_SAMPLE_RATES.len() || channel_config == 0 || frame_len <= header_len {
        return None;
    }

    Some(FrameHeader {
        codec: CodecId::Aac,
        sample_rate: ADTS_SAMPLE_RATES[freq_index as usize],
        channels: if channel_config == 7 { 8 } else { channel_config as u16 },
        frame_len: frame_len,
        payload_offset: header_len,
        samples: 1024 * raw_blocks,
        aac: Some((profile + 1, freq_index, channel_config)),
    })
}
