//! Compressed packets in, fixed-capacity PCM chunks out.
//!
//! The [`Decoder`] owns a packet queue and a format-specific [`Converter`].
//! Conversion is pull driven: the converter asks the queue for one packet at
//! a time and gets [`InputPull::NoDataYet`] as soon as the queue is empty, so
//! decoding never waits on the network.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{select, Receiver};
use log::{debug, error, info, warn};
use symphonia::core::audio::{AudioBufferRef, Channels, SampleBuffer};
use symphonia::core::codecs::{
    self, CodecParameters, CodecType, DecoderOptions, CODEC_TYPE_AAC, CODEC_TYPE_MP1, CODEC_TYPE_MP2, CODEC_TYPE_MP3,
};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;
use thiserror::Error;

use crate::audio::{CodecId, CompressedFormat, CompressedPacket, PacketBatch, PcmChunk, PcmFormat};
use crate::config::DecoderConfig;
use crate::fetch::StreamInfo;
use crate::player::PlayerError;
use crate::resample::Resampler;
use crate::scheduler::SchedulerSender;

/// Frames inspected per chunk when looking for priming silence.
const PRIMING_PROBE_POINTS: usize = 32;

pub enum InputPull {
    Packet(CompressedPacket),
    NoDataYet,
}

/// Supplies compressed packets to a [`Converter`], one per call.
pub trait PacketSource {
    fn next_packet(&mut self) -> InputPull;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStatus {
    Full,
    NeedInput,
}

#[derive(Debug, Error)]
pub enum ConverterError {
    /// The packet just pulled could not be decoded; it has been consumed.
    #[error("undecodable packet: {0}")]
    Packet(String),
    #[error("converter failed: {0}")]
    Fatal(String),
}

pub trait Converter: Send {
    fn output_format(&self) -> PcmFormat;

    /// Applies codec configuration to the live converter.
    fn set_magic_cookie(&mut self, cookie: &[u8]) -> Result<(), ConverterError>;

    /// Pulls packets from `input` until `output` is full or `input` runs dry.
    fn fill(&mut self, input: &mut dyn PacketSource, output: &mut PcmChunk) -> Result<FillStatus, ConverterError>;
}

pub trait ConverterFactory: Send + Sync {
    fn create(&self, format: &CompressedFormat, output_rate: u32) -> Result<Box<dyn Converter>, DecodeError>;
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no decoder for {0}")]
    UnsupportedCodec(CodecId),
    #[error("creating decoder for {format}: {reason}")]
    Construction { format: String, reason: String },
    #[error("decoder failed: {0}")]
    Unrecoverable(String),
}

#[derive(Debug, Clone)]
pub struct DecoderSettings {
    pub max_frames_per_chunk: usize,
    pub priming_threshold: f32,
    pub max_priming_chunks: usize,
    pub output_sample_rate: Option<u32>,
}

impl DecoderSettings {
    pub fn from_config(config: &DecoderConfig, preferred_rate: Option<u32>) -> Self {
        DecoderSettings {
            max_frames_per_chunk: config.max_frames_per_chunk.max(1),
            priming_threshold: config.priming_threshold,
            max_priming_chunks: config.max_priming_chunks,
            output_sample_rate: config.output_sample_rate.or(preferred_rate),
        }
    }
}

#[derive(Default)]
struct PacketQueue {
    packets: VecDeque<CompressedPacket>,
}

impl PacketSource for PacketQueue {
    fn next_packet(&mut self) -> InputPull {
        match self.packets.pop_front() {
            Some(packet) => InputPull::Packet(packet),
            None => InputPull::NoDataYet,
        }
    }
}

pub struct Decoder {
    format: CompressedFormat,
    converter: Box<dyn Converter>,
    queue: PacketQueue,
    settings: DecoderSettings,
    current: Option<PcmChunk>,
    primed: bool,
    priming_discarded: usize,
    next_sequence: u64,
    dropped_packets: u64,
}

impl Decoder {
    pub fn new(
        format: CompressedFormat,
        factory: &dyn ConverterFactory,
        settings: DecoderSettings,
    ) -> Result<Self, DecodeError> {
        let output_rate = settings.output_sample_rate.unwrap_or(format.sample_rate);
        let mut converter = factory.create(&format, output_rate)?;

        if let Some(ref cookie) = format.magic_cookie {
            converter
                .set_magic_cookie(cookie)
                .map_err(|e| DecodeError::Construction {
                    format: format.to_string(),
                    reason: e.to_string(),
                })?;
        }

        info!("decoder ready: {} -> {}", format, converter.output_format());

        Ok(Decoder {
            format: format,
            converter: converter,
            queue: PacketQueue::default(),
            settings: settings,
            current: None,
            primed: false,
            priming_discarded: 0,
            next_sequence: 0,
            dropped_packets: 0,
        })
    }

    pub fn format(&self) -> &CompressedFormat {
        &self.format
    }

    pub fn output_format(&self) -> PcmFormat {
        self.converter.output_format()
    }

    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets
    }

    pub fn queued_packets(&self) -> usize {
        self.queue.packets.len()
    }

    /// Late configuration is applied in place; a converter that rejects it
    /// keeps decoding with what it had.
    pub fn set_magic_cookie(&mut self, cookie: Vec<u8>) {
        match self.converter.set_magic_cookie(&cookie) {
            Ok(()) => debug!("applied {} byte magic cookie", cookie.len()),
            Err(e) => warn!("ignoring magic cookie: {}", e),
        }
        self.format.magic_cookie = Some(cookie);
    }

    /// Queues the packets of `batch`, dropping any whose byte range lies
    /// outside the batch.
    pub fn push(&mut self, batch: &PacketBatch) {
        for packet in batch.packets() {
            match packet {
                Ok(packet) => self.queue.packets.push_back(packet),
                Err(e) => {
                    warn!("dropping packet: {}", e);
                    self.dropped_packets += 1;
                }
            }
        }
    }

    /// Decodes every queued packet. A partially filled chunk is handed out
    /// once the queue is empty rather than held back for more input.
    pub fn decode_available(&mut self) -> Result<Vec<PcmChunk>, DecodeError> {
        let mut ready = Vec::new();
        let output_format = self.converter.output_format();
        let capacity = self.settings.max_frames_per_chunk;

        loop {
            let chunk = self
                .current
                .get_or_insert_with(|| PcmChunk::with_capacity(output_format, capacity));

            match self.converter.fill(&mut self.queue, chunk) {
                Ok(FillStatus::Full) => {
                    if let Some(chunk) = self.current.take() {
                        self.release(chunk, &mut ready);
                    }
                }
                Ok(FillStatus::NeedInput) => {
                    if !chunk.is_empty() {
                        if let Some(chunk) = self.current.take() {
                            self.release(chunk, &mut ready);
                        }
                    }
                    return Ok(ready);
                }
                Err(ConverterError::Packet(reason)) => {
                    warn!("dropping packet: {}", reason);
                    self.dropped_packets += 1;
                }
                Err(ConverterError::Fatal(reason)) => {
                    return Err(DecodeError::Unrecoverable(reason));
                }
            }
        }
    }

    fn release(&mut self, mut chunk: PcmChunk, ready: &mut Vec<PcmChunk>) {
        if !self.primed {
            let peak = chunk.sampled_peak(PRIMING_PROBE_POINTS);
            if peak < self.settings.priming_threshold && self.priming_discarded < self.settings.max_priming_chunks {
                self.priming_discarded += 1;
                debug!("discarding priming chunk of {} frames (peak {})", chunk.frames(), peak);
                return;
            }
            self.primed = true;
        }

        chunk.sequence = self.next_sequence;
        self.next_sequence += 1;
        ready.push(chunk);
    }
}

/// Converter backed by symphonia's codec implementations.
pub struct SymphoniaConverter {
    params: CodecParameters,
    decoder: Box<dyn codecs::Decoder>,
    resampler: Option<Resampler>,
    output: PcmFormat,
    staged: Vec<Vec<f32>>,
    samples: Option<SampleBuffer<f32>>,
    timestamp: u64,
}

impl SymphoniaConverter {
    pub fn new(format: &CompressedFormat, output_rate: u32) -> Result<Self, DecodeError> {
        let construction = |reason: String| DecodeError::Construction {
            format: format.to_string(),
            reason: reason,
        };

        let mut params = CodecParameters::new();
        params
            .for_codec(codec_type(format.codec))
            .with_sample_rate(format.sample_rate)
            .with_channels(channel_mask(format.channels));
        if let Some(ref cookie) = format.magic_cookie {
            params.with_extra_data(cookie.clone().into_boxed_slice());
        }

        let decoder = make_decoder(&params).map_err(|e| match e {
            SymphoniaError::Unsupported(_) => DecodeError::UnsupportedCodec(format.codec),
            other => construction(other.to_string()),
        })?;

        let resampler = if output_rate != format.sample_rate {
            let resampler = Resampler::new(format.sample_rate, output_rate, format.channels as usize)
                .map_err(|e| construction(e.to_string()))?;
            Some(resampler)
        } else {
            None
        };

        Ok(SymphoniaConverter {
            params: params,
            decoder: decoder,
            resampler: resampler,
            output: PcmFormat {
                sample_rate: output_rate,
                channels: format.channels,
            },
            staged: vec![Vec::new(); format.channels as usize],
            samples: None,
            timestamp: 0,
        })
    }

    fn drain_staged(&mut self, output: &mut PcmChunk) {
        let planes: Vec<&[f32]> = self.staged.iter().map(Vec::as_slice).collect();
        let taken = output.append(&planes);
        for plane in self.staged.iter_mut() {
            plane.drain(..taken);
        }
    }

    fn decode(&mut self, packet: &CompressedPacket) -> Result<(), ConverterError> {
        let duration = packet.frames().unwrap_or(0) as u64;
        let input = Packet::new_from_slice(0, self.timestamp, duration, packet.bytes());
        self.timestamp += duration;

        let decoded = match self.decoder.decode(&input) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(reason)) => return Err(ConverterError::Packet(reason.to_owned())),
            Err(SymphoniaError::IoError(e)) => return Err(ConverterError::Packet(e.to_string())),
            Err(SymphoniaError::ResetRequired) => {
                self.decoder = make_decoder(&self.params).map_err(|e| ConverterError::Fatal(e.to_string()))?;
                return Err(ConverterError::Packet("decoder reset".to_owned()));
            }
            Err(e) => return Err(ConverterError::Fatal(e.to_string())),
        };

        let frames = decoded.frames();
        if frames == 0 {
            return Ok(());
        }
        let channels = decoded.spec().channels.count();

        let samples = copy_planar(&mut self.samples, decoded);
        let planes: Vec<&[f32]> = (0..self.output.channels as usize)
            .map(|channel| {
                // fewer decoded channels than announced: repeat the last one
                let source = channel.min(channels - 1);
                &samples[source * frames..(source + 1) * frames]
            })
            .collect();

        match self.resampler {
            Some(ref mut resampler) => {
                resampler
                    .process(&planes, &mut self.staged)
                    .map_err(|e| ConverterError::Fatal(e.to_string()))?;
            }
            None => {
                for (staged, plane) in self.staged.iter_mut().zip(&planes) {
                    staged.extend_from_slice(plane);
                }
            }
        }

        Ok(())
    }
}

impl Converter for SymphoniaConverter {
    fn output_format(&self) -> PcmFormat {
        self.output
    }

    fn set_magic_cookie(&mut self, cookie: &[u8]) -> Result<(), ConverterError> {
        self.params.with_extra_data(cookie.to_vec().into_boxed_slice());
        self.decoder = make_decoder(&self.params).map_err(|e| ConverterError::Fatal(e.to_string()))?;
        Ok(())
    }

    fn fill(&mut self, input: &mut dyn PacketSource, output: &mut PcmChunk) -> Result<FillStatus, ConverterError> {
        loop {
            self.drain_staged(output);
            if output.is_full() {
                return Ok(FillStatus::Full);
            }

            match input.next_packet() {
                InputPull::NoDataYet => return Ok(FillStatus::NeedInput),
                InputPull::Packet(packet) => self.decode(&packet)?,
            }
        }
    }
}

pub struct SymphoniaFactory;

impl ConverterFactory for SymphoniaFactory {
    fn create(&self, format: &CompressedFormat, output_rate: u32) -> Result<Box<dyn Converter>, DecodeError> {
        Ok(Box::new(SymphoniaConverter::new(format, output_rate)?))
    }
}

fn codec_type(codec: CodecId) -> CodecType {
    match codec {
        CodecId::Mp1 => CODEC_TYPE_MP1,
        CodecId::Mp2 => CODEC_TYPE_MP2,
        CodecId::Mp3 => CODEC_TYPE_MP3,
        CodecId::Aac => CODEC_TYPE_AAC,
    }
}

fn channel_mask(channels: u16) -> Channels {
    let bits = if channels >= 32 { u32::MAX } else { (1u32 << channels) - 1 };
    Channels::from_bits_truncate(bits)
}

fn make_decoder(params: &CodecParameters) -> Result<Box<dyn codecs::Decoder>, SymphoniaError> {
    symphonia::default::get_codecs().make(params, &DecoderOptions::default())
}

/// Copies `decoded` into the reusable sample buffer, planar, and returns the
/// written samples.
fn copy_planar<'a>(slot: &'a mut Option<SampleBuffer<f32>>, decoded: AudioBufferRef) -> &'a [f32] {
    let spec = *decoded.spec();
    let needed = decoded.capacity() * spec.channels.count();

    let too_small = slot.as_ref().map_or(true, |buffer| buffer.capacity() < needed);
    if too_small {
        *slot = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
    }

    match slot {
        Some(buffer) => {
            buffer.copy_planar_ref(decoded);
            buffer.samples()
        }
        None => &[],
    }
}

/// Runs the decode stage: parser output in, PCM chunks out to the scheduler.
pub fn spawn_worker(
    input: Receiver<DecodeMsg>,
    cancel: Receiver<()>,
    settings: DecoderSettings,
    factory: Arc<dyn ConverterFactory>,
    output: SchedulerSender,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("icy-decode".to_owned())
        .spawn(move || {
            let mut worker = DecodeWorker {
                decoder: None,
                cookie: None,
                settings: settings,
                factory: factory,
                output: output,
            };

            loop {
                let msg = select! {
                    recv(input) -> msg => match msg {
                        Ok(msg) => msg,
                        Err(_) => break,
                    },
                    recv(cancel) -> _ => break,
                };

                if !worker.handle(msg) {
                    break;
                }
            }

            debug!("decode worker exiting");
        })
}

pub enum DecodeMsg {
    StreamInfo(StreamInfo),
    Format(CompressedFormat),
    MagicCookie(Vec<u8>),
    Packets(PacketBatch),
    Metadata(String),
    End(Option<PlayerError>),
}

struct DecodeWorker {
    decoder: Option<Decoder>,
    /// Cookie that arrived before any decoder existed to take it.
    cookie: Option<Vec<u8>>,
    settings: DecoderSettings,
    factory: Arc<dyn ConverterFactory>,
    output: SchedulerSender,
}

impl DecodeWorker {
    /// Returns false once the stage is finished.
    fn handle(&mut self, msg: DecodeMsg) -> bool {
        match msg {
            DecodeMsg::StreamInfo(info) => self.output.stream_info(info),
            DecodeMsg::Format(mut format) => {
                if format.magic_cookie.is_none() {
                    format.magic_cookie = self.cookie.take();
                }
                self.decoder = None;
                match Decoder::new(format, &*self.factory, self.settings.clone()) {
                    Ok(decoder) => self.decoder = Some(decoder),
                    Err(e) => {
                        error!("{}", e);
                        self.output.end(Some(PlayerError::Decode(e)));
                        return false;
                    }
                }
            }
            DecodeMsg::MagicCookie(cookie) => match self.decoder {
                Some(ref mut decoder) => decoder.set_magic_cookie(cookie),
                None => self.cookie = Some(cookie),
            },
            DecodeMsg::Packets(batch) => {
                let decoder = match self.decoder {
                    Some(ref mut decoder) => decoder,
                    None => {
                        debug!("dropping {} packets that arrived before the format", batch.packet_count);
                        return true;
                    }
                };

                decoder.push(&batch);
                match decoder.decode_available() {
                    Ok(chunks) => {
                        for chunk in chunks {
                            self.output.chunk(chunk);
                        }
                    }
                    Err(e) => {
                        error!("{}", e);
                        self.output.end(Some(PlayerError::Decode(e)));
                        return false;
                    }
                }
            }
            DecodeMsg::Metadata(title) => self.output.metadata(title),
            DecodeMsg::End(error) => {
                self.output.end(error);
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::PacketDescription;
    use crate::frame::tests::mp3_frame;
    use crate::frame::ContainerType;
    use crate::parser::{ParserEvent, StreamParser};
    use crate::scheduler::{self, SchedulerMsg};
    use parking_lot::Mutex;

    const CORRUPT: u8 = 0xEE;
    const FATAL: u8 = 0xFF;

    /// Emits `frames` samples per packet at the level given by the packet's
    /// first byte, in hundredths.
    struct LevelConverter {
        format: PcmFormat,
        staged: Vec<f32>,
        cookies: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Converter for LevelConverter {
        fn output_format(&self) -> PcmFormat {
            self.format
        }

        fn set_magic_cookie(&mut self, cookie: &[u8]) -> Result<(), ConverterError> {
            self.cookies.lock().push(cookie.to_vec());
            Ok(())
        }

        fn fill(&mut self, input: &mut dyn PacketSource, output: &mut PcmChunk) -> Result<FillStatus, ConverterError> {
            loop {
                let planes: Vec<&[f32]> = (0..self.format.channels).map(|_| self.staged.as_slice()).collect();
                let taken = output.append(&planes);
                self.staged.drain(..taken);
                if output.is_full() {
                    return Ok(FillStatus::Full);
                }

                let packet = match input.next_packet() {
                    InputPull::Packet(packet) => packet,
                    InputPull::NoDataYet => return Ok(FillStatus::NeedInput),
                };
                match packet.bytes()[0] {
                    CORRUPT => return Err(ConverterError::Packet("corrupt".to_owned())),
                    FATAL => return Err(ConverterError::Fatal("boom".to_owned())),
                    level => {
                        let frames = packet.frames().unwrap_or(1152) as usize;
                        self.staged.extend(std::iter::repeat(level as f32 / 100.0).take(frames));
                    }
                }
            }
        }
    }

    struct LevelFactory {
        cookies: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl ConverterFactory for LevelFactory {
        fn create(&self, format: &CompressedFormat, output_rate: u32) -> Result<Box<dyn Converter>, DecodeError> {
            Ok(Box::new(LevelConverter {
                format: PcmFormat { sample_rate: output_rate, channels: format.channels },
                staged: Vec::new(),
                cookies: Arc::clone(&self.cookies),
            }))
        }
    }

    fn format(codec: CodecId) -> CompressedFormat {
        CompressedFormat {
            codec: codec,
            sample_rate: 44_100,
            channels: 2,
            bits_per_sample: 0,
            magic_cookie: None,
        }
    }

    fn settings(max_frames: usize) -> DecoderSettings {
        DecoderSettings {
            max_frames_per_chunk: max_frames,
            priming_threshold: 1.0e-4,
            max_priming_chunks: 4,
            output_sample_rate: None,
        }
    }

    fn batch(levels: &[u8]) -> PacketBatch {
        let data: Vec<u8> = levels.iter().flat_map(|&level| vec![level, 0, 0, 0]).collect();
        let descriptions = (0..levels.len())
            .map(|index| PacketDescription { start_offset: index * 4, byte_size: 4, frames: Some(1152) })
            .collect();
        PacketBatch::described(data, descriptions)
    }

    fn decoder(max_frames: usize) -> (Decoder, Arc<Mutex<Vec<Vec<u8>>>>) {
        let cookies = Arc::new(Mutex::new(Vec::new()));
        let factory = LevelFactory { cookies: Arc::clone(&cookies) };
        let decoder = Decoder::new(format(CodecId::Mp3), &factory, settings(max_frames)).unwrap();
        (decoder, cookies)
    }

    #[test]
    fn chunks_are_capped_and_sequenced() {
        let (mut decoder, _) = decoder(4096);

        decoder.push(&batch(&[50; 8]));
        let chunks = decoder.decode_available().unwrap();

        let frames: Vec<usize> = chunks.iter().map(PcmChunk::frames).collect();
        assert_eq!(frames, vec![4096, 4096, 1024]);
        assert!(chunks.iter().all(|chunk| chunk.capacity() == 4096));
        let sequences: Vec<u64> = chunks.iter().map(|chunk| chunk.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(decoder.queued_packets(), 0);
    }

    #[test]
    fn empty_queue_yields_nothing() {
        let (mut decoder, _) = decoder(4096);
        assert!(decoder.decode_available().unwrap().is_empty());
    }

    #[test]
    fn leading_silence_is_discarded_as_priming() {
        let (mut decoder, _) = decoder(1152);

        decoder.push(&batch(&[0, 0, 40, 0]));
        let chunks = decoder.decode_available().unwrap();

        // silence after the first audible chunk is real audio
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].plane(0)[0], 0.4);
        assert_eq!(chunks[0].sequence, 0);
        assert_eq!(chunks[1].plane(1)[0], 0.0);
    }

    #[test]
    fn priming_discard_is_bounded() {
        let (mut decoder, _) = decoder(1152);

        decoder.push(&batch(&[0; 6]));
        let chunks = decoder.decode_available().unwrap();

        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn out_of_bounds_packet_is_dropped() {
        let (mut decoder, _) = decoder(1152);
        let bad = PacketBatch::described(
            vec![30, 0, 0, 0, 30, 0, 0, 0],
            vec![
                PacketDescription { start_offset: 0, byte_size: 4, frames: Some(1152) },
                PacketDescription { start_offset: 6, byte_size: 4, frames: Some(1152) },
                PacketDescription { start_offset: 4, byte_size: 4, frames: Some(1152) },
            ],
        );

        decoder.push(&bad);
        let chunks = decoder.decode_available().unwrap();

        assert_eq!(decoder.dropped_packets(), 1);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn corrupt_packet_is_skipped() {
        let (mut decoder, _) = decoder(1152);

        decoder.push(&batch(&[20, CORRUPT, 20]));
        let chunks = decoder.decode_available().unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(decoder.dropped_packets(), 1);
    }

    #[test]
    fn fatal_converter_error_is_unrecoverable() {
        let (mut decoder, _) = decoder(1152);

        decoder.push(&batch(&[20, FATAL, 20]));

        assert!(matches!(decoder.decode_available(), Err(DecodeError::Unrecoverable(_))));
    }

    #[test]
    fn late_magic_cookie_reaches_live_converter() {
        let (mut decoder, cookies) = decoder(1152);
        decoder.push(&batch(&[20]));
        assert_eq!(decoder.decode_available().unwrap().len(), 1);

        decoder.set_magic_cookie(vec![0x12, 0x10]);
        decoder.push(&batch(&[20]));

        assert_eq!(decoder.decode_available().unwrap().len(), 1);
        assert_eq!(*cookies.lock(), vec![vec![0x12, 0x10]]);
        assert_eq!(decoder.format().magic_cookie.as_deref(), Some(&[0x12, 0x10][..]));
    }

    #[test]
    fn cookie_known_at_creation_is_applied_first() {
        let cookies = Arc::new(Mutex::new(Vec::new()));
        let factory = LevelFactory { cookies: Arc::clone(&cookies) };
        let mut aac = format(CodecId::Aac);
        aac.magic_cookie = Some(vec![0x11, 0x90]);

        Decoder::new(aac, &factory, settings(1024)).unwrap();

        assert_eq!(*cookies.lock(), vec![vec![0x11, 0x90]]);
    }

    #[test]
    fn output_rate_follows_settings() {
        let cookies = Arc::new(Mutex::new(Vec::new()));
        let factory = LevelFactory { cookies: cookies };
        let mut resampled = settings(1024);
        resampled.output_sample_rate = Some(48_000);

        let decoder = Decoder::new(format(CodecId::Mp3), &factory, resampled).unwrap();

        assert_eq!(decoder.output_format(), PcmFormat { sample_rate: 48_000, channels: 2 });
    }

    #[test]
    fn symphonia_builds_mp3_and_aac_converters() {
        let mp3 = SymphoniaConverter::new(&format(CodecId::Mp3), 44_100).unwrap();
        assert_eq!(mp3.output_format(), PcmFormat { sample_rate: 44_100, channels: 2 });

        let mut aac = SymphoniaConverter::new(&format(CodecId::Aac), 48_000).unwrap();
        assert_eq!(aac.output_format().sample_rate, 48_000);
        aac.set_magic_cookie(&[0x12, 0x10]).unwrap();
    }

    #[test]
    fn symphonia_converter_waits_for_input() {
        let mut converter = SymphoniaConverter::new(&format(CodecId::Mp3), 44_100).unwrap();
        let mut queue = PacketQueue::default();
        let mut chunk = PcmChunk::with_capacity(converter.output_format(), 4096);

        let status = converter.fill(&mut queue, &mut chunk).unwrap();

        assert_eq!(status, FillStatus::NeedInput);
        assert!(chunk.is_empty());
    }

    #[test]
    fn symphonia_decodes_parsed_mp3_frames_at_the_output_rate() {
        let stream: Vec<u8> = (0..10).flat_map(|_| mp3_frame(false, false)).collect();
        let mut parser = StreamParser::new(ContainerType::MpegAudio);
        let mut batches = Vec::new();
        parser.parse(&stream, |event| {
            if let ParserEvent::Packets(batch) = event {
                batches.push(batch);
            }
        });

        let mut resampled = settings(4096);
        resampled.output_sample_rate = Some(48_000);
        // the frames decode to silence, which must not be taken for priming
        resampled.max_priming_chunks = 0;
        let format = parser.format().unwrap().clone();
        let mut decoder = Decoder::new(format, &SymphoniaFactory, resampled).unwrap();

        let mut chunks = Vec::new();
        for batch in &batches {
            decoder.push(batch);
            chunks.extend(decoder.decode_available().unwrap());
        }

        assert!(!chunks.is_empty());
        assert!(chunks
            .iter()
            .all(|chunk| chunk.format == PcmFormat { sample_rate: 48_000, channels: 2 }));
        let frames: usize = chunks.iter().map(PcmChunk::frames).sum();
        assert!((11_000..=12_540).contains(&frames), "decoded {} frames", frames);
        assert_eq!(decoder.dropped_packets(), 0);
    }

    #[test]
    fn cookie_ahead_of_the_format_is_kept_for_the_decoder() {
        let cookies = Arc::new(Mutex::new(Vec::new()));
        let (sender, queue) = scheduler::channel();
        let mut worker = DecodeWorker {
            decoder: None,
            cookie: None,
            settings: settings(1152),
            factory: Arc::new(LevelFactory { cookies: Arc::clone(&cookies) }),
            output: sender,
        };

        assert!(worker.handle(DecodeMsg::MagicCookie(vec![0x11, 0x90])));
        assert!(cookies.lock().is_empty());

        assert!(worker.handle(DecodeMsg::Format(format(CodecId::Aac))));
        assert_eq!(*cookies.lock(), vec![vec![0x11, 0x90]]);
        let decoder = worker.decoder.as_ref().unwrap();
        assert_eq!(decoder.format().magic_cookie.as_deref(), Some(&[0x11, 0x90][..]));
        assert!(worker.cookie.is_none());

        assert!(worker.handle(DecodeMsg::Packets(batch(&[20]))));
        assert!(matches!(queue.try_recv(), Some(SchedulerMsg::Chunk(_))));
    }
}
