//! cpal-backed render graph: source → equalizer → mixer → device.
//!
//! The cpal stream lives on its own thread since it cannot move between
//! threads on every platform. Buffers travel to the realtime callback over
//! an `rtrb` ring and come back over a second one once played, so the
//! callback neither allocates nor frees. Completions run on the output
//! thread when a played buffer comes back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, Stream, StreamConfig};
use crossbeam_channel::{self, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rtrb::{Consumer, Producer, RingBuffer};

use crate::audio::PcmFormat;
use crate::eq::{EqProcessor, Equalizer};
use crate::graph::{Completion, RenderError, RenderGraph, RenderGraphFactory, ScheduledBuffer};

/// Buffers the realtime side can hold at once.
const RING_CAPACITY: usize = 64;

/// Source channels the mixer handles; anything beyond is ignored.
const MAX_CHANNELS: usize = 8;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

type Completions = Arc<Mutex<HashMap<u64, Completion>>>;

/// State shared by the control side and the realtime callback.
#[derive(Default)]
struct Flags {
    playing: AtomicBool,
    /// Bumped to make the callback hand back everything it holds.
    flush: AtomicU64,
}

/// Everything the realtime callback touches.
struct RenderState {
    incoming: Consumer<ScheduledBuffer>,
    played: Producer<ScheduledBuffer>,
    current: Option<ScheduledBuffer>,
    position: usize,
    eq: EqProcessor,
    flags: Arc<Flags>,
    seen_flush: u64,
    source_channels: usize,
    output_channels: usize,
}

impl RenderState {
    fn render(&mut self, data: &mut [f32]) {
        self.eq.refresh();

        let flush = self.flags.flush.load(Ordering::Acquire);
        if flush != self.seen_flush {
            self.seen_flush = flush;
            self.hand_back_all();
        }

        if !self.flags.playing.load(Ordering::Acquire) || self.output_channels == 0 {
            data.fill(0.0);
            return;
        }

        let mut source = [0.0f32; MAX_CHANNELS];
        let channels = self.source_channels.min(MAX_CHANNELS);

        for frame in data.chunks_mut(self.output_channels) {
            if !self.advance() {
                // underrun
                frame.fill(0.0);
                continue;
            }

            if let Some(ref buffer) = self.current {
                for (channel, sample) in source.iter_mut().take(channels).enumerate() {
                    let input = buffer.planes.get(channel).and_then(|plane| plane.get(self.position));
                    *sample = self.eq.process_sample(channel, input.copied().unwrap_or(0.0));
                }
            }
            self.position += 1;

            mix(&source[..channels], frame);
        }
    }

    /// Makes sure `current` has a frame left at `position`.
    fn advance(&mut self) -> bool {
        loop {
            match self.current {
                Some(ref buffer) if self.position < buffer.frames() => return true,
                Some(_) => self.retire(),
                None => match self.incoming.pop() {
                    Ok(buffer) => {
                        self.current = Some(buffer);
                        self.position = 0;
                    }
                    Err(_) => return false,
                },
            }
        }
    }

    fn retire(&mut self) {
        if let Some(buffer) = self.current.take() {
            // twice the incoming ring and drained every poll interval
            let _ = self.played.push(buffer);
        }
        self.position = 0;
    }

    fn hand_back_all(&mut self) {
        self.retire();
        while let Ok(buffer) = self.incoming.pop() {
            let _ = self.played.push(buffer);
        }
    }
}

/// Maps source channels onto the output frame.
fn mix(source: &[f32], frame: &mut [f32]) {
    match (source.len(), frame.len()) {
        (0, _) => frame.fill(0.0),
        (1, _) => frame.fill(source[0]),
        (_, 1) => frame[0] = (source[0] + source[1]) * 0.5,
        _ => {
            for (channel, out) in frame.iter_mut().enumerate() {
                *out = source.get(channel).copied().unwrap_or(0.0);
            }
        }
    }
}

enum OutputCmd {
    Connect {
        format: PcmFormat,
        reply: Sender<Result<Producer<ScheduledBuffer>, RenderError>>,
    },
    Start(Sender<Result<(), RenderError>>),
    /// Drops the stream.
    Reset,
    Shutdown,
}

struct OutputThread {
    commands: Receiver<OutputCmd>,
    device: cpal::Device,
    device_channels: u16,
    equalizer: Equalizer,
    flags: Arc<Flags>,
    completions: Completions,
    stream: Option<Stream>,
    played: Option<Consumer<ScheduledBuffer>>,
}

impl OutputThread {
    fn run(mut self) {
        loop {
            match self.commands.recv_timeout(POLL_INTERVAL) {
                Ok(OutputCmd::Shutdown) => break,
                Ok(cmd) => self.handle(cmd),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.drain_played();
        }

        self.stream = None;
        debug!("output thread exiting");
    }

    fn handle(&mut self, cmd: OutputCmd) {
        match cmd {
            OutputCmd::Connect { format, reply } => {
                let _ = reply.send(self.connect(format));
            }
            OutputCmd::Start(reply) => {
                let result = match self.stream {
                    Some(ref stream) => stream.play().map_err(|e| RenderError::Stream(e.to_string())),
                    None => Err(RenderError::NotConnected),
                };
                if result.is_ok() {
                    self.flags.playing.store(true, Ordering::Release);
                }
                let _ = reply.send(result);
            }
            OutputCmd::Reset => {
                self.flags.playing.store(false, Ordering::Release);
                self.stream = None;
                self.drain_played();
                self.played = None;
            }
            OutputCmd::Shutdown => {}
        }
    }

    fn connect(&mut self, format: PcmFormat) -> Result<Producer<ScheduledBuffer>, RenderError> {
        self.stream = None;
        self.drain_played();

        let (producer, incoming) = RingBuffer::new(RING_CAPACITY);
        let (played_tx, played_rx) = RingBuffer::new(RING_CAPACITY * 2);

        let mut state = RenderState {
            incoming: incoming,
            played: played_tx,
            current: None,
            position: 0,
            eq: self.equalizer.processor(format.sample_rate, format.channels as usize),
            flags: Arc::clone(&self.flags),
            seen_flush: self.flags.flush.load(Ordering::Acquire),
            source_channels: format.channels as usize,
            output_channels: self.device_channels as usize,
        };

        let config = StreamConfig {
            channels: self.device_channels,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: BufferSize::Default,
        };

        let stream = self
            .device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| state.render(data),
                |err| error!("output stream: {}", err),
                None,
            )
            .map_err(|e| RenderError::Build(e.to_string()))?;

        info!(
            "output connected: {} -> {} channels at {}hz",
            format, self.device_channels, format.sample_rate
        );
        self.stream = Some(stream);
        self.played = Some(played_rx);
        Ok(producer)
    }

    fn drain_played(&mut self) {
        let played = match self.played {
            Some(ref mut played) => played,
            None => return,
        };

        while let Ok(buffer) = played.pop() {
            let completion = self.completions.lock().remove(&buffer.id);
            if let Some(completion) = completion {
                completion();
            }
        }
    }
}

/// Render graph on the default cpal output device.
pub struct CpalGraph {
    commands: Sender<OutputCmd>,
    worker: Option<JoinHandle<()>>,
    producer: Option<Producer<ScheduledBuffer>>,
    completions: Completions,
    flags: Arc<Flags>,
    device_rate: u32,
}

impl CpalGraph {
    pub fn open(equalizer: Equalizer) -> Result<Self, RenderError> {
        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let flags = Arc::new(Flags::default());
        let completions: Completions = Arc::new(Mutex::new(HashMap::new()));

        let thread_flags = Arc::clone(&flags);
        let thread_completions = Arc::clone(&completions);

        let worker = thread::Builder::new()
            .name("icy-output".to_owned())
            .spawn(move || {
                let (device, device_rate, device_channels) = match default_device() {
                    Ok(found) => found,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(device_rate));

                OutputThread {
                    commands: commands_rx,
                    device: device,
                    device_channels: device_channels,
                    equalizer: equalizer,
                    flags: thread_flags,
                    completions: thread_completions,
                    stream: None,
                    played: None,
                }
                .run();
            })
            .map_err(|e| RenderError::Stream(e.to_string()))?;

        let device_rate = match ready_rx.recv() {
            Ok(result) => result?,
            Err(_) => return Err(RenderError::NoDevice),
        };

        Ok(CpalGraph {
            commands: commands_tx,
            worker: Some(worker),
            producer: None,
            completions: completions,
            flags: flags,
            device_rate: device_rate,
        })
    }

    fn request<T>(&self, cmd: impl FnOnce(Sender<Result<T, RenderError>>) -> OutputCmd) -> Result<T, RenderError> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.commands
            .send(cmd(reply_tx))
            .map_err(|_| RenderError::Stream("output thread is gone".to_owned()))?;
        reply_rx
            .recv()
            .map_err(|_| RenderError::Stream("output thread is gone".to_owned()))?
    }

    fn drop_queued(&mut self) {
        self.flags.playing.store(false, Ordering::Release);
        self.completions.lock().clear();
        self.flags.flush.fetch_add(1, Ordering::AcqRel);
    }
}

/// Default device plus its preferred rate and channel count.
fn default_device() -> Result<(cpal::Device, u32, u16), RenderError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(RenderError::NoDevice)?;
    let config = device
        .default_output_config()
        .map_err(|e| RenderError::Config(e.to_string()))?;

    info!(
        "output device {}: {} channels at {}hz",
        device.name().unwrap_or_else(|_| "unknown".to_owned()),
        config.channels(),
        config.sample_rate().0
    );

    Ok((device, config.sample_rate().0, config.channels()))
}

impl RenderGraph for CpalGraph {
    fn output_sample_rate(&self) -> Option<u32> {
        Some(self.device_rate)
    }

    fn connect(&mut self, format: PcmFormat) -> Result<(), RenderError> {
        self.drop_queued();
        self.producer = None;
        let producer = self.request(|reply| OutputCmd::Connect { format: format, reply: reply })?;
        self.producer = Some(producer);
        Ok(())
    }

    fn schedule(&mut self, buffer: ScheduledBuffer, completion: Completion) -> Result<(), RenderError> {
        let producer = self.producer.as_mut().ok_or(RenderError::NotConnected)?;
        let id = buffer.id;

        self.completions.lock().insert(id, completion);
        if producer.push(buffer).is_err() {
            self.completions.lock().remove(&id);
            return Err(RenderError::QueueFull);
        }
        Ok(())
    }

    fn has_room(&self) -> bool {
        self.producer.as_ref().map_or(true, |producer| producer.slots() > 0)
    }

    fn start(&mut self) -> Result<(), RenderError> {
        self.request(OutputCmd::Start)
    }

    fn pause(&mut self) -> Result<(), RenderError> {
        self.flags.playing.store(false, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) {
        self.drop_queued();
    }

    fn reset(&mut self) {
        self.drop_queued();
        self.producer = None;
        if self.commands.send(OutputCmd::Reset).is_err() {
            warn!("output thread is gone");
        }
    }
}

impl Drop for CpalGraph {
    fn drop(&mut self) {
        let _ = self.commands.send(OutputCmd::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Opens a [`CpalGraph`] per session, all sharing one equalizer.
pub struct CpalGraphFactory {
    equalizer: Equalizer,
}

impl CpalGraphFactory {
    pub fn new(equalizer: Equalizer) -> Self {
        CpalGraphFactory { equalizer: equalizer }
    }
}

impl RenderGraphFactory for CpalGraphFactory {
    fn create(&self) -> Result<Box<dyn RenderGraph>, RenderError> {
        Ok(Box::new(CpalGraph::open(self.equalizer.clone())?))
    }
}
