//! Accumulates decoded PCM into render-sized buffers and feeds the render
//! graph.
//!
//! The [`Scheduler`] itself is plain single-threaded state. [`spawn_worker`]
//! gives it its own thread and a [`SchedulerQueue`]; everything that touches
//! the accumulation buffer or the in-flight counters, completion
//! notifications included, arrives through that queue.
//!
//! Stream data travels on a bounded lane and control on an unbounded one.
//! While the render graph is full, finished buffers wait in a backlog and the
//! worker stops taking stream data. Producers then block on the full lane
//! until completions make room again.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{self, select, Receiver, Sender, TryRecvError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_derive::Serialize;

use crate::audio::{PcmChunk, PcmFormat};
use crate::config::SchedulerConfig;
use crate::fetch::StreamInfo;
use crate::graph::{RenderError, RenderGraph, ScheduledBuffer};
use crate::player::PlayerError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Buffers handed to the graph and not yet played.
    pub in_flight: usize,
    pub scheduled: u64,
    pub consumed: u64,
}

/// What the scheduler reports upward, in the order it processed things.
#[derive(Debug)]
pub enum SchedulerEvent {
    StreamInfo(StreamInfo),
    /// The first chunk of the session was accepted.
    FirstAudio,
    PcmReady { format: PcmFormat, frames: usize, sequence: u64 },
    Metadata(String),
    BufferLow { queued: usize },
    Ended(Option<PlayerError>),
}

pub type Notify = Box<dyn Fn(SchedulerEvent) + Send>;

/// Stream messages a producer can get ahead of the worker by before it
/// blocks.
const DATA_QUEUE: usize = 16;

pub enum SchedulerMsg {
    StreamInfo(StreamInfo),
    Chunk(PcmChunk),
    Metadata(String),
    End(Option<PlayerError>),
    Played { generation: u64 },
    Pause(Sender<()>),
    /// Stops the graph, clears all state and ends the worker.
    Stop(Sender<()>),
}

/// Producer handle for the scheduler's queue. Sends to a finished worker
/// are dropped.
///
/// Stream data may block while the render graph is full. Completions,
/// pause and stop never do.
#[derive(Clone)]
pub struct SchedulerSender {
    data: Sender<SchedulerMsg>,
    control: Sender<SchedulerMsg>,
}

impl SchedulerSender {
    pub fn stream_info(&self, info: StreamInfo) {
        Self::send(&self.data, SchedulerMsg::StreamInfo(info));
    }

    pub fn chunk(&self, chunk: PcmChunk) {
        Self::send(&self.data, SchedulerMsg::Chunk(chunk));
    }

    pub fn metadata(&self, title: String) {
        Self::send(&self.data, SchedulerMsg::Metadata(title));
    }

    pub fn end(&self, error: Option<PlayerError>) {
        Self::send(&self.data, SchedulerMsg::End(error));
    }

    pub fn played(&self, generation: u64) {
        Self::send(&self.control, SchedulerMsg::Played { generation: generation });
    }

    /// Returns once the graph is paused.
    pub fn pause(&self) {
        self.round_trip(SchedulerMsg::Pause);
    }

    /// Returns once the graph is stopped and the worker has let go of it.
    pub fn stop(&self) {
        self.round_trip(SchedulerMsg::Stop);
    }

    fn round_trip(&self, msg: fn(Sender<()>) -> SchedulerMsg) {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if self.control.send(msg(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    fn send(lane: &Sender<SchedulerMsg>, msg: SchedulerMsg) {
        if lane.send(msg).is_err() {
            debug!("scheduler is gone, dropping message");
        }
    }
}

/// Consumer side of [`channel`].
pub struct SchedulerQueue {
    data: Receiver<SchedulerMsg>,
    control: Receiver<SchedulerMsg>,
}

impl SchedulerQueue {
    /// Next message without blocking, control first.
    pub fn try_recv(&self) -> Option<SchedulerMsg> {
        self.control.try_recv().or_else(|_| self.data.try_recv()).ok()
    }

    /// Blocks for the next message. With `data` false only control is
    /// taken. `None` once every sender is gone.
    fn recv(&self, data: bool) -> Option<SchedulerMsg> {
        match self.control.try_recv() {
            Ok(msg) => return Some(msg),
            Err(TryRecvError::Disconnected) => return None,
            Err(TryRecvError::Empty) => {}
        }

        if !data {
            return self.control.recv().ok();
        }

        select! {
            recv(self.control) -> msg => msg.ok(),
            recv(self.data) -> msg => match msg {
                Ok(msg) => Some(msg),
                // producers are done; completions may still be due
                Err(_) => self.control.recv().ok(),
            },
        }
    }
}

pub fn channel() -> (SchedulerSender, SchedulerQueue) {
    let (data_tx, data_rx) = crossbeam_channel::bounded(DATA_QUEUE);
    let (control_tx, control_rx) = crossbeam_channel::unbounded();
    let sender = SchedulerSender { data: data_tx, control: control_tx };
    (sender, SchedulerQueue { data: data_rx, control: control_rx })
}

struct Accumulation {
    format: PcmFormat,
    planes: Vec<Vec<f32>>,
    threshold: usize,
}

impl Accumulation {
    fn new(format: PcmFormat, threshold: usize) -> Self {
        Accumulation {
            format: format,
            planes: (0..format.channels).map(|_| Vec::with_capacity(threshold)).collect(),
            threshold: threshold,
        }
    }

    fn frames(&self) -> usize {
        self.planes.first().map(Vec::len).unwrap_or(0)
    }

    fn space_left(&self) -> usize {
        self.threshold.saturating_sub(self.frames())
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    graph: Box<dyn RenderGraph>,
    sender: SchedulerSender,
    notify: Notify,
    shared_stats: Arc<Mutex<SchedulerStats>>,
    format: Option<PcmFormat>,
    accumulation: Option<Accumulation>,
    /// Flushed buffers the graph had no room for yet, oldest first.
    backlog: VecDeque<ScheduledBuffer>,
    /// Bumped whenever queued buffers are thrown away, so their late
    /// completions are not counted.
    generation: u64,
    next_buffer_id: u64,
    stats: SchedulerStats,
    started: bool,
    paused: bool,
    low: bool,
    audio_seen: bool,
    ended: bool,
}

impl Scheduler {
    /// `sender` must feed the queue this scheduler is driven from; buffer
    /// completions come back through it.
    pub fn new(config: SchedulerConfig, graph: Box<dyn RenderGraph>, sender: SchedulerSender, notify: Notify) -> Self {
        Scheduler {
            config: config,
            graph: graph,
            sender: sender,
            notify: notify,
            shared_stats: Arc::new(Mutex::new(SchedulerStats::default())),
            format: None,
            accumulation: None,
            backlog: VecDeque::new(),
            generation: 0,
            next_buffer_id: 0,
            stats: SchedulerStats::default(),
            started: false,
            paused: false,
            low: false,
            audio_seen: false,
            ended: false,
        }
    }

    /// Snapshot cell kept current by the scheduler, readable from any thread.
    pub fn shared_stats(&self) -> Arc<Mutex<SchedulerStats>> {
        Arc::clone(&self.shared_stats)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Frames waiting in the accumulation buffer.
    pub fn pending_frames(&self) -> usize {
        self.accumulation.as_ref().map(Accumulation::frames).unwrap_or(0)
    }

    /// Buffers flushed but still waiting for room in the graph.
    pub fn waiting_buffers(&self) -> usize {
        self.backlog.len()
    }

    /// False while the backlog holds buffers: more stream data should wait
    /// until completions drain it.
    pub fn accepts_input(&self) -> bool {
        self.backlog.is_empty()
    }

    pub fn enqueue(&mut self, chunk: PcmChunk) -> Result<(), RenderError> {
        if chunk.is_empty() || self.ended {
            return Ok(());
        }

        if self.format != Some(chunk.format) {
            self.reconnect(chunk.format)?;
        }

        if !self.audio_seen {
            self.audio_seen = true;
            (self.notify)(SchedulerEvent::FirstAudio);
        }
        (self.notify)(SchedulerEvent::PcmReady {
            format: chunk.format,
            frames: chunk.frames(),
            sequence: chunk.sequence,
        });

        let threshold = self.config.accumulation_frames(chunk.format.sample_rate);
        let total = chunk.frames();
        let mut copied = 0;

        while copied < total {
            let remaining = total - copied;
            let flush_now = {
                let acc = self
                    .accumulation
                    .get_or_insert_with(|| Accumulation::new(chunk.format, threshold));

                if acc.space_left() < remaining && acc.frames() > 0 {
                    // would overflow: schedule what is there, then start afresh
                    true
                } else {
                    let take = acc.space_left().min(remaining);
                    for (plane, source) in acc.planes.iter_mut().zip(chunk.planes()) {
                        plane.extend_from_slice(&source[copied..copied + take]);
                    }
                    copied += take;
                    acc.space_left() == 0
                }
            };

            if flush_now {
                self.flush()?;
            }
        }

        Ok(())
    }

    pub fn metadata(&mut self, title: String) {
        if !self.ended {
            (self.notify)(SchedulerEvent::Metadata(title));
        }
    }

    pub fn stream_info(&mut self, info: StreamInfo) {
        if !self.ended {
            (self.notify)(SchedulerEvent::StreamInfo(info));
        }
    }

    pub fn on_played(&mut self, generation: u64) -> Result<(), RenderError> {
        if generation != self.generation {
            return Ok(());
        }

        self.stats.in_flight = self.stats.in_flight.saturating_sub(1);
        self.stats.consumed += 1;

        if self.started && !self.ended && self.stats.in_flight < self.config.low_water_mark {
            if !self.low {
                self.low = true;
                warn!(
                    "render queue low: {} buffers in flight (low water mark {})",
                    self.stats.in_flight, self.config.low_water_mark
                );
                (self.notify)(SchedulerEvent::BufferLow { queued: self.stats.in_flight });
            }
        } else if self.stats.in_flight >= self.config.low_water_mark {
            self.low = false;
        }

        self.submit_backlog()?;
        self.publish_stats();
        Ok(())
    }

    /// The upstream is done. Whatever is accumulated is scheduled and the
    /// graph started even short of the warm-up count.
    pub fn finish(&mut self, error: Option<PlayerError>) {
        if self.ended {
            return;
        }

        if error.is_none() {
            let flushed = self.flush().and_then(|()| {
                if !self.started && !self.paused && self.stats.in_flight > 0 {
                    self.start()
                } else {
                    Ok(())
                }
            });
            if let Err(e) = flushed {
                warn!("scheduling stream tail: {}", e);
            }
        } else {
            self.backlog.clear();
            self.graph.stop();
        }

        self.ended = true;
        (self.notify)(SchedulerEvent::Ended(error));
    }

    pub fn pause(&mut self) {
        self.paused = true;
        if let Err(e) = self.graph.pause() {
            warn!("pausing render graph: {}", e);
        }
    }

    /// Halts the graph and forgets every buffer and counter.
    pub fn stop(&mut self) {
        self.graph.stop();
        self.graph.reset();

        if let Some(acc) = self.accumulation.take() {
            debug!("discarding {} accumulated frames", acc.frames());
        }
        self.backlog.clear();
        self.format = None;
        self.generation += 1;
        self.stats = SchedulerStats::default();
        self.started = false;
        self.low = false;
        self.audio_seen = false;
        self.ended = true;
        self.publish_stats();
    }

    fn reconnect(&mut self, format: PcmFormat) -> Result<(), RenderError> {
        if let Some(old) = self.format.take() {
            info!("pcm format changed {} -> {}, reconnecting render graph", old, format);
            if let Some(acc) = self.accumulation.take() {
                debug!("discarding {} frames of {}", acc.frames(), acc.format);
            }
            self.backlog.clear();
            self.graph.stop();
            self.graph.reset();
            self.generation += 1;
            self.stats.in_flight = 0;
            self.started = false;
            self.low = false;
        }

        self.graph.connect(format)?;
        self.format = Some(format);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), RenderError> {
        let acc = match self.accumulation.take() {
            Some(acc) if acc.frames() > 0 => acc,
            _ => return Ok(()),
        };

        self.backlog.push_back(ScheduledBuffer {
            id: self.next_buffer_id,
            format: acc.format,
            planes: acc.planes,
        });
        self.next_buffer_id += 1;

        self.submit_backlog()?;
        self.publish_stats();
        Ok(())
    }

    /// Hands waiting buffers to the graph while it has room.
    fn submit_backlog(&mut self) -> Result<(), RenderError> {
        while !self.backlog.is_empty() && self.graph.has_room() {
            let buffer = match self.backlog.pop_front() {
                Some(buffer) => buffer,
                None => break,
            };
            let sender = self.sender.clone();
            let generation = self.generation;
            debug!("scheduling {:?}", buffer);
            self.graph.schedule(buffer, Box::new(move || sender.played(generation)))?;

            self.stats.in_flight += 1;
            self.stats.scheduled += 1;
            if self.stats.in_flight >= self.config.low_water_mark {
                self.low = false;
            }
        }

        if !self.backlog.is_empty() {
            debug!("render graph full, {} buffers waiting", self.backlog.len());
        }

        // a full graph counts as warmed up even below the threshold
        let warmed = self.stats.in_flight >= self.config.min_buffers_before_play || !self.backlog.is_empty();
        if !self.started && !self.paused && self.stats.in_flight > 0 && warmed {
            self.start()?;
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), RenderError> {
        info!("starting render graph with {} buffers queued", self.stats.in_flight);
        self.graph.start()?;
        self.started = true;
        Ok(())
    }

    fn publish_stats(&self) {
        *self.shared_stats.lock() = self.stats;
    }
}

/// Runs `scheduler` on its own thread until a `Stop` message arrives.
pub fn spawn_worker(mut scheduler: Scheduler, input: SchedulerQueue) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("icy-schedule".to_owned())
        .spawn(move || {
            while let Some(msg) = input.recv(scheduler.accepts_input()) {
                match msg {
                    SchedulerMsg::StreamInfo(info) => scheduler.stream_info(info),
                    SchedulerMsg::Chunk(chunk) => {
                        if let Err(e) = scheduler.enqueue(chunk) {
                            error!("render graph: {}", e);
                            scheduler.finish(Some(PlayerError::Render(e)));
                        }
                    }
                    SchedulerMsg::Metadata(title) => scheduler.metadata(title),
                    SchedulerMsg::End(error) => scheduler.finish(error),
                    SchedulerMsg::Played { generation } => {
                        if let Err(e) = scheduler.on_played(generation) {
                            error!("render graph: {}", e);
                            scheduler.finish(Some(PlayerError::Render(e)));
                        }
                    }
                    SchedulerMsg::Pause(ack) => {
                        scheduler.pause();
                        let _ = ack.send(());
                    }
                    SchedulerMsg::Stop(ack) => {
                        scheduler.stop();
                        let _ = ack.send(());
                        break;
                    }
                }
            }

            debug!("scheduler worker exiting");
        })
}
