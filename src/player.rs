//! The player: a state machine over one pipeline per playback session.
//!
//! ```text
//! fetch thread ──DecodeMsg──▶ decode worker ──SchedulerMsg──▶ scheduler worker ──▶ render graph
//! ```
//!
//! Every `play()` builds a fresh pipeline tagged with a new generation;
//! pipeline events carrying an old generation are dropped, which is what
//! makes `stop()` final from the caller's point of view.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_derive::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;
use crate::decoder::{self, ConverterFactory, DecodeError, DecoderSettings, SymphoniaFactory};
use crate::eq::Equalizer;
use crate::fanout::{self, Channel};
use crate::fetch::{self, FetchError, StreamInfo};
use crate::graph::{RenderError, RenderGraphFactory};
use crate::output::CpalGraphFactory;
use crate::scheduler::{self, Scheduler, SchedulerEvent, SchedulerSender, SchedulerStats};
use crate::session::{self, AudioSession, DefaultSession, SessionAction, SessionController, SessionSignal};

/// Events buffered per subscriber before it starts missing some.
const EVENT_BUFFER: usize = 256;

/// Parser output queued ahead of the decoder before the network read
/// blocks.
const DECODE_QUEUE: usize = 64;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("fetching stream: {0}")]
    Fetch(#[from] FetchError),
    #[error("decoding stream: {0}")]
    Decode(#[from] DecodeError),
    #[error("render graph: {0}")]
    Render(#[from] RenderError),
    #[error("starting pipeline thread: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerItem {
    pub title: String,
    pub url: String,
    pub thumbnail_url: Option<String>,
}

impl PlayerItem {
    pub fn stream<T, U>(title: T, url: U, thumbnail_url: Option<String>) -> Self
    where
        T: Into<String>,
        U: Into<String>,
    {
        PlayerItem {
            title: title.into(),
            url: url.into(),
            thumbnail_url: thumbnail_url,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    NotInitialized,
    Buffering,
    Playing,
    Paused,
    Stopped,
    Failed,
}

impl PlaybackState {
    pub fn can_become(self, next: PlaybackState) -> bool {
        use self::PlaybackState::*;

        match (self, next) {
            (_, Stopped) | (_, Failed) | (_, Buffering) => self != next,
            (Buffering, Playing) => true,
            (Buffering, Paused) | (Playing, Paused) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlayerEvent {
    StatusChanged { state: PlaybackState },
    Metadata { title: String },
    StreamInfo(StreamInfo),
    PcmReady { sample_rate: u32, channels: u16, frames: usize, sequence: u64 },
    BufferLow { queued: usize },
    StreamStopped { error: Option<String> },
}

struct Pipeline {
    id: Uuid,
    cancel: Arc<AtomicBool>,
    fetch: JoinHandle<()>,
    decode_cancel: Sender<()>,
    decode: JoinHandle<()>,
    scheduler: SchedulerSender,
    schedule: JoinHandle<()>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl Pipeline {
    /// The fetch thread notices within one read timeout.
    fn stop_fetch(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Stages are stopped downstream first: a stage blocked handing data to
    /// a full queue is released when the stage after it goes away.
    fn shutdown(self) {
        self.stop_fetch();
        drop(self.decode_cancel);

        self.scheduler.stop();
        if self.schedule.join().is_err() {
            warn!("[{}] scheduler worker panicked", self.id);
        }
        if self.decode.join().is_err() {
            warn!("[{}] decode worker panicked", self.id);
        }
        if self.fetch.join().is_err() {
            warn!("[{}] fetch thread panicked", self.id);
        }

        info!("[{}] pipeline stopped", self.id);
    }
}

struct Inner {
    state: PlaybackState,
    session: SessionController,
    session_configured: bool,
    generation: u64,
    pipeline: Option<Pipeline>,
}

struct Shared {
    item: PlayerItem,
    config: Config,
    graphs: Box<dyn RenderGraphFactory>,
    converters: Arc<dyn ConverterFactory>,
    audio_session: Box<dyn AudioSession>,
    equalizer: Equalizer,
    events: Channel<PlayerEvent>,
    /// Serialises play, pause and stop.
    control: Mutex<()>,
    inner: Mutex<Inner>,
}

impl Shared {
    /// The only place the playback state changes.
    fn transition(&self, inner: &mut Inner, next: PlaybackState) -> bool {
        if inner.state == next {
            return false;
        }
        if !inner.state.can_become(next) {
            debug!("ignoring {:?} -> {:?}", inner.state, next);
            return false;
        }

        info!("playback {:?} -> {:?}", inner.state, next);
        inner.state = next;
        self.events.publish(PlayerEvent::StatusChanged { state: next });
        true
    }

    fn on_pipeline_event(&self, generation: u64, event: SchedulerEvent) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }

        match event {
            SchedulerEvent::StreamInfo(info) => self.events.publish(PlayerEvent::StreamInfo(info)),
            SchedulerEvent::FirstAudio => {
                if inner.state == PlaybackState::Buffering {
                    self.transition(&mut inner, PlaybackState::Playing);
                }
            }
            SchedulerEvent::PcmReady { format, frames, sequence } => self.events.publish(PlayerEvent::PcmReady {
                sample_rate: format.sample_rate,
                channels: format.channels,
                frames: frames,
                sequence: sequence,
            }),
            SchedulerEvent::Metadata(title) => self.events.publish(PlayerEvent::Metadata { title: title }),
            SchedulerEvent::BufferLow { queued } => self.events.publish(PlayerEvent::BufferLow { queued: queued }),
            SchedulerEvent::Ended(error) => {
                let next = if error.is_some() { PlaybackState::Failed } else { PlaybackState::Stopped };
                self.events.publish(PlayerEvent::StreamStopped {
                    error: error.as_ref().map(ToString::to_string),
                });
                self.transition(&mut inner, next);
            }
        }
    }

    fn start_pipeline(self: &Arc<Self>, generation: u64) -> Result<Pipeline, PlayerError> {
        let id = Uuid::new_v4();
        info!("[{}] starting {} ({})", id, self.item.title, self.item.url);

        let graph = self.graphs.create()?;
        let preferred_rate = graph.output_sample_rate();

        let (scheduler_tx, scheduler_rx) = scheduler::channel();
        let weak: Weak<Shared> = Arc::downgrade(self);
        let notify = Box::new(move |event: SchedulerEvent| {
            if let Some(shared) = weak.upgrade() {
                shared.on_pipeline_event(generation, event);
            }
        });
        let scheduler = Scheduler::new(self.config.scheduler.clone(), graph, scheduler_tx.clone(), notify);
        let stats = scheduler.shared_stats();
        let schedule = scheduler::spawn_worker(scheduler, scheduler_rx)?;

        let (decode_tx, decode_rx) = crossbeam_channel::bounded(DECODE_QUEUE);
        let (decode_cancel, decode_cancel_rx) = crossbeam_channel::bounded(1);
        let settings = DecoderSettings::from_config(&self.config.decoder, preferred_rate);
        let decode = match decoder::spawn_worker(
            decode_rx,
            decode_cancel_rx,
            settings,
            Arc::clone(&self.converters),
            scheduler_tx.clone(),
        ) {
            Ok(decode) => decode,
            Err(e) => {
                scheduler_tx.stop();
                let _ = schedule.join();
                return Err(e.into());
            }
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let fetch = match fetch::spawn(
            self.item.url.clone(),
            id,
            self.config.stream.clone(),
            decode_tx,
            Arc::clone(&cancel),
        ) {
            Ok(fetch) => fetch,
            Err(e) => {
                drop(decode_cancel);
                scheduler_tx.stop();
                let _ = schedule.join();
                let _ = decode.join();
                return Err(e.into());
            }
        };

        Ok(Pipeline {
            id: id,
            cancel: cancel,
            fetch: fetch,
            decode_cancel: decode_cancel,
            decode: decode,
            scheduler: scheduler_tx,
            schedule: schedule,
            stats: stats,
        })
    }

    /// Takes the running pipeline out and silences its events.
    fn detach_pipeline(&self, inner: &mut Inner) -> Option<Pipeline> {
        inner.generation += 1;
        inner.pipeline.take()
    }

    fn halt(&self, user_stop: bool) {
        let _control = self.control.lock();

        let pipeline = {
            let mut inner = self.inner.lock();
            if user_stop {
                inner.session.deactivate();
            }
            let pipeline = self.detach_pipeline(&mut inner);
            self.transition(&mut inner, PlaybackState::Stopped);
            pipeline
        };

        if let Some(pipeline) = pipeline {
            pipeline.shutdown();
        }
    }
}

pub struct PlayerBuilder {
    item: PlayerItem,
    config: Config,
    equalizer: Equalizer,
    graphs: Option<Box<dyn RenderGraphFactory>>,
    converters: Option<Arc<dyn ConverterFactory>>,
    audio_session: Option<Box<dyn AudioSession>>,
}

impl PlayerBuilder {
    pub fn render_graph<F>(mut self, factory: F) -> Self
    where
        F: RenderGraphFactory + 'static,
    {
        self.graphs = Some(Box::new(factory));
        self
    }

    pub fn converter<F>(mut self, factory: F) -> Self
    where
        F: ConverterFactory + 'static,
    {
        self.converters = Some(Arc::new(factory));
        self
    }

    pub fn audio_session<S>(mut self, session: S) -> Self
    where
        S: AudioSession + 'static,
    {
        self.audio_session = Some(Box::new(session));
        self
    }

    pub fn equalizer(mut self, equalizer: Equalizer) -> Self {
        self.equalizer = equalizer;
        self
    }

    pub fn build(self) -> Player {
        let equalizer = self.equalizer;
        let graphs: Box<dyn RenderGraphFactory> = match self.graphs {
            Some(graphs) => graphs,
            None => Box::new(CpalGraphFactory::new(equalizer.clone())),
        };
        let converters: Arc<dyn ConverterFactory> = match self.converters {
            Some(converters) => converters,
            None => Arc::new(SymphoniaFactory),
        };
        let audio_session: Box<dyn AudioSession> = match self.audio_session {
            Some(audio_session) => audio_session,
            None => Box::new(DefaultSession),
        };

        Player {
            shared: Arc::new(Shared {
                item: self.item,
                config: self.config,
                graphs: graphs,
                converters: converters,
                audio_session: audio_session,
                equalizer: equalizer,
                events: Channel::new(EVENT_BUFFER),
                control: Mutex::new(()),
                inner: Mutex::new(Inner {
                    state: PlaybackState::NotInitialized,
                    session: SessionController::new(),
                    session_configured: false,
                    generation: 0,
                    pipeline: None,
                }),
            }),
        }
    }
}

pub struct Player {
    shared: Arc<Shared>,
}

impl Player {
    /// A player on the default output device with symphonia decoding.
    pub fn new(item: PlayerItem, config: Config) -> Player {
        Player::builder(item, config).build()
    }

    pub fn builder(item: PlayerItem, config: Config) -> PlayerBuilder {
        PlayerBuilder {
            item: item,
            config: config,
            equalizer: Equalizer::default(),
            graphs: None,
            converters: None,
            audio_session: None,
        }
    }

    pub fn item(&self) -> &PlayerItem {
        &self.shared.item
    }

    /// Starts a fresh pipeline from the live edge, replacing any running
    /// one. The audio session is configured on the first call only.
    pub fn play(&self) -> Result<(), PlayerError> {
        let shared = &self.shared;
        let _control = shared.control.lock();

        let old = {
            let mut inner = shared.inner.lock();
            shared.detach_pipeline(&mut inner)
        };
        if let Some(old) = old {
            old.shutdown();
        }

        let configure = {
            let mut inner = shared.inner.lock();
            let first = !inner.session_configured;
            inner.session_configured = true;
            first
        };
        session::prepare(&*shared.audio_session, configure);

        let generation = {
            let mut inner = shared.inner.lock();
            inner.generation += 1;
            inner.session.activate();
            shared.transition(&mut inner, PlaybackState::Buffering);
            inner.generation
        };

        let started = shared.start_pipeline(generation);

        let mut inner = shared.inner.lock();
        match started {
            Ok(pipeline) => {
                inner.pipeline = Some(pipeline);
                Ok(())
            }
            Err(e) => {
                warn!("cannot start playback: {}", e);
                shared.events.publish(PlayerEvent::StreamStopped { error: Some(e.to_string()) });
                shared.transition(&mut inner, PlaybackState::Failed);
                Err(e)
            }
        }
    }

    /// Pauses output, keeping queued audio. The network fetch stops too:
    /// the next `play()` starts again from the live edge.
    pub fn pause(&self) {
        let shared = &self.shared;
        let _control = shared.control.lock();

        let scheduler = {
            let inner = shared.inner.lock();
            match (inner.state, inner.pipeline.as_ref()) {
                (PlaybackState::Buffering, Some(pipeline)) | (PlaybackState::Playing, Some(pipeline)) => {
                    pipeline.stop_fetch();
                    Some(pipeline.scheduler.clone())
                }
                _ => None,
            }
        };

        if let Some(scheduler) = scheduler {
            scheduler.pause();
            let mut inner = shared.inner.lock();
            shared.transition(&mut inner, PlaybackState::Paused);
        }
    }

    /// Stops playback and releases the whole pipeline before returning.
    /// Nothing from the stopped session is delivered afterwards.
    pub fn stop(&self) {
        self.shared.halt(true);
    }

    pub fn status(&self) -> PlaybackState {
        self.shared.inner.lock().state
    }

    pub fn subscribe(&self) -> fanout::Receiver<PlayerEvent> {
        self.shared.events.subscribe()
    }

    pub fn handle_session_signal(&self, signal: SessionSignal) {
        let action = self.shared.inner.lock().session.handle(signal);

        match action {
            SessionAction::Stop => self.shared.halt(false),
            SessionAction::Resume => {
                if let Err(e) = self.play() {
                    warn!("resuming after {:?}: {}", signal, e);
                }
            }
            SessionAction::None => {}
        }
    }

    pub fn equalizer(&self) -> Equalizer {
        self.shared.equalizer.clone()
    }

    pub fn stats(&self) -> SchedulerStats {
        let inner = self.shared.inner.lock();
        match inner.pipeline {
            Some(ref pipeline) => *pipeline.stats.lock(),
            None => SchedulerStats::default(),
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        let _control = self.shared.control.lock();
        let pipeline = {
            let mut inner = self.shared.inner.lock();
            self.shared.detach_pipeline(&mut inner)
        };
        if let Some(pipeline) = pipeline {
            pipeline.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::tests::mp3_frame;
    use crate::scheduler::tests::{Op, RecordingGraph};
    use crate::session::SessionError;
    use crate::graph::RenderGraph;
    use std::io::{ErrorKind, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::{Duration, Instant};

    fn item(url: &str) -> PlayerItem {
        PlayerItem::stream("Test FM", url, None)
    }

    fn recording() -> impl RenderGraphFactory {
        || -> Result<Box<dyn RenderGraph>, RenderError> { Ok(Box::new(RecordingGraph::default())) }
    }

    fn drain(events: &fanout::Receiver<PlayerEvent>) -> Vec<PlayerEvent> {
        std::iter::from_fn(|| events.try_recv()).collect()
    }

    fn wait_for<F>(events: &fanout::Receiver<PlayerEvent>, found: F) -> Vec<PlayerEvent>
    where
        F: Fn(&PlayerEvent) -> bool,
    {
        let mut seen = Vec::new();
        while let Some(event) = events.recv_timeout(Duration::from_secs(10)) {
            let done = found(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
        panic!("event never arrived, saw {:?}", seen);
    }

    /// Answers every connection with headers and `audio`, then goes quiet
    /// with the socket still open. Accepted sockets come out of the receiver.
    fn stalled_server(audio: Vec<u8>) -> (String, crossbeam_channel::Receiver<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/live", listener.local_addr().unwrap());
        let (accepted, connections) = crossbeam_channel::unbounded();

        thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => return,
                };
                let mut request = Vec::new();
                let mut byte = [0u8; 1];
                while !request.ends_with(b"\r\n\r\n") {
                    match stream.read(&mut byte) {
                        Ok(1) => request.push(byte[0]),
                        _ => break,
                    }
                }
                let _ = stream.write_all(b"HTTP/1.0 200 OK\r\ncontent-type: audio/mpeg\r\n\r\n");
                let _ = stream.write_all(&audio);
                if accepted.send(stream).is_err() {
                    return;
                }
            }
        });

        (url, connections)
    }

    /// Panics unless the client side hangs up within a few seconds.
    fn assert_hung_up(socket: &mut TcpStream) {
        socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut scratch = [0u8; 256];
        loop {
            match socket.read(&mut scratch) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(ref e) if e.kind() == ErrorKind::ConnectionReset => return,
                Err(e) => panic!("connection still open: {}", e),
            }
        }
    }

    #[test]
    fn legal_transitions() {
        use PlaybackState::*;

        assert!(NotInitialized.can_become(Buffering));
        assert!(Buffering.can_become(Playing));
        assert!(Playing.can_become(Paused));
        assert!(Paused.can_become(Buffering));
        assert!(Failed.can_become(Stopped));
        assert!(!NotInitialized.can_become(Playing));
        assert!(!Paused.can_become(Playing));
        assert!(!Stopped.can_become(Paused));
        assert!(!Stopped.can_become(Stopped));
    }

    #[test]
    fn stop_twice_emits_once() {
        let player = Player::builder(item("http://127.0.0.1:1/"), Config::default())
            .render_graph(recording())
            .build();
        let events = player.subscribe();

        player.stop();
        player.stop();

        let seen = drain(&events);
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], PlayerEvent::StatusChanged { state: PlaybackState::Stopped }));
        assert_eq!(player.stats(), SchedulerStats::default());
    }

    #[test]
    fn render_graph_failure_fails_playback() {
        let player = Player::builder(item("http://127.0.0.1:1/"), Config::default())
            .render_graph(|| -> Result<Box<dyn RenderGraph>, RenderError> { Err(RenderError::NoDevice) })
            .build();
        let events = player.subscribe();

        assert!(matches!(player.play(), Err(PlayerError::Render(RenderError::NoDevice))));

        assert_eq!(player.status(), PlaybackState::Failed);
        let seen = drain(&events);
        assert!(matches!(seen[0], PlayerEvent::StatusChanged { state: PlaybackState::Buffering }));
        assert!(matches!(seen[1], PlayerEvent::StreamStopped { error: Some(_) }));
        assert!(matches!(seen[2], PlayerEvent::StatusChanged { state: PlaybackState::Failed }));
    }

    #[test]
    fn unreachable_stream_fails_playback() {
        let player = Player::builder(item("http://127.0.0.1:1/"), Config::default())
            .render_graph(recording())
            .build();
        let events = player.subscribe();

        player.play().unwrap();
        let seen = wait_for(&events, |event| matches!(event, PlayerEvent::StatusChanged { state: PlaybackState::Failed }));

        assert!(seen
            .iter()
            .any(|event| matches!(event, PlayerEvent::StreamStopped { error: Some(e) } if e.starts_with("fetching stream"))));

        player.stop();
        assert_eq!(player.status(), PlaybackState::Stopped);
    }

    struct CountingSession {
        configured: Arc<AtomicUsize>,
        activated: Arc<AtomicUsize>,
    }

    impl AudioSession for CountingSession {
        fn configure(&self) -> Result<(), SessionError> {
            self.configured.fetch_add(1, Ordering::SeqCst);
            Err(SessionError::Configure("not on this platform".to_owned()))
        }

        fn activate(&self) -> Result<(), SessionError> {
            self.activated.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn session_is_configured_once_and_failure_is_not_fatal() {
        let configured = Arc::new(AtomicUsize::new(0));
        let activated = Arc::new(AtomicUsize::new(0));
        let player = Player::builder(item("http://127.0.0.1:1/"), Config::default())
            .render_graph(recording())
            .audio_session(CountingSession {
                configured: Arc::clone(&configured),
                activated: Arc::clone(&activated),
            })
            .build();

        player.play().unwrap();
        player.play().unwrap();
        player.stop();

        assert_eq!(configured.load(Ordering::SeqCst), 1);
        assert_eq!(activated.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn interruption_stops_and_resume_restarts() {
        let player = Player::builder(item("http://127.0.0.1:1/"), Config::default())
            .render_graph(recording())
            .build();
        player.play().unwrap();
        let events = player.subscribe();

        player.handle_session_signal(SessionSignal::BeginInterruption);
        assert_eq!(player.status(), PlaybackState::Stopped);

        player.handle_session_signal(SessionSignal::EndInterruption { can_resume: true });
        let seen = wait_for(&events, |event| matches!(event, PlayerEvent::StatusChanged { state: PlaybackState::Buffering }));
        assert!(seen
            .iter()
            .any(|event| matches!(event, PlayerEvent::StatusChanged { state: PlaybackState::Stopped })));

        player.stop();
        player.handle_session_signal(SessionSignal::EndInterruption { can_resume: true });
        assert_eq!(player.status(), PlaybackState::Stopped);
    }

    #[test]
    fn pause_outside_playback_does_nothing() {
        let player = Player::builder(item("http://127.0.0.1:1/"), Config::default())
            .render_graph(recording())
            .build();
        let events = player.subscribe();

        player.pause();

        assert_eq!(player.status(), PlaybackState::NotInitialized);
        assert!(drain(&events).is_empty());
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let status = serde_json::to_value(PlayerEvent::StatusChanged { state: PlaybackState::Playing }).unwrap();
        assert_eq!(status, serde_json::json!({ "event": "status_changed", "state": "playing" }));

        let metadata = serde_json::to_value(PlayerEvent::Metadata { title: "Artist - Title".to_owned() }).unwrap();
        assert_eq!(metadata["title"], "Artist - Title");
    }

    #[test]
    fn stop_hangs_up_on_a_silent_server_every_time() {
        let (url, connections) = stalled_server(Vec::new());
        let mut config = Config::default();
        config.stream.read_timeout_ms = 100;
        let player = Player::builder(item(&url), config)
            .render_graph(recording())
            .build();
        let events = player.subscribe();

        for _ in 0..3 {
            player.play().unwrap();
            wait_for(&events, |event| matches!(event, PlayerEvent::StreamInfo(_)));
            let mut socket = connections.recv_timeout(Duration::from_secs(5)).unwrap();

            player.stop();

            assert_eq!(player.status(), PlaybackState::Stopped);
            assert_hung_up(&mut socket);
        }
    }

    #[test]
    fn pause_keeps_queued_audio_and_play_goes_live_again() {
        let audio: Vec<u8> = (0..40).flat_map(|_| mp3_frame(false, false)).collect();
        let (url, connections) = stalled_server(audio);
        let mut config = Config::default();
        config.stream.read_timeout_ms = 100;
        // the test frames decode to silence
        config.decoder.max_priming_chunks = 0;
        config.scheduler.target_latency_ms = 100;
        config.scheduler.min_buffers_before_play = 2;

        let graph = RecordingGraph::default();
        let factory_graph = graph.clone();
        let player = Player::builder(item(&url), config)
            .render_graph(move || -> Result<Box<dyn RenderGraph>, RenderError> { Ok(Box::new(factory_graph.clone())) })
            .build();
        let events = player.subscribe();

        player.play().unwrap();
        wait_for(&events, |event| matches!(event, PlayerEvent::StatusChanged { state: PlaybackState::Playing }));
        let mut first = connections.recv_timeout(Duration::from_secs(5)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while player.stats().in_flight == 0 {
            assert!(Instant::now() < deadline, "nothing was scheduled");
            thread::sleep(Duration::from_millis(10));
        }

        player.pause();

        assert_eq!(player.status(), PlaybackState::Paused);
        assert_hung_up(&mut first);
        assert!(player.stats().in_flight > 0);
        assert_eq!(graph.count(|op| matches!(op, Op::Pause)), 1);
        assert_eq!(graph.count(|op| matches!(op, Op::Stop)), 0);

        player.play().unwrap();
        let seen = wait_for(&events, |event| matches!(event, PlayerEvent::StatusChanged { state: PlaybackState::Playing }));
        let buffering = seen
            .iter()
            .position(|event| matches!(event, PlayerEvent::StatusChanged { state: PlaybackState::Buffering }));
        assert!(buffering.is_some());
        assert!(connections.recv_timeout(Duration::from_secs(5)).is_ok());

        player.stop();
    }
}
