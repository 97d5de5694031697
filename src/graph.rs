//! The render graph seam: what the scheduler needs from an audio output.

use std::fmt;

use thiserror::Error;

use crate::audio::PcmFormat;

/// Runs once the render side has actually played the buffer it was
/// scheduled with. Never runs for buffers dropped by `stop` or `reset`.
pub type Completion = Box<dyn FnOnce() + Send>;

/// One accumulation buffer handed to the graph, non-interleaved.
pub struct ScheduledBuffer {
    pub id: u64,
    pub format: PcmFormat,
    pub planes: Vec<Vec<f32>>,
}

impl ScheduledBuffer {
    pub fn frames(&self) -> usize {
        self.planes.first().map(Vec::len).unwrap_or(0)
    }
}

impl fmt::Debug for ScheduledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ScheduledBuffer")
            .field("id", &self.id)
            .field("format", &self.format)
            .field("frames", &self.frames())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no output device available")]
    NoDevice,
    #[error("output device configuration: {0}")]
    Config(String),
    #[error("building output stream: {0}")]
    Build(String),
    #[error("output stream: {0}")]
    Stream(String),
    #[error("render queue is full")]
    QueueFull,
    #[error("render graph is not connected")]
    NotConnected,
}

/// A source → equalizer → mixer → output chain.
///
/// All calls come from the scheduler's worker thread, in order.
pub trait RenderGraph: Send {
    /// Sample rate the output would like to be fed at, if it has one.
    fn output_sample_rate(&self) -> Option<u32>;

    /// (Re)builds the chain for `format`, dropping anything queued for the
    /// previous format.
    fn connect(&mut self, format: PcmFormat) -> Result<(), RenderError>;

    /// Fails with [`RenderError::QueueFull`] when called without room.
    fn schedule(&mut self, buffer: ScheduledBuffer, completion: Completion) -> Result<(), RenderError>;

    /// Whether `schedule` would accept another buffer right now.
    fn has_room(&self) -> bool {
        true
    }

    fn start(&mut self) -> Result<(), RenderError>;

    /// Halts rendering and keeps queued buffers.
    fn pause(&mut self) -> Result<(), RenderError>;

    /// Halts rendering and drops queued buffers.
    fn stop(&mut self);

    /// Tears the chain down; `connect` is needed before the next `schedule`.
    fn reset(&mut self);
}

/// Builds a fresh graph for each playback session.
pub trait RenderGraphFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn RenderGraph>, RenderError>;
}

impl<F> RenderGraphFactory for F
where
    F: Fn() -> Result<Box<dyn RenderGraph>, RenderError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn RenderGraph>, RenderError> {
        self()
    }
}
