//! Sample-rate conversion from the stream rate to the render graph rate.

use rubato::{FftFixedInOut, Resampler as _};
use thiserror::Error;

/// Input frames per resampler pass, before rubato rounds it to fit the ratio.
const CHUNK_FRAMES: usize = 1024;

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("creating resampler {from}hz -> {to}hz: {reason}")]
    Construction { from: u32, to: u32, reason: String },
    #[error("resampling: {0}")]
    Process(String),
}

/// Buffers planar input until a full resampler chunk is available.
pub struct Resampler {
    inner: FftFixedInOut<f32>,
    pending: Vec<Vec<f32>>,
}

impl Resampler {
    pub fn new(from: u32, to: u32, channels: usize) -> Result<Self, ResampleError> {
        let inner = FftFixedInOut::<f32>::new(from as usize, to as usize, CHUNK_FRAMES, channels)
            .map_err(|e| ResampleError::Construction {
                from: from,
                to: to,
                reason: e.to_string(),
            })?;

        Ok(Resampler {
            inner: inner,
            pending: vec![Vec::new(); channels],
        })
    }

    /// Input frames waiting for a complete chunk.
    pub fn pending_frames(&self) -> usize {
        self.pending.first().map(Vec::len).unwrap_or(0)
    }

    /// Feeds one planar block and appends every completed output chunk to
    /// `output`, one plane per channel.
    pub fn process(&mut self, input: &[&[f32]], output: &mut [Vec<f32>]) -> Result<usize, ResampleError> {
        for (pending, plane) in self.pending.iter_mut().zip(input) {
            pending.extend_from_slice(plane);
        }

        let mut produced = 0;
        loop {
            let needed = self.inner.input_frames_next();
            if self.pending_frames() < needed {
                break;
            }

            let chunk: Vec<&[f32]> = self.pending.iter().map(|plane| &plane[..needed]).collect();
            let resampled = self
                .inner
                .process(&chunk, None)
                .map_err(|e| ResampleError::Process(e.to_string()))?;

            for (plane, out) in resampled.iter().zip(output.iter_mut()) {
                out.extend_from_slice(plane);
            }
            produced += resampled.first().map(Vec::len).unwrap_or(0);

            for plane in self.pending.iter_mut() {
                plane.drain(..needed);
            }
        }

        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_length_follows_rate_ratio() {
        let mut resampler = Resampler::new(44_100, 48_000, 2).unwrap();
        let input = vec![0.25f32; 44_100];
        let mut output = vec![Vec::new(), Vec::new()];

        let produced = resampler.process(&[input.as_slice(), input.as_slice()], &mut output).unwrap();
        let consumed = 44_100 - resampler.pending_frames();

        assert_eq!(output[0].len(), produced);
        assert_eq!(output[1].len(), produced);
        assert_eq!(produced as u64 * 44_100, consumed as u64 * 48_000);
    }

    #[test]
    fn holds_input_until_a_chunk_is_complete() {
        let mut resampler = Resampler::new(48_000, 44_100, 1).unwrap();
        let mut output = vec![Vec::new()];

        let produced = resampler.process(&[&[0.0f32; 10][..]], &mut output).unwrap();

        assert_eq!(produced, 0);
        assert_eq!(resampler.pending_frames(), 10);
        assert!(output[0].is_empty());
    }

    #[test]
    fn constant_signal_settles_to_same_level() {
        let mut resampler = Resampler::new(22_050, 44_100, 1).unwrap();
        let input = vec![0.5f32; 22_050];
        let mut output = vec![Vec::new()];

        resampler.process(&[input.as_slice()], &mut output).unwrap();

        // skip the filter warm-up at the start
        let settled = &output[0][output[0].len() / 2..];
        assert!(settled.iter().all(|sample| approx::abs_diff_eq!(*sample, 0.5, epsilon = 0.01)));
    }
}
