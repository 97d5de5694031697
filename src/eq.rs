//! Ten-band parametric equalizer.
//!
//! [`Equalizer`] is the control handle shared with consumers. The render
//! side owns an [`EqProcessor`], which picks up new settings between
//! callbacks without ever waiting on the control side.

use std::f32::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_derive::Serialize;

pub const BAND_COUNT: usize = 10;

pub const DEFAULT_FREQUENCIES: [f32; BAND_COUNT] =
    [32.0, 64.0, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Band {
    pub frequency: f32,
    pub gain_db: f32,
    /// Width in octaves.
    pub bandwidth: f32,
    pub bypass: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EqSettings {
    pub bands: [Band; BAND_COUNT],
    pub global_gain_db: f32,
    pub bypass: bool,
}

impl Default for EqSettings {
    fn default() -> Self {
        let mut bands = [Band { frequency: 0.0, gain_db: 0.0, bandwidth: 1.0, bypass: false }; BAND_COUNT];
        for (band, frequency) in bands.iter_mut().zip(DEFAULT_FREQUENCIES.iter()) {
            band.frequency = *frequency;
        }

        EqSettings {
            bands: bands,
            global_gain_db: 0.0,
            bypass: false,
        }
    }
}

struct Shared {
    settings: Mutex<EqSettings>,
    version: AtomicU64,
}

#[derive(Clone)]
pub struct Equalizer {
    shared: Arc<Shared>,
}

impl Default for Equalizer {
    fn default() -> Self {
        Equalizer::new(EqSettings::default())
    }
}

impl Equalizer {
    pub fn new(settings: EqSettings) -> Self {
        Equalizer {
            shared: Arc::new(Shared {
                settings: Mutex::new(settings),
                version: AtomicU64::new(0),
            }),
        }
    }

    pub fn settings(&self) -> EqSettings {
        self.shared.settings.lock().clone()
    }

    pub fn update<F>(&self, change: F)
    where
        F: FnOnce(&mut EqSettings),
    {
        change(&mut self.shared.settings.lock());
        self.shared.version.fetch_add(1, Ordering::Release);
    }

    /// Returns false if `index` is not a band.
    pub fn set_band(&self, index: usize, band: Band) -> bool {
        if index >= BAND_COUNT {
            return false;
        }
        self.update(|settings| settings.bands[index] = band);
        true
    }

    pub fn set_global_gain(&self, gain_db: f32) {
        self.update(|settings| settings.global_gain_db = gain_db);
    }

    pub fn set_bypass(&self, bypass: bool) {
        self.update(|settings| settings.bypass = bypass);
    }

    pub fn toggle_bypass(&self) -> bool {
        let mut bypass = false;
        self.update(|settings| {
            settings.bypass = !settings.bypass;
            bypass = settings.bypass;
        });
        bypass
    }

    /// A processor for `channels` channels at `sample_rate`. Allocates, so
    /// call it outside the realtime callback.
    pub fn processor(&self, sample_rate: u32, channels: usize) -> EqProcessor {
        let mut processor = EqProcessor {
            eq: self.clone(),
            seen_version: u64::MAX,
            sample_rate: sample_rate as f32,
            filters: vec![[Biquad::default(); BAND_COUNT]; channels],
            active: [false; BAND_COUNT],
            gain: 1.0,
            bypass: false,
        };
        processor.refresh();
        processor
    }

    fn version(&self) -> u64 {
        self.shared.version.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl Default for Biquad {
    fn default() -> Self {
        Biquad { b0: 1.0, b1: 0.0, b2: 0.0, a1: 0.0, a2: 0.0, x1: 0.0, x2: 0.0, y1: 0.0, y2: 0.0 }
    }
}

impl Biquad {
    /// Peaking filter from the RBJ cookbook, bandwidth in octaves. Filter
    /// state is kept so live changes do not click.
    fn configure_peaking(&mut self, sample_rate: f32, band: &Band) {
        let a = 10.0_f32.powf(band.gain_db / 40.0);
        let w0 = 2.0 * PI * band.frequency / sample_rate;
        let cos_w0 = w0.cos();
        let sin_w0 = w0.sin();
        let alpha = sin_w0 * ((2.0_f32.ln() / 2.0) * band.bandwidth * w0 / sin_w0).sinh();

        let a0 = 1.0 + alpha / a;

        self.b0 = (1.0 + alpha * a) / a0;
        self.b1 = (-2.0 * cos_w0) / a0;
        self.b2 = (1.0 - alpha * a) / a0;
        self.a1 = (-2.0 * cos_w0) / a0;
        self.a2 = (1.0 - alpha / a) / a0;
    }

    fn process(&mut self, input: f32) -> f32 {
        let output = self.b0 * input + self.b1 * self.x1 + self.b2 * self.x2 - self.a1 * self.y1 - self.a2 * self.y2;

        self.x2 = self.x1;
        self.x1 = input;
        self.y2 = self.y1;
        self.y1 = output;

        output
    }
}

/// Realtime half of the equalizer node.
pub struct EqProcessor {
    eq: Equalizer,
    seen_version: u64,
    sample_rate: f32,
    filters: Vec<[Biquad; BAND_COUNT]>,
    active: [bool; BAND_COUNT],
    gain: f32,
    bypass: bool,
}

impl EqProcessor {
    /// Picks up changed settings. Never blocks: if the control side holds
    /// the lock, the old settings stay for one more callback.
    pub fn refresh(&mut self) {
        let version = self.eq.version();
        if version == self.seen_version {
            return;
        }

        let settings = match self.eq.shared.settings.try_lock() {
            Some(settings) => settings,
            None => return,
        };

        let nyquist = self.sample_rate / 2.0;
        for (index, band) in settings.bands.iter().enumerate() {
            let usable = !band.bypass
                && band.gain_db != 0.0
                && band.frequency > 0.0
                && band.frequency < nyquist
                && band.bandwidth > 0.0;
            self.active[index] = usable;
            if usable {
                for channel in self.filters.iter_mut() {
                    channel[index].configure_peaking(self.sample_rate, band);
                }
            }
        }

        self.gain = 10.0_f32.powf(settings.global_gain_db / 20.0);
        self.bypass = settings.bypass;
        self.seen_version = version;
    }

    pub fn process_sample(&mut self, channel: usize, input: f32) -> f32 {
        if self.bypass {
            return input;
        }

        let filters = match self.filters.get_mut(channel) {
            Some(filters) => filters,
            None => return input,
        };

        let mut sample = input;
        for (filter, active) in filters.iter_mut().zip(self.active.iter()) {
            if *active {
                sample = filter.process(sample);
            }
        }
        sample * self.gain
    }
}
