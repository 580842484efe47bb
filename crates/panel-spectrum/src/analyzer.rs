//! PCM → banded-loudness analysis.
//!
//! Per cycle: silence gate on RMS (emitting a floor-level frame and clearing
//! the ring so stale samples cannot fake low-frequency activity), DC
//! removal, Hann window, FFT, band power in
//! dBFS, auto-gain normalisation, and peak-hold markers that vanish outright
//! after the hold time.  Time is passed in, never read from a clock, so the
//! whole pipeline is testable offline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use panel_proto::bands::{band_bins, BandMode, SpectrumFrame, NOISE_FLOOR_DB};
use rustfft::{num_complex::Complex, Fft, FftPlanner};

/// 8192 samples at 44.1 kHz gives ~5.4 Hz per bin, enough to separate the
/// lowest half-octave bands.
pub const FFT_SIZE: usize = 8192;

/// Samples consumed per analysis cycle.  8192-sample window sliding by 2048
/// yields ~21 frames/s at 44.1 kHz.
pub const HOP_SIZE: usize = 2048;

/// RMS below one 16-bit LSB is silence.
const SILENCE_RMS: f32 = 1.0 / 32768.0;

/// Auto-gain reference: rises quickly to new peaks, falls very slowly so the
/// display doesn't pump on quiet passages.
const AUTO_GAIN_ATTACK: f32 = 0.3;
const AUTO_GAIN_DECAY: f32 = 0.005;
/// The reference never drops below this, so silence doesn't wind the gain up
/// to amplify noise.
const AUTO_GAIN_MIN_REF: f32 = NOISE_FLOOR_DB + 20.0;
const AUTO_GAIN_INITIAL_REF: f32 = NOISE_FLOOR_DB + 30.0;

/// How long a peak marker is held before it vanishes (not decays).
pub const PEAK_HOLD: Duration = Duration::from_millis(1500);

pub struct Analyzer {
    mode: BandMode,
    ring: VecDeque<f32>,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    bins: Vec<(usize, usize)>,
    gain_ref: f32,
    peaks: Vec<f32>,
    peak_since: Vec<Option<Instant>>,
    seq: u64,
}

impl Analyzer {
    pub fn new(mode: BandMode, sample_rate: u32) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);
        let window: Vec<f32> = (0..FFT_SIZE)
            .map(|i| {
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / FFT_SIZE as f32).cos())
            })
            .collect();
        let n = mode.band_count();
        Self {
            mode,
            ring: VecDeque::with_capacity(FFT_SIZE * 2),
            fft,
            window,
            bins: band_bins(mode, FFT_SIZE, sample_rate as f32),
            gain_ref: AUTO_GAIN_INITIAL_REF,
            peaks: vec![0.0; n],
            peak_since: vec![None; n],
            seq: 0,
        }
    }

    pub fn mode(&self) -> BandMode {
        self.mode
    }

    /// Feed captured samples; returns a frame for every full analysis cycle.
    /// Fully silent windows still yield floor-level frames, so subscribers
    /// see the bars fall instead of freezing on the last loud frame.
    pub fn feed(&mut self, samples: &[f32], now: Instant) -> Vec<SpectrumFrame> {
        self.ring.extend(samples.iter().copied());
        // bound memory if the consumer stalls
        while self.ring.len() > FFT_SIZE * 4 {
            self.ring.pop_front();
        }

        let mut frames = Vec::new();
        // the silence gate clears the ring, so this always terminates
        while self.ring.len() >= FFT_SIZE {
            frames.push(self.cycle(now));
        }
        frames
    }

    /// Emit an all-silent frame without consuming input, used by the run
    /// loop while the capture device is gone.
    pub fn silent_frame(&mut self, now: Instant) -> SpectrumFrame {
        self.ring.clear();
        self.decay_peaks(now);
        self.seq += 1;
        let mut frame = SpectrumFrame::silent(self.mode);
        frame.peaks = self.peaks.clone();
        frame.seq = self.seq;
        frame
    }

    fn cycle(&mut self, now: Instant) -> SpectrumFrame {
        let window: Vec<f32> = self.ring.iter().take(FFT_SIZE).copied().collect();

        let rms = (window.iter().map(|s| s * s).sum::<f32>() / FFT_SIZE as f32).sqrt();
        if rms < SILENCE_RMS {
            // the ring is cleared so residual content can't resurface as
            // phantom bass when audio resumes; the emitted floor frame keeps
            // held peaks aging out on screen
            return self.silent_frame(now);
        }
        self.ring.drain(..HOP_SIZE);

        // DC removal before windowing; speech/radio content otherwise leaks
        // energy into the lowest band
        let mean = window.iter().sum::<f32>() / FFT_SIZE as f32;

        let mut buf: Vec<Complex<f32>> = window
            .iter()
            .zip(&self.window)
            .map(|(&s, &w)| Complex::new((s - mean) * w, 0.0))
            .collect();
        self.fft.process(&mut buf);

        // Hann coherent gain is 0.5; normalise so a full-scale sine lands at
        // ~0 dBFS in its band
        let norm = 4.0 / FFT_SIZE as f32;

        let bands_db: Vec<f32> = self
            .bins
            .iter()
            .map(|&(lo, hi)| {
                let power: f32 = buf[lo..hi]
                    .iter()
                    .map(|c| {
                        let amp = c.norm() * norm;
                        amp * amp
                    })
                    .sum();
                (10.0 * power.max(1e-12).log10()).max(NOISE_FLOOR_DB)
            })
            .collect();

        // auto-gain reference follows the loudest band
        let current_max = bands_db.iter().copied().fold(NOISE_FLOOR_DB, f32::max);
        let alpha = if current_max > self.gain_ref {
            AUTO_GAIN_ATTACK
        } else {
            AUTO_GAIN_DECAY
        };
        self.gain_ref += (current_max - self.gain_ref) * alpha;
        self.gain_ref = self.gain_ref.max(AUTO_GAIN_MIN_REF);
        let gain_range = (self.gain_ref - NOISE_FLOOR_DB).max(1.0);

        // rescale so the current reference maps to 0 dBFS: shape stays
        // visible at any playback volume, rms_db stays honest
        let scaled: Vec<f32> = bands_db
            .iter()
            .map(|&db| {
                let fraction = ((db - NOISE_FLOOR_DB) / gain_range).clamp(0.0, 1.0);
                NOISE_FLOOR_DB + fraction * -NOISE_FLOOR_DB
            })
            .collect();

        for (i, &db) in scaled.iter().enumerate() {
            let fraction = (db - NOISE_FLOOR_DB) / -NOISE_FLOOR_DB;
            if fraction >= self.peaks[i] {
                self.peaks[i] = fraction;
                self.peak_since[i] = Some(now);
            }
        }
        self.decay_peaks(now);

        self.seq += 1;
        SpectrumFrame {
            mode: self.mode,
            bands: scaled,
            peaks: self.peaks.clone(),
            rms_db: 20.0 * rms.max(1e-6).log10(),
            seq: self.seq,
        }
    }

    /// Expired peaks vanish outright rather than sliding down.
    fn decay_peaks(&mut self, now: Instant) {
        for (peak, since) in self.peaks.iter_mut().zip(&mut self.peak_since) {
            if let Some(t) = since {
                if now.duration_since(*t) > PEAK_HOLD {
                    *peak = 0.0;
                    *since = None;
                }
            }
        }
    }
}

/// Double-buffered frame slot: writers fill the inactive buffer and swap the
/// index under the lock, so a reader never observes a half-written frame.
/// The lock also serialises swaps against a band-mode rebuild.
pub struct FrameSlot {
    buffers: [Mutex<Arc<SpectrumFrame>>; 2],
    active: AtomicUsize,
}

impl FrameSlot {
    pub fn new(mode: BandMode) -> Self {
        let initial = Arc::new(SpectrumFrame::silent(mode));
        Self {
            buffers: [
                Mutex::new(initial.clone()),
                Mutex::new(initial),
            ],
            active: AtomicUsize::new(0),
        }
    }

    pub fn publish(&self, frame: SpectrumFrame) {
        let inactive = 1 - self.active.load(Ordering::Acquire);
        {
            let mut slot = self.buffers[inactive].lock().unwrap_or_else(|e| e.into_inner());
            *slot = Arc::new(frame);
        }
        self.active.store(inactive, Ordering::Release);
    }

    pub fn latest(&self) -> Arc<SpectrumFrame> {
        let active = self.active.load(Ordering::Acquire);
        self.buffers[active]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 44100;

    fn sine(freq: f32, amplitude: f32, samples: usize) -> Vec<f32> {
        (0..samples)
            .map(|i| {
                amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / RATE as f32).sin()
            })
            .collect()
    }

    fn band_index_for(mode: BandMode, freq: f32) -> usize {
        mode.edges()
            .iter()
            .position(|&(lo, hi)| freq >= lo && freq < hi)
            .unwrap()
    }

    #[test]
    fn silence_emits_floor_frames_and_clears_residual_content() {
        let mut a = Analyzer::new(BandMode::HalfOctave, RATE);
        let now = Instant::now();

        a.feed(&sine(1000.0, 0.8, FFT_SIZE * 2), now);

        // all-zero input longer than one window must keep frames flowing,
        // landing at the floor once the residual sine has slid out
        let frames = a.feed(&vec![0.0; FFT_SIZE * 2], now);
        assert!(!frames.is_empty(), "silence must still emit frames");
        let last = frames.last().unwrap();
        assert!(
            last.bands.iter().all(|&b| b == NOISE_FLOOR_DB),
            "fully silent window must sit at the floor"
        );

        // the gate cleared the ring: further zeros yield only floor frames,
        // never phantom bass from stale samples
        let again = a.feed(&vec![0.0; FFT_SIZE], now);
        assert!(!again.is_empty());
        assert!(again.iter().all(|f| f.is_silent()));

        // held peaks survive the gate until the hold expires
        let target = band_index_for(BandMode::HalfOctave, 1000.0);
        assert!(last.peaks[target] > 0.1);
        let expired = a.silent_frame(now + PEAK_HOLD + Duration::from_millis(100));
        assert_eq!(expired.peaks[target], 0.0);
    }

    #[test]
    fn sine_elevates_its_band_above_neighbors() {
        let mut a = Analyzer::new(BandMode::HalfOctave, RATE);
        let frames = a.feed(&sine(1000.0, 0.5, FFT_SIZE * 2), Instant::now());
        let frame = frames.last().expect("expected at least one frame");

        let target = band_index_for(BandMode::HalfOctave, 1000.0);
        let target_level = frame.bands[target];
        // well above all bands more than one slot away
        for (i, &level) in frame.bands.iter().enumerate() {
            if i.abs_diff(target) > 1 {
                assert!(
                    target_level > level + 10.0,
                    "band {} ({}) not well below target ({})",
                    i,
                    level,
                    target_level
                );
            }
        }
    }

    #[test]
    fn dc_offset_does_not_excite_the_lowest_band() {
        let mut a = Analyzer::new(BandMode::HalfOctave, RATE);
        // pure DC at half scale: with DC removal this is near-silence in
        // every band (but above the RMS silence gate)
        let dc = vec![0.5f32; FFT_SIZE * 2];
        let frames = a.feed(&dc, Instant::now());
        let frame = frames.last().expect("dc input should still produce frames");
        assert!(
            frame.bands[0] < NOISE_FLOOR_DB + 15.0,
            "lowest band {} should stay near the floor",
            frame.bands[0]
        );
    }

    #[test]
    fn auto_gain_preserves_spectrum_shape() {
        // bin-aligned tone so leakage stays inside the target band at
        // either amplitude
        let freq = 186.0 * RATE as f32 / FFT_SIZE as f32;
        let run = |amplitude: f32| {
            let mut a = Analyzer::new(BandMode::HalfOctave, RATE);
            a.feed(&sine(freq, amplitude, FFT_SIZE * 4), Instant::now())
                .pop()
                .unwrap()
        };
        let loud_frame = run(0.8);
        let quiet_frame = run(0.05);

        // the published shape matches band for band regardless of level
        for (i, (l, q)) in loud_frame.bands.iter().zip(&quiet_frame.bands).enumerate() {
            assert!(
                (l - q).abs() < 3.0,
                "band {} diverged: loud {} vs quiet {}",
                i,
                l,
                q
            );
        }
        let target = band_index_for(BandMode::HalfOctave, freq);
        assert!(loud_frame.bands[target] > NOISE_FLOOR_DB + 50.0);

        // the honest indicator still reflects actual loudness
        assert!(loud_frame.rms_db > quiet_frame.rms_db + 10.0);
    }

    #[test]
    fn peaks_vanish_after_hold_not_gradually() {
        let mut a = Analyzer::new(BandMode::HalfOctave, RATE);
        let t0 = Instant::now();
        let frames = a.feed(&sine(1000.0, 0.5, FFT_SIZE * 2), t0);
        let target = band_index_for(BandMode::HalfOctave, 1000.0);
        let held = frames.last().unwrap().peaks[target];
        assert!(held > 0.1);

        // before the hold expires the marker is unchanged
        let before = a.silent_frame(t0 + Duration::from_millis(1000));
        assert_eq!(before.peaks[target], held);

        // after the hold it is gone outright
        let after = a.silent_frame(t0 + Duration::from_millis(1600));
        assert_eq!(after.peaks[target], 0.0);
    }

    #[test]
    fn frame_band_length_matches_mode() {
        for mode in [BandMode::HalfOctave, BandMode::ThirdOctave] {
            let mut a = Analyzer::new(mode, RATE);
            let frames = a.feed(&sine(440.0, 0.3, FFT_SIZE * 2), Instant::now());
            let frame = frames.last().unwrap();
            assert_eq!(frame.bands.len(), mode.band_count());
            assert_eq!(frame.peaks.len(), mode.band_count());
        }
    }

    #[test]
    fn slot_always_yields_complete_frames() {
        let slot = FrameSlot::new(BandMode::HalfOctave);
        assert!(slot.latest().is_silent());

        let mut frame = SpectrumFrame::silent(BandMode::HalfOctave);
        frame.seq = 42;
        frame.bands[3] = -10.0;
        slot.publish(frame);

        let read = slot.latest();
        assert_eq!(read.seq, 42);
        assert_eq!(read.bands.len(), BandMode::HalfOctave.band_count());
        assert_eq!(read.bands[3], -10.0);
    }

    #[test]
    fn sequence_numbers_are_monotonic() {
        let mut a = Analyzer::new(BandMode::HalfOctave, RATE);
        let frames = a.feed(&sine(500.0, 0.4, FFT_SIZE * 3), Instant::now());
        for pair in frames.windows(2) {
            assert!(pair[1].seq > pair[0].seq);
        }
    }
}
