//! Perceptual frequency band tables shared by the analyzer and the renderer.
//!
//! The contract is the edge frequencies (20 Hz and 20 kHz); the band count
//! is derived from the center-frequency table, never hard-coded.

use serde::{Deserialize, Serialize};

/// Loudness floor used for "silent" bands, in dBFS.
pub const NOISE_FLOOR_DB: f32 = -72.0;

/// Audible range covered by every band table.
pub const FREQ_LO: f32 = 20.0;
pub const FREQ_HI: f32 = 20_000.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BandMode {
    #[default]
    HalfOctave,
    ThirdOctave,
}

/// ISO 266 preferred third-octave center frequencies, 20 Hz .. 20 kHz.
const ISO_266_CENTERS: [f32; 31] = [
    20.0, 25.0, 31.5, 40.0, 50.0, 63.0, 80.0, 100.0, 125.0, 160.0, 200.0, 250.0, 315.0, 400.0,
    500.0, 630.0, 800.0, 1000.0, 1250.0, 1600.0, 2000.0, 2500.0, 3150.0, 4000.0, 5000.0, 6300.0,
    8000.0, 10000.0, 12500.0, 16000.0, 20000.0,
];

impl BandMode {
    /// Center frequencies for this mode.  Half-octave centers step by √2
    /// from 20 Hz, with the top center clamped to 20 kHz.
    pub fn centers(&self) -> Vec<f32> {
        match self {
            BandMode::ThirdOctave => ISO_266_CENTERS.to_vec(),
            BandMode::HalfOctave => {
                let step = std::f32::consts::SQRT_2;
                let mut centers = Vec::new();
                let mut f = FREQ_LO;
                while f < FREQ_HI {
                    centers.push(f);
                    f *= step;
                }
                centers.push(FREQ_HI);
                centers
            }
        }
    }

    pub fn band_count(&self) -> usize {
        self.centers().len()
    }

    /// Fraction-of-octave width per band, used to derive half-band edges.
    fn bands_per_octave(&self) -> f32 {
        match self {
            BandMode::HalfOctave => 2.0,
            BandMode::ThirdOctave => 3.0,
        }
    }

    /// (lower, upper) half-band edges for every center frequency.
    pub fn edges(&self) -> Vec<(f32, f32)> {
        let factor = 2.0_f32.powf(1.0 / (2.0 * self.bands_per_octave()));
        self.centers()
            .iter()
            .map(|&c| (c / factor, c * factor))
            .collect()
    }
}

/// One analysis cycle's output: per-band dBFS levels and the current
/// peak-hold markers (fractions of the display range, 0..1).
///
/// `bands.len() == mode.band_count()` by construction; the renderer treats
/// frames as read-only snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpectrumFrame {
    pub mode: BandMode,
    pub bands: Vec<f32>,
    pub peaks: Vec<f32>,
    /// Unscaled overall RMS in dBFS, the honest loudness indicator that
    /// auto-gain never touches.
    pub rms_db: f32,
    pub seq: u64,
}

impl SpectrumFrame {
    /// All-silent frame, used at startup and when the capture device is gone.
    pub fn silent(mode: BandMode) -> Self {
        let n = mode.band_count();
        Self {
            mode,
            bands: vec![NOISE_FLOOR_DB; n],
            peaks: vec![0.0; n],
            rms_db: NOISE_FLOOR_DB,
            seq: 0,
        }
    }

    pub fn is_silent(&self) -> bool {
        self.bands.iter().all(|&b| b <= NOISE_FLOOR_DB + 3.0)
    }
}

/// Map FFT bins to band index ranges for a given window size and sample
/// rate.  Each band covers the bins whose frequency falls within its
/// half-band edges; a band narrower than one bin still gets the nearest bin
/// so no band is ever empty.
pub fn band_bins(mode: BandMode, fft_size: usize, sample_rate: f32) -> Vec<(usize, usize)> {
    let hz_per_bin = sample_rate / fft_size as f32;
    let nyquist_bin = fft_size / 2;
    mode.edges()
        .iter()
        .map(|&(lo, hi)| {
            let lo_bin = (lo / hz_per_bin).floor() as usize;
            let hi_bin = ((hi / hz_per_bin).ceil() as usize).min(nyquist_bin);
            let lo_bin = lo_bin.min(nyquist_bin.saturating_sub(1));
            (lo_bin, hi_bin.max(lo_bin + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_octave_count_derived_from_edges() {
        assert_eq!(BandMode::HalfOctave.band_count(), 21);
    }

    #[test]
    fn third_octave_is_iso_266() {
        assert_eq!(BandMode::ThirdOctave.band_count(), 31);
    }

    #[test]
    fn centers_span_audible_range() {
        for mode in [BandMode::HalfOctave, BandMode::ThirdOctave] {
            let centers = mode.centers();
            assert_eq!(centers[0], FREQ_LO);
            assert_eq!(*centers.last().unwrap(), FREQ_HI);
        }
    }

    #[test]
    fn centers_monotonically_increasing() {
        for mode in [BandMode::HalfOctave, BandMode::ThirdOctave] {
            let centers = mode.centers();
            for pair in centers.windows(2) {
                assert!(pair[1] > pair[0], "{:?}: {} !> {}", mode, pair[1], pair[0]);
            }
        }
    }

    #[test]
    fn band_bins_cover_range_and_are_valid() {
        let bins = band_bins(BandMode::HalfOctave, 8192, 44100.0);
        assert_eq!(bins.len(), 21);
        for &(lo, hi) in &bins {
            assert!(hi > lo, "empty bin range ({lo}, {hi})");
        }
        // first band starts near DC, last band reaches near Nyquist
        assert!(bins[0].0 <= 5);
        assert!(bins.last().unwrap().1 >= (8192 / 2) * 8 / 10);
    }

    #[test]
    fn silent_frame_holds_invariant() {
        for mode in [BandMode::HalfOctave, BandMode::ThirdOctave] {
            let f = SpectrumFrame::silent(mode);
            assert_eq!(f.bands.len(), mode.band_count());
            assert_eq!(f.peaks.len(), mode.band_count());
            assert!(f.is_silent());
        }
    }
}
