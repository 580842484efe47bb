//! Frame composition: gradient background, artwork, track text, format
//! badge, volume knob, progress bar and the spectrum bars, painted into an
//! RGB canvas and pushed to a FrameSink region by region.
//!
//! The renderer is aggressively lazy: each region carries its own dirty
//! test, and a frame where nothing changed performs zero sink writes.

use std::time::{Duration, Instant};

use anyhow::Result;
use embedded_graphics::mono_font::ascii::{FONT_10X20, FONT_6X13, FONT_9X15_BOLD};
use embedded_graphics::mono_font::{MonoFont, MonoTextStyle};
use embedded_graphics::pixelcolor::Rgb888;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::{Circle, Line, PrimitiveStyle};
use embedded_graphics::text::Text;
use panel_proto::bands::{SpectrumFrame, NOISE_FLOOR_DB};
use panel_proto::track::TrackState;

use crate::framebuffer::FrameSink;

/// Display smoothing: bars rise fast and fall slower.
pub const ATTACK_COEFF: f32 = 0.6;
pub const DECAY_COEFF: f32 = 0.35;

/// A spectrum frame older than this means the analyzer is gone.
pub const SPECTRUM_STALE: Duration = Duration::from_secs(2);

const BG_TOP: (u8, u8, u8) = (10, 10, 10);
const BG_BOTTOM: (u8, u8, u8) = (22, 33, 62);
const TEXT_COLOR: (u8, u8, u8) = (255, 255, 255);
const ARTIST_COLOR: (u8, u8, u8) = (179, 179, 179);
const ALBUM_COLOR: (u8, u8, u8) = (153, 153, 153);
const DIM_COLOR: (u8, u8, u8) = (85, 85, 85);
const PANEL_BG: (u8, u8, u8) = (17, 17, 17);

const BADGE_LOSSLESS: (u8, u8, u8) = (100, 200, 120);
const BADGE_HIRES: (u8, u8, u8) = (120, 160, 255);
const BADGE_LOSSY: (u8, u8, u8) = (170, 140, 100);

const LOSSLESS_CODECS: [&str; 7] = ["FLAC", "WAV", "AIFF", "APE", "WV", "PCM", "DSD"];

/// Presentation mode, selected per frame from track + spectrum liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Standby,
    PlayingQuiet,
    PlayingSpectrum,
}

impl Mode {
    /// Adaptive target rates: full rate only when bars are moving.
    pub fn frame_interval(&self) -> Duration {
        match self {
            Mode::PlayingSpectrum => Duration::from_millis(50), // 20 fps
            Mode::PlayingQuiet => Duration::from_millis(200),   // 5 fps
            Mode::Standby => Duration::from_secs(1),            // 1 fps
        }
    }
}

pub fn select_mode(track: &TrackState, frame: &SpectrumFrame, frame_age: Duration) -> Mode {
    if !track.is_playing() || !track.has_track() {
        return Mode::Standby;
    }
    if frame_age < SPECTRUM_STALE && !frame.is_silent() {
        Mode::PlayingSpectrum
    } else {
        Mode::PlayingQuiet
    }
}

/// Smooth sub-second playback position: seeded from the last server report,
/// advanced by a local monotonic clock between reports.
#[derive(Debug, Clone, Copy)]
pub struct PositionClock {
    position: f64,
    duration: f64,
    playing: bool,
    seeded_at: Instant,
}

impl PositionClock {
    pub fn new(now: Instant) -> Self {
        Self {
            position: 0.0,
            duration: 0.0,
            playing: false,
            seeded_at: now,
        }
    }

    pub fn seed(&mut self, track: &TrackState, now: Instant) {
        self.position = track.position;
        self.duration = track.duration;
        self.playing = track.is_playing();
        self.seeded_at = now;
    }

    pub fn current(&self, now: Instant) -> f64 {
        if !self.playing {
            return self.position;
        }
        let advanced = self.position + now.duration_since(self.seeded_at).as_secs_f64();
        if self.duration > 0.0 {
            advanced.min(self.duration)
        } else {
            advanced
        }
    }
}

/// "3:07", or "1:02:45" past the hour.
pub fn format_time(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{}:{:02}", m, s)
    }
}

/// Badge text, e.g. "FLAC 96kHz 24bit" or "MP3 320kbps".
pub fn format_audio_badge(track: &TrackState) -> String {
    if track.codec.is_empty() {
        return String::new();
    }
    let lossless = LOSSLESS_CODECS.contains(&track.codec.as_str());

    let mut parts = vec![track.codec.clone()];
    if lossless && track.sample_rate > 0 {
        parts.push(format_rate(track.sample_rate));
        if track.bit_depth > 0 {
            parts.push(format!("{}bit", track.bit_depth));
        }
    } else if track.bitrate > 0 {
        parts.push(format!("{}kbps", track.bitrate));
    } else if track.sample_rate > 0 {
        parts.push(format_rate(track.sample_rate));
    }
    parts.join(" ")
}

fn format_rate(rate: u32) -> String {
    if rate < 1000 {
        return format!("{}Hz", rate);
    }
    if rate % 1000 == 0 {
        format!("{}kHz", rate / 1000)
    } else {
        format!("{:.1}kHz", rate as f32 / 1000.0)
    }
}

/// Quality tier color: hi-res blue, lossless green, lossy amber.
pub fn badge_color(track: &TrackState) -> (u8, u8, u8) {
    let lossless = LOSSLESS_CODECS.contains(&track.codec.as_str());
    if lossless && track.sample_rate > 48_000 {
        BADGE_HIRES
    } else if lossless {
        BADGE_LOSSLESS
    } else {
        BADGE_LOSSY
    }
}

/// Bar hue sweeps 0..300 degrees across the bands (red through violet).
pub fn rainbow_color(index: usize, total: usize, s: f32, v: f32) -> (u8, u8, u8) {
    let hue = index as f32 / total as f32 * (300.0 / 360.0);
    hsv_to_rgb(hue, s, v)
}

pub fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (u8, u8, u8) {
    let h = (h.fract() + 1.0).fract() * 6.0;
    let i = h.floor() as i32;
    let f = h - i as f32;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    let (r, g, b) = match i.rem_euclid(6) {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };
    ((r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8)
}

fn lerp_color(a: (u8, u8, u8), b: (u8, u8, u8), t: f32) -> (u8, u8, u8) {
    let mix = |x: u8, y: u8| (x as f32 + (y as f32 - x as f32) * t) as u8;
    (mix(a.0, b.0), mix(a.1, b.1), mix(a.2, b.2))
}

/// RGB888 render surface, also an embedded-graphics draw target for text
/// and primitives.
pub struct Canvas {
    pub width: u32,
    pub height: u32,
    pixels: Vec<u8>,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; (width * height * 3) as usize],
        }
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, color: (u8, u8, u8)) {
        if x >= self.width || y >= self.height {
            return;
        }
        let i = ((y * self.width + x) * 3) as usize;
        self.pixels[i] = color.0;
        self.pixels[i + 1] = color.1;
        self.pixels[i + 2] = color.2;
    }

    pub fn fill_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: (u8, u8, u8)) {
        for yy in y..(y + h).min(self.height) {
            for xx in x..(x + w).min(self.width) {
                self.set_pixel(xx, yy, color);
            }
        }
    }

    pub fn vertical_gradient(&mut self, top: (u8, u8, u8), bottom: (u8, u8, u8)) {
        for y in 0..self.height {
            let t = y as f32 / self.height as f32;
            let color = lerp_color(top, bottom, t);
            for x in 0..self.width {
                self.set_pixel(x, y, color);
            }
        }
    }

    /// Copy a sub-rectangle out as packed RGB rows.
    pub fn region(&self, x: u32, y: u32, w: u32, h: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity((w * h * 3) as usize);
        for yy in y..y + h {
            let start = ((yy * self.width + x) * 3) as usize;
            out.extend_from_slice(&self.pixels[start..start + (w * 3) as usize]);
        }
        out
    }

    pub fn blit_rgb(&mut self, x: u32, y: u32, w: u32, h: u32, rgb: &[u8]) {
        for yy in 0..h {
            for xx in 0..w {
                let i = ((yy * w + xx) * 3) as usize;
                self.set_pixel(x + xx, y + yy, (rgb[i], rgb[i + 1], rgb[i + 2]));
            }
        }
    }
}

impl OriginDimensions for Canvas {
    fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

impl DrawTarget for Canvas {
    type Color = Rgb888;
    type Error = core::convert::Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels {
            if point.x >= 0 && point.y >= 0 {
                self.set_pixel(point.x as u32, point.y as u32, (color.r(), color.g(), color.b()));
            }
        }
        Ok(())
    }
}

/// Fixed geometry, computed once per panel size and band count.
#[derive(Debug, Clone)]
pub struct Layout {
    pub art_x: u32,
    pub art_y: u32,
    pub art_size: u32,
    pub info_x: u32,
    pub info_y: u32,
    pub info_w: u32,
    pub info_h: u32,
    pub spec_x: u32,
    pub spec_y: u32,
    pub spec_w: u32,
    pub spec_h: u32,
    pub pad: u32,
    pub bar_w: u32,
    pub bar_gap: u32,
    pub bar_area_h: u32,
    pub progress_y: u32,
    pub progress_h: u32,
}

impl Layout {
    pub fn compute(width: u32, height: u32, bands: usize) -> Self {
        let outer_gap = (width.min(height) as f32 * 0.025) as u32;
        let container_w = (width as f32 * 0.92) as u32;
        let container_h = (height as f32 * 0.85) as u32;
        let start_x = (width - container_w) / 2;
        let start_y = (height - container_h) / 2;

        let art_size = ((container_w as f32 * 0.46) as u32).min(container_h);
        let art_x = start_x;
        let art_y = start_y + (container_h - art_size) / 2;

        let right_x = art_x + art_size + outer_gap;
        let right_w = container_w - art_size - outer_gap;
        let right_y = art_y;
        let right_h = art_size;

        let spec_h = (right_h as f32 * 0.55) as u32;
        let spec_y = right_y + right_h - spec_h;
        let info_h = right_h - spec_h - outer_gap;

        let pad = (right_w as f32 * 0.06) as u32;
        let bar_area_w = right_w - pad * 2;
        let bar_area_h = spec_h - pad * 2;
        let bar_gap = ((bar_area_w as f32 * 0.008) as u32).max(1);
        let bar_w = ((bar_area_w - bar_gap * (bands as u32 - 1)) / bands as u32).max(1);

        let progress_h = (height / 120).max(3);
        let progress_y = info_h.saturating_sub(progress_h * 3);

        Self {
            art_x,
            art_y,
            art_size,
            info_x: right_x,
            info_y: right_y,
            info_w: right_w,
            info_h,
            spec_x: right_x,
            spec_y,
            spec_w: right_w,
            spec_h,
            pad,
            bar_w,
            bar_gap,
            bar_area_h,
            progress_y,
            progress_h,
        }
    }
}

/// What the last paint looked like, for the per-region dirty tests.
#[derive(Default)]
struct Painted {
    track_rev: Option<u64>,
    art_rev: Option<u64>,
    progress_px: Option<u32>,
    progress_second: Option<u64>,
    spectrum_idle: bool,
    mode: Option<Mode>,
}

pub struct Renderer<S: FrameSink> {
    sink: S,
    canvas: Canvas,
    layout: Layout,
    bar_colors: Vec<(u8, u8, u8)>,
    peak_colors: Vec<(u8, u8, u8)>,
    display_bands: Vec<f32>,
    spectrum_bg: Vec<u8>,
    artwork: Option<image::RgbImage>,
    painted: Painted,
}

impl<S: FrameSink> Renderer<S> {
    pub fn new(sink: S, bands: usize) -> Self {
        let geometry = sink.geometry();
        let (w, h) = crate::framebuffer::render_size(&geometry);
        let canvas = Canvas::new(w, h);
        let layout = Layout::compute(w, h, bands);
        let bar_colors = (0..bands).map(|i| rainbow_color(i, bands, 0.85, 0.85)).collect();
        let peak_colors = (0..bands).map(|i| rainbow_color(i, bands, 0.95, 0.95)).collect();
        Self {
            sink,
            canvas,
            layout,
            bar_colors,
            peak_colors,
            display_bands: vec![0.0; bands],
            spectrum_bg: Vec::new(),
            artwork: None,
            painted: Painted::default(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Replace the artwork image (already decoded); None restores the
    /// placeholder.  Forces a base repaint on the next cycle.
    pub fn set_artwork(&mut self, image: Option<image::DynamicImage>) {
        self.artwork = image.map(|img| {
            img.resize_exact(
                self.layout.art_size,
                self.layout.art_size,
                image::imageops::FilterType::Triangle,
            )
            .to_rgb8()
        });
        self.painted.art_rev = None;
    }

    /// One render cycle.  Only dirty regions touch the sink.
    pub fn render(
        &mut self,
        track: &TrackState,
        frame: &SpectrumFrame,
        frame_age: Duration,
        position: f64,
    ) -> Result<Mode> {
        let mode = select_mode(track, frame, frame_age);

        let base_dirty = self.painted.track_rev != Some(track.rev)
            || self.painted.art_rev != Some(track.art_rev)
            || self.painted.mode != Some(mode);
        if base_dirty {
            self.paint_base(track, mode)?;
            self.painted.track_rev = Some(track.rev);
            self.painted.art_rev = Some(track.art_rev);
            self.painted.mode = Some(mode);
            self.painted.progress_px = None;
            self.painted.progress_second = None;
            self.painted.spectrum_idle = false;
        }

        if mode != Mode::Standby && track.duration > 0.0 {
            self.paint_progress(track, position)?;
        }

        if mode == Mode::PlayingSpectrum || !self.painted.spectrum_idle {
            self.paint_spectrum(frame, mode)?;
        }

        Ok(mode)
    }

    /// Full-frame repaint: gradient, artwork, title/artist/album, badge,
    /// volume knob.  The spectrum background is captured afterwards so bar
    /// repaints can restore it cheaply.
    fn paint_base(&mut self, track: &TrackState, mode: Mode) -> Result<()> {
        let l = self.layout.clone();
        self.canvas.vertical_gradient(BG_TOP, BG_BOTTOM);

        // artwork or placeholder panel
        match &self.artwork {
            Some(art) => {
                let rgb = art.as_raw().clone();
                self.canvas.blit_rgb(l.art_x, l.art_y, l.art_size, l.art_size, &rgb);
            }
            None => {
                self.canvas.fill_rect(l.art_x, l.art_y, l.art_size, l.art_size, PANEL_BG);
                let note = Text::new(
                    "[no artwork]",
                    Point::new(
                        (l.art_x + l.art_size / 2 - 36) as i32,
                        (l.art_y + l.art_size / 2) as i32,
                    ),
                    MonoTextStyle::new(&FONT_6X13, rgb(DIM_COLOR)),
                );
                let _ = note.draw(&mut self.canvas);
            }
        }

        if mode == Mode::Standby && !track.has_track() {
            self.draw_text("Nothing playing", l.info_x, l.info_y + 24, &FONT_10X20, DIM_COLOR);
        } else {
            let mut y = l.info_y + 24;
            self.draw_text(&track.title, l.info_x, y, &FONT_10X20, TEXT_COLOR);
            y += 28;
            self.draw_text(&track.artist, l.info_x, y, &FONT_9X15_BOLD, ARTIST_COLOR);
            y += 22;
            if !track.album.is_empty() {
                self.draw_text(&track.album, l.info_x, y, &FONT_6X13, ALBUM_COLOR);
                y += 18;
            }

            let badge = format_audio_badge(track);
            if !badge.is_empty() {
                self.draw_text(&badge, l.info_x, y, &FONT_6X13, badge_color(track));
            }
        }

        self.paint_volume_knob(track);

        // capture the pristine spectrum background before bars draw over it
        self.spectrum_bg = self.canvas.region(l.spec_x, l.spec_y, l.spec_w, l.spec_h);

        let full = self.canvas.region(0, 0, self.canvas.width, self.canvas.height);
        self.sink.write_region(0, 0, self.canvas.width, &full)?;
        Ok(())
    }

    fn draw_text(&mut self, text: &str, x: u32, y: u32, font: &'static MonoFont, color: (u8, u8, u8)) {
        if text.is_empty() {
            return;
        }
        let style = MonoTextStyle::new(font, rgb(color));
        let _ = Text::new(text, Point::new(x as i32, y as i32), style).draw(&mut self.canvas);
    }

    /// Small rotary-style volume indicator in the top-right corner.
    fn paint_volume_knob(&mut self, track: &TrackState) {
        let l = &self.layout;
        let d = (l.info_w / 10).clamp(18, 48);
        let cx = l.info_x + l.info_w - d;
        let cy = l.info_y + d / 2;

        let ring = if track.muted { DIM_COLOR } else { TEXT_COLOR };
        let _ = Circle::with_center(Point::new(cx as i32, cy as i32), d)
            .into_styled(PrimitiveStyle::with_stroke(rgb(ring), 2))
            .draw(&mut self.canvas);

        if !track.muted {
            // pointer sweeps 225 degrees from 7 o'clock
            let angle = (135.0 + track.volume_percent as f32 / 100.0 * 270.0).to_radians();
            let r = d as f32 / 2.0 - 2.0;
            let end = Point::new(
                (cx as f32 + angle.cos() * r) as i32,
                (cy as f32 + angle.sin() * r) as i32,
            );
            let _ = Line::new(Point::new(cx as i32, cy as i32), end)
                .into_styled(PrimitiveStyle::with_stroke(rgb(ring), 2))
                .draw(&mut self.canvas);
        }
    }

    /// Progress bar region; repainted when the filled width moves by a
    /// visible pixel or the time label crosses a whole second.  The second
    /// test matters on long tracks, where the bar moves far slower than the
    /// clock.
    fn paint_progress(&mut self, track: &TrackState, position: f64) -> Result<()> {
        let l = self.layout.clone();
        let bar_w = l.info_w - l.pad * 2;
        let filled = ((position / track.duration).clamp(0.0, 1.0) * bar_w as f64) as u32;
        let second = position.max(0.0) as u64;
        if self.painted.progress_px == Some(filled) && self.painted.progress_second == Some(second)
        {
            return Ok(());
        }
        self.painted.progress_px = Some(filled);
        self.painted.progress_second = Some(second);

        let x = l.info_x + l.pad;
        let y = l.info_y + l.progress_y;
        self.canvas.fill_rect(x, y, bar_w, l.progress_h, PANEL_BG);
        if filled > 0 {
            self.canvas.fill_rect(x, y, filled, l.progress_h, TEXT_COLOR);
        }

        // time label below the bar
        let label = format!(
            "{} / {}",
            format_time(position),
            format_time(track.duration)
        );
        let label_y = y + l.progress_h + 2;
        let label_h = 16;
        // restore the gradient under the label before drawing fresh digits
        for yy in label_y..label_y + label_h {
            let t = yy as f32 / self.canvas.height as f32;
            let c = lerp_color(BG_TOP, BG_BOTTOM, t);
            for xx in x..x + bar_w {
                self.canvas.set_pixel(xx, yy, c);
            }
        }
        self.draw_text(&label, x, label_y + 12, &FONT_6X13, DIM_COLOR);

        let region = self
            .canvas
            .region(x, y, bar_w, l.progress_h + label_h + 2);
        self.sink.write_region(x, y, bar_w, &region)?;
        Ok(())
    }

    /// Bars + peak markers over the cached background.  In quiet/standby
    /// modes the bars decay to zero and then one final idle paint happens,
    /// after which the region is skipped entirely.
    fn paint_spectrum(&mut self, frame: &SpectrumFrame, mode: Mode) -> Result<()> {
        let l = self.layout.clone();
        if self.spectrum_bg.is_empty() {
            return Ok(());
        }

        let n = self.display_bands.len().min(frame.bands.len());
        for i in 0..n {
            let target = ((frame.bands[i] - NOISE_FLOOR_DB) / -NOISE_FLOOR_DB).clamp(0.0, 1.0);
            let current = self.display_bands[i];
            let alpha = if target > current { ATTACK_COEFF } else { DECAY_COEFF };
            self.display_bands[i] = current + (target - current) * alpha;
        }

        let idle = mode != Mode::PlayingSpectrum
            && self.display_bands.iter().all(|&b| b < 0.01)
            && frame.peaks.iter().all(|&p| p < 0.01);
        if idle && self.painted.spectrum_idle {
            return Ok(());
        }

        // restore the pristine background, then draw bars over it
        self.canvas
            .blit_rgb(l.spec_x, l.spec_y, l.spec_w, l.spec_h, &self.spectrum_bg.clone());

        let base_y = l.spec_y + l.spec_h - l.pad;
        let marker_h = (l.bar_w / 12).max(2);
        for i in 0..n {
            let x = l.spec_x + l.pad + i as u32 * (l.bar_w + l.bar_gap);
            let fraction = self.display_bands[i];
            if fraction >= 0.01 {
                let h = (fraction * l.bar_area_h as f32) as u32;
                if h > 0 {
                    self.canvas
                        .fill_rect(x, base_y - h, l.bar_w, h, self.bar_colors[i]);
                }
            }
            let peak = frame.peaks.get(i).copied().unwrap_or(0.0);
            if peak > 0.01 {
                let peak_y = base_y - (peak * l.bar_area_h as f32) as u32;
                self.canvas
                    .fill_rect(x, peak_y.saturating_sub(marker_h), l.bar_w, marker_h, self.peak_colors[i]);
            }
        }

        let region = self.canvas.region(l.spec_x, l.spec_y, l.spec_w, l.spec_h);
        self.sink.write_region(l.spec_x, l.spec_y, l.spec_w, &region)?;
        self.painted.spectrum_idle = idle;
        Ok(())
    }
}

fn rgb(c: (u8, u8, u8)) -> Rgb888 {
    Rgb888::new(c.0, c.1, c.2)
}
