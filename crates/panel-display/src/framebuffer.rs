//! Framebuffer access: sysfs geometry, mmap writes, and pixel packing for
//! the two formats Linux fbdev actually hands us (RGB565 and BGRA32).
//!
//! Rendering happens on an internal RGB canvas capped at 1920x1080; the sink
//! scales to the physical panel on write so a 4K framebuffer cannot balloon
//! the render buffers.  Every write is bounds-checked against the mapped
//! size.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{bail, Context, Result};
use memmap2::MmapMut;
use tracing::{info, warn};

/// Internal render resolution cap.
pub const MAX_RENDER_WIDTH: u32 = 1920;
pub const MAX_RENDER_HEIGHT: u32 = 1080;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb565,
    Bgra32,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb565 => 2,
            PixelFormat::Bgra32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FbGeometry {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub stride: usize,
}

/// Read panel geometry from the fbdev sysfs entries; fall back to the
/// configured resolution when they are unreadable (e.g. tests, containers).
pub fn read_geometry(fb_device: &Path, fallback: &str) -> FbGeometry {
    let name = fb_device
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("fb0");
    let sysfs = format!("/sys/class/graphics/{}", name);

    let parsed = (|| -> Option<FbGeometry> {
        let size = std::fs::read_to_string(format!("{}/virtual_size", sysfs)).ok()?;
        let (w, h) = size.trim().split_once(',')?;
        let width: u32 = w.trim().parse().ok()?;
        let height: u32 = h.trim().parse().ok()?;
        let bpp: u32 = std::fs::read_to_string(format!("{}/bits_per_pixel", sysfs))
            .ok()?
            .trim()
            .parse()
            .ok()?;
        let stride: usize = std::fs::read_to_string(format!("{}/stride", sysfs))
            .ok()?
            .trim()
            .parse()
            .ok()?;
        let format = match bpp {
            16 => PixelFormat::Rgb565,
            32 => PixelFormat::Bgra32,
            _ => return None,
        };
        Some(FbGeometry {
            width,
            height,
            format,
            stride,
        })
    })();

    parsed.unwrap_or_else(|| {
        let (width, height) = parse_resolution(fallback).unwrap_or((1024, 600));
        warn!(
            "framebuffer sysfs unreadable, assuming {}x{} BGRA32",
            width, height
        );
        FbGeometry {
            width,
            height,
            format: PixelFormat::Bgra32,
            stride: width as usize * 4,
        }
    })
}

pub fn parse_resolution(s: &str) -> Option<(u32, u32)> {
    let (w, h) = s.split_once(['x', 'X'])?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// Render-canvas size for a panel: the panel size, capped.
pub fn render_size(geometry: &FbGeometry) -> (u32, u32) {
    (
        geometry.width.min(MAX_RENDER_WIDTH),
        geometry.height.min(MAX_RENDER_HEIGHT),
    )
}

/// Pack an RGB pixel into RGB565.  Widening casts happen before the shifts
/// so channel bits are never truncated mid-expression.
pub fn pack_rgb565(r: u8, g: u8, b: u8) -> u16 {
    (u16::from(r >> 3) << 11) | (u16::from(g >> 2) << 5) | u16::from(b >> 3)
}

pub fn pack_bgra(r: u8, g: u8, b: u8) -> [u8; 4] {
    [b, g, r, 0xFF]
}

/// Convert one RGB888 row into native framebuffer bytes.
pub fn convert_row(rgb: &[u8], format: PixelFormat, out: &mut Vec<u8>) {
    out.clear();
    match format {
        PixelFormat::Rgb565 => {
            for px in rgb.chunks_exact(3) {
                out.extend_from_slice(&pack_rgb565(px[0], px[1], px[2]).to_le_bytes());
            }
        }
        PixelFormat::Bgra32 => {
            for px in rgb.chunks_exact(3) {
                out.extend_from_slice(&pack_bgra(px[0], px[1], px[2]));
            }
        }
    }
}

/// Destination for rendered pixels.  The real device implementation mmaps
/// fbdev; tests use a recording sink.
pub trait FrameSink {
    fn geometry(&self) -> FbGeometry;

    /// Write a `width`-pixel-wide RGB888 region whose top-left corner sits
    /// at (x, y) in render coordinates.  Implementations scale to the panel
    /// and must reject out-of-bounds writes.
    fn write_region(&mut self, x: u32, y: u32, width: u32, rgb: &[u8]) -> Result<()>;

    /// Number of writes performed, for skip-if-clean accounting.
    fn writes(&self) -> u64;
}

pub struct Framebuffer {
    geometry: FbGeometry,
    render_w: u32,
    render_h: u32,
    map: MmapMut,
    writes: u64,
}

impl Framebuffer {
    pub fn open(fb_device: &Path, fallback: &str) -> Result<Self> {
        let geometry = read_geometry(fb_device, fallback);
        info!(
            "framebuffer {:?}: {}x{} {:?} stride={}",
            fb_device, geometry.width, geometry.height, geometry.format, geometry.stride
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(fb_device)
            .with_context(|| format!("opening {:?}", fb_device))?;
        let size = geometry.stride * geometry.height as usize;
        let map = unsafe { MmapMut::map_mut(&file) }.context("mapping framebuffer")?;
        if map.len() < size {
            bail!(
                "framebuffer map is {} bytes, geometry needs {}",
                map.len(),
                size
            );
        }

        let (render_w, render_h) = render_size(&geometry);
        Ok(Self {
            geometry,
            render_w,
            render_h,
            map,
            writes: 0,
        })
    }
}

impl FrameSink for Framebuffer {
    fn geometry(&self) -> FbGeometry {
        self.geometry
    }

    fn write_region(&mut self, x: u32, y: u32, width: u32, rgb: &[u8]) -> Result<()> {
        let height = region_height(width, rgb)?;
        if x + width > self.render_w || y + height > self.render_h {
            bail!(
                "region {}x{} at ({}, {}) exceeds render bounds {}x{}",
                width,
                height,
                x,
                y,
                self.render_w,
                self.render_h
            );
        }

        let bpp = self.geometry.format.bytes_per_pixel();
        let scale_x = self.geometry.width as f32 / self.render_w as f32;
        let scale_y = self.geometry.height as f32 / self.render_h as f32;

        // nearest-neighbor scale per physical row covered by the region
        let phys_x = (x as f32 * scale_x) as usize;
        let phys_y0 = (y as f32 * scale_y) as usize;
        let phys_y1 = (((y + height) as f32 * scale_y) as usize).min(self.geometry.height as usize);
        let phys_w = ((width as f32 * scale_x) as usize).min(self.geometry.width as usize - phys_x);

        let mut native_row: Vec<u8> = Vec::with_capacity(phys_w * bpp);
        for phys_y in phys_y0..phys_y1 {
            let src_y = ((phys_y as f32 / scale_y) as u32).clamp(y, y + height - 1) - y;
            let row_rgb = &rgb[(src_y * width * 3) as usize..((src_y + 1) * width * 3) as usize];

            native_row.clear();
            for px in 0..phys_w {
                let src_x = ((px as f32 / scale_x) as u32).min(width - 1) as usize;
                let p = &row_rgb[src_x * 3..src_x * 3 + 3];
                match self.geometry.format {
                    PixelFormat::Rgb565 => {
                        native_row.extend_from_slice(&pack_rgb565(p[0], p[1], p[2]).to_le_bytes())
                    }
                    PixelFormat::Bgra32 => native_row.extend_from_slice(&pack_bgra(p[0], p[1], p[2])),
                }
            }

            let offset = phys_y * self.geometry.stride + phys_x * bpp;
            let end = offset + native_row.len();
            // the map was validated at open, but stride lies on some drivers
            if end > self.map.len() {
                bail!("framebuffer write past end of map ({} > {})", end, self.map.len());
            }
            self.map[offset..end].copy_from_slice(&native_row);
        }

        self.writes += 1;
        Ok(())
    }

    fn writes(&self) -> u64 {
        self.writes
    }
}

fn region_height(width: u32, rgb: &[u8]) -> Result<u32> {
    if width == 0 || rgb.len() % (width as usize * 3) != 0 {
        bail!("region byte length {} not a multiple of row size", rgb.len());
    }
    Ok((rgb.len() / (width as usize * 3)) as u32)
}

/// Test sink: records writes against a virtual panel without a device.
pub struct RecordingSink {
    geometry: FbGeometry,
    render_w: u32,
    render_h: u32,
    pub regions: Vec<(u32, u32, u32, u32)>,
    writes: u64,
}

impl RecordingSink {
    pub fn new(width: u32, height: u32) -> Self {
        let geometry = FbGeometry {
            width,
            height,
            format: PixelFormat::Bgra32,
            stride: width as usize * 4,
        };
        let (render_w, render_h) = render_size(&geometry);
        Self {
            geometry,
            render_w,
            render_h,
            regions: Vec::new(),
            writes: 0,
        }
    }
}

impl FrameSink for RecordingSink {
    fn geometry(&self) -> FbGeometry {
        self.geometry
    }

    fn write_region(&mut self, x: u32, y: u32, width: u32, rgb: &[u8]) -> Result<()> {
        let height = region_height(width, rgb)?;
        if x + width > self.render_w || y + height > self.render_h {
            bail!("out-of-bounds write");
        }
        self.regions.push((x, y, width, height));
        self.writes += 1;
        Ok(())
    }

    fn writes(&self) -> u64 {
        self.writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb565_packing_is_lossless_at_channel_extremes() {
        assert_eq!(pack_rgb565(0, 0, 0), 0x0000);
        assert_eq!(pack_rgb565(255, 255, 255), 0xFFFF);
        assert_eq!(pack_rgb565(255, 0, 0), 0xF800);
        assert_eq!(pack_rgb565(0, 255, 0), 0x07E0);
        assert_eq!(pack_rgb565(0, 0, 255), 0x001F);
    }

    #[test]
    fn rgb565_widens_before_shifting() {
        // a mid-level red must land in the high bits, not be shifted out
        let packed = pack_rgb565(0x88, 0, 0);
        assert_eq!(packed >> 11, u16::from(0x88u8 >> 3));
    }

    #[test]
    fn bgra_channel_order() {
        assert_eq!(pack_bgra(1, 2, 3), [3, 2, 1, 0xFF]);
    }

    #[test]
    fn convert_row_lengths() {
        let rgb = [10u8, 20, 30, 40, 50, 60];
        let mut out = Vec::new();
        convert_row(&rgb, PixelFormat::Rgb565, &mut out);
        assert_eq!(out.len(), 4);
        convert_row(&rgb, PixelFormat::Bgra32, &mut out);
        assert_eq!(out.len(), 8);
        assert_eq!(&out[0..4], &[30, 20, 10, 0xFF]);
    }

    #[test]
    fn render_size_is_capped() {
        let huge = FbGeometry {
            width: 3840,
            height: 2160,
            format: PixelFormat::Bgra32,
            stride: 3840 * 4,
        };
        assert_eq!(render_size(&huge), (1920, 1080));

        let small = FbGeometry {
            width: 1024,
            height: 600,
            format: PixelFormat::Rgb565,
            stride: 2048,
        };
        assert_eq!(render_size(&small), (1024, 600));
    }

    #[test]
    fn out_of_bounds_region_is_rejected() {
        let mut sink = RecordingSink::new(100, 100);
        let row = vec![0u8; 10 * 3];
        assert!(sink.write_region(95, 0, 10, &row).is_err());
        assert!(sink.write_region(0, 99, 10, &vec![0u8; 10 * 3 * 2]).is_err());
        assert!(sink.write_region(0, 0, 10, &row).is_ok());
        assert_eq!(sink.writes(), 1);
    }

    #[test]
    fn malformed_region_length_is_rejected() {
        let mut sink = RecordingSink::new(100, 100);
        assert!(sink.write_region(0, 0, 10, &vec![0u8; 31]).is_err());
    }

    #[test]
    fn resolution_parse() {
        assert_eq!(parse_resolution("1024x600"), Some((1024, 600)));
        assert_eq!(parse_resolution("1920X1080"), Some((1920, 1080)));
        assert_eq!(parse_resolution("garbage"), None);
    }
}
